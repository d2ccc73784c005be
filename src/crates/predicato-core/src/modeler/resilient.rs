//! Error-handling wrapper around a primary modeler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::modeler::{
    CommunityInput, CommunityOutput, EntityResolutionInput, EntityResolutionOutput,
    GraphModeler, RelationshipResolutionInput, RelationshipResolutionOutput,
};

/// What to do when a modeler step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorMode {
    /// Propagate the failure to the orchestrator.
    Fail,
    /// Log, then run the default modeler for that step.
    #[default]
    Fallback,
    /// Log, then continue with the step's neutral output.
    Skip,
}

/// Wraps a primary modeler with the configured [`ErrorMode`].
///
/// Under `Fallback`, a failing step is re-run on the fallback modeler
/// (typically [`DefaultModeler`](crate::modeler::DefaultModeler)); under
/// `Skip`, entity resolution degrades to the identity mapping,
/// relationship resolution to the passthrough, and community building to
/// `None`. Every intercepted failure is logged with the step name.
pub struct ResilientModeler {
    primary: Arc<dyn GraphModeler>,
    fallback: Arc<dyn GraphModeler>,
    mode: ErrorMode,
}

impl ResilientModeler {
    pub fn new(primary: Arc<dyn GraphModeler>, fallback: Arc<dyn GraphModeler>) -> Self {
        Self {
            primary,
            fallback,
            mode: ErrorMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ErrorMode) -> Self {
        self.mode = mode;
        self
    }

    fn wrap(step: &'static str, fallback: bool, skipped: bool, source: CoreError) -> CoreError {
        CoreError::Modeler {
            step,
            fallback,
            skipped,
            source: Box::new(source),
        }
    }
}

#[async_trait]
impl GraphModeler for ResilientModeler {
    async fn resolve_entities(
        &self,
        input: EntityResolutionInput,
    ) -> Result<EntityResolutionOutput> {
        match self.primary.resolve_entities(input.clone()).await {
            Ok(output) => Ok(output),
            Err(err) => match self.mode {
                ErrorMode::Fail => Err(Self::wrap("resolve_entities", false, false, err)),
                ErrorMode::Fallback => {
                    warn!(step = "resolve_entities", error = %err, "primary modeler failed, falling back");
                    self.fallback
                        .resolve_entities(input)
                        .await
                        .map_err(|err| Self::wrap("resolve_entities", true, false, err))
                }
                ErrorMode::Skip => {
                    warn!(step = "resolve_entities", error = %err, "primary modeler failed, skipping");
                    Ok(EntityResolutionOutput::identity(&input.extracted_nodes))
                }
            },
        }
    }

    async fn resolve_relationships(
        &self,
        input: RelationshipResolutionInput,
    ) -> Result<RelationshipResolutionOutput> {
        match self.primary.resolve_relationships(input.clone()).await {
            Ok(output) => Ok(output),
            Err(err) => match self.mode {
                ErrorMode::Fail => Err(Self::wrap("resolve_relationships", false, false, err)),
                ErrorMode::Fallback => {
                    warn!(step = "resolve_relationships", error = %err, "primary modeler failed, falling back");
                    self.fallback
                        .resolve_relationships(input)
                        .await
                        .map_err(|err| Self::wrap("resolve_relationships", true, false, err))
                }
                ErrorMode::Skip => {
                    warn!(step = "resolve_relationships", error = %err, "primary modeler failed, skipping");
                    Ok(RelationshipResolutionOutput::passthrough(&input))
                }
            },
        }
    }

    async fn build_communities(&self, input: CommunityInput) -> Result<Option<CommunityOutput>> {
        match self.primary.build_communities(input.clone()).await {
            Ok(output) => Ok(output),
            Err(err) => match self.mode {
                ErrorMode::Fail => Err(Self::wrap("build_communities", false, false, err)),
                ErrorMode::Fallback => {
                    warn!(step = "build_communities", error = %err, "primary modeler failed, falling back");
                    self.fallback
                        .build_communities(input)
                        .await
                        .map_err(|err| Self::wrap("build_communities", true, false, err))
                }
                ErrorMode::Skip => {
                    warn!(step = "build_communities", error = %err, "primary modeler failed, skipping");
                    Ok(None)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlpErrorKind;
    use predicato_graph::{Episode, IngestionOptions, Node};

    struct FailingModeler;

    #[async_trait]
    impl GraphModeler for FailingModeler {
        async fn resolve_entities(
            &self,
            _input: EntityResolutionInput,
        ) -> Result<EntityResolutionOutput> {
            Err(CoreError::nlp(NlpErrorKind::Refusal, "no"))
        }

        async fn resolve_relationships(
            &self,
            _input: RelationshipResolutionInput,
        ) -> Result<RelationshipResolutionOutput> {
            Err(CoreError::nlp(NlpErrorKind::Refusal, "no"))
        }

        async fn build_communities(
            &self,
            _input: CommunityInput,
        ) -> Result<Option<CommunityOutput>> {
            Err(CoreError::nlp(NlpErrorKind::Refusal, "no"))
        }
    }

    struct IdentityModeler;

    #[async_trait]
    impl GraphModeler for IdentityModeler {
        async fn resolve_entities(
            &self,
            input: EntityResolutionInput,
        ) -> Result<EntityResolutionOutput> {
            Ok(EntityResolutionOutput::identity(&input.extracted_nodes))
        }

        async fn resolve_relationships(
            &self,
            input: RelationshipResolutionInput,
        ) -> Result<RelationshipResolutionOutput> {
            Ok(RelationshipResolutionOutput::passthrough(&input))
        }

        async fn build_communities(
            &self,
            _input: CommunityInput,
        ) -> Result<Option<CommunityOutput>> {
            Ok(None)
        }
    }

    fn entity_input() -> EntityResolutionInput {
        EntityResolutionInput {
            extracted_nodes: vec![Node::entity("g", "Alice")],
            episode: Episode::new("ep", "g", "hello"),
            previous_episodes: Vec::new(),
            group_id: "g".to_string(),
            options: IngestionOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_fail_mode_wraps_with_step_name() {
        let modeler = ResilientModeler::new(Arc::new(FailingModeler), Arc::new(IdentityModeler))
            .with_mode(ErrorMode::Fail);
        let err = modeler.resolve_entities(entity_input()).await.unwrap_err();
        match err {
            CoreError::Modeler { step, fallback, skipped, .. } => {
                assert_eq!(step, "resolve_entities");
                assert!(!fallback);
                assert!(!skipped);
            }
            other => panic!("expected Modeler error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_fallback_mode_uses_fallback_modeler() {
        let modeler = ResilientModeler::new(Arc::new(FailingModeler), Arc::new(IdentityModeler))
            .with_mode(ErrorMode::Fallback);
        let output = modeler.resolve_entities(entity_input()).await.unwrap();
        assert_eq!(output.new_count, 1);
    }

    #[tokio::test]
    async fn test_skip_mode_returns_identity() {
        let modeler = ResilientModeler::new(Arc::new(FailingModeler), Arc::new(FailingModeler))
            .with_mode(ErrorMode::Skip);
        let output = modeler.resolve_entities(entity_input()).await.unwrap();
        assert_eq!(output.new_count, 1);
        assert!(modeler
            .build_communities(CommunityInput {
                resolved_nodes: Vec::new(),
                resolved_edges: Vec::new(),
                group_id: "g".to_string(),
            })
            .await
            .unwrap()
            .is_none());
    }
}
