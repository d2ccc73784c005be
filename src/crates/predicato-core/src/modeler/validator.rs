//! Validation harness for modeler implementations.
//!
//! Before a custom modeler serves production traffic, run it through
//! [`validate_modeler`]: the harness synthesizes nodes, edges, and an
//! episode, drives each of the three operations with every `skip_*`
//! option set (so no NLP traffic is required), times each step, and
//! checks the contract - non-null outputs and a uuid map that covers
//! every extracted node. A community failure or skip is recorded as a
//! warning, never as an invalid result.

use std::time::Instant;

use chrono::Utc;
use tracing::info;

use predicato_graph::{Edge, Episode, IngestionOptions, Node};

use crate::modeler::{CommunityInput, EntityResolutionInput, GraphModeler, RelationshipResolutionInput};

/// Outcome of one validated operation.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: &'static str,
    pub duration: std::time::Duration,
    pub ok: bool,
    pub error: Option<String>,
}

/// Outcome of a full validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub steps: Vec<StepReport>,
    pub warnings: Vec<String>,
    pub valid: bool,
}

fn synthetic_options() -> IngestionOptions {
    IngestionOptions::new()
        .with_skip_resolution(true)
        .with_skip_reflexion(true)
        .with_skip_attributes(true)
        .with_skip_edge_resolution(true)
}

/// Exercise all three modeler operations with synthetic data.
pub async fn validate_modeler(modeler: &dyn GraphModeler, group_id: &str) -> ValidationReport {
    let mut report = ValidationReport {
        valid: true,
        ..Default::default()
    };

    let episode = Episode::new("validation-episode", group_id, "Ada founded Babbage Industries.")
        .with_reference_time(Utc::now());
    let episode_node = Node::episodic(
        group_id,
        &episode.name,
        &episode.content,
        episode.reference_time,
    );
    let extracted = vec![
        Node::entity(group_id, "Ada").with_entity_type("PERSON"),
        Node::entity(group_id, "Babbage Industries").with_entity_type("ORGANIZATION"),
        Node::entity(group_id, "London"),
    ];
    let extracted_edges = vec![
        Edge::entity(
            group_id,
            extracted[0].uuid,
            extracted[1].uuid,
            "FOUNDED",
            "Ada founded Babbage Industries.",
        ),
        Edge::entity(
            group_id,
            extracted[1].uuid,
            extracted[2].uuid,
            "BASED_IN",
            "Babbage Industries is based in London.",
        ),
    ];

    // resolve_entities
    let started = Instant::now();
    let entity_input = EntityResolutionInput {
        extracted_nodes: extracted.clone(),
        episode: episode.clone(),
        previous_episodes: Vec::new(),
        group_id: group_id.to_string(),
        options: synthetic_options(),
    };
    let entity_output = match modeler.resolve_entities(entity_input).await {
        Ok(output) => {
            let covered = extracted
                .iter()
                .all(|node| output.uuid_map.contains_key(&node.uuid));
            let ok = covered && !output.resolved_nodes.is_empty();
            report.steps.push(StepReport {
                name: "resolve_entities",
                duration: started.elapsed(),
                ok,
                error: (!covered).then(|| "uuid_map does not cover every extracted node".into()),
            });
            report.valid &= ok;
            Some(output)
        }
        Err(err) => {
            report.steps.push(StepReport {
                name: "resolve_entities",
                duration: started.elapsed(),
                ok: false,
                error: Some(err.to_string()),
            });
            report.valid = false;
            None
        }
    };

    // resolve_relationships
    let started = Instant::now();
    match entity_output {
        Some(entity_output) => {
            let relationship_input = RelationshipResolutionInput {
                extracted_edges,
                resolved_nodes: entity_output.resolved_nodes.clone(),
                uuid_map: entity_output.uuid_map.clone(),
                duplicate_pairs: Vec::new(),
                episode: episode.clone(),
                episode_node,
                previous_episodes: Vec::new(),
                group_id: group_id.to_string(),
                options: synthetic_options(),
            };
            match modeler.resolve_relationships(relationship_input).await {
                Ok(output) => {
                    let ok = output.episodic_edges.len() == entity_output.resolved_nodes.len();
                    report.steps.push(StepReport {
                        name: "resolve_relationships",
                        duration: started.elapsed(),
                        ok,
                        error: (!ok)
                            .then(|| "expected one episodic edge per resolved entity".into()),
                    });
                    report.valid &= ok;
                }
                Err(err) => {
                    report.steps.push(StepReport {
                        name: "resolve_relationships",
                        duration: started.elapsed(),
                        ok: false,
                        error: Some(err.to_string()),
                    });
                    report.valid = false;
                }
            }
        }
        None => {
            report.steps.push(StepReport {
                name: "resolve_relationships",
                duration: started.elapsed(),
                ok: false,
                error: Some("skipped: entity resolution failed".into()),
            });
            report.valid = false;
        }
    }

    // build_communities: a skip or failure is a warning, not invalid.
    let started = Instant::now();
    let community_input = CommunityInput {
        resolved_nodes: extracted,
        resolved_edges: Vec::new(),
        group_id: group_id.to_string(),
    };
    match modeler.build_communities(community_input).await {
        Ok(Some(_)) => report.steps.push(StepReport {
            name: "build_communities",
            duration: started.elapsed(),
            ok: true,
            error: None,
        }),
        Ok(None) => {
            report.warnings.push("community building skipped".into());
            report.steps.push(StepReport {
                name: "build_communities",
                duration: started.elapsed(),
                ok: true,
                error: None,
            });
        }
        Err(err) => {
            report
                .warnings
                .push(format!("community building failed: {err}"));
            report.steps.push(StepReport {
                name: "build_communities",
                duration: started.elapsed(),
                ok: true,
                error: Some(err.to_string()),
            });
        }
    }

    info!(
        valid = report.valid,
        warnings = report.warnings.len(),
        "modeler validation finished"
    );
    report
}
