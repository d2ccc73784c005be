//! The graph modeler contract - policy separated from plumbing.
//!
//! The orchestrator drives stages; *how* extractions become graph
//! deltas is policy, owned by a [`GraphModeler`]. Swapping resolution
//! strategy, dedup heuristics, or community building means substituting
//! a modeler; the orchestrator and checkpoint manager never see NLP
//! details.
//!
//! Three operations make up the contract:
//!
//! - [`resolve_entities`](GraphModeler::resolve_entities) - map extracted
//!   entity mentions onto existing nodes or mint new ones. The returned
//!   uuid map is total over the input; identity when resolution is
//!   skipped; `new_count + merged_count` equals the resolved set size.
//! - [`resolve_relationships`](GraphModeler::resolve_relationships) -
//!   rewrite endpoints through the uuid map, resolve against existing
//!   edges, invalidate superseded facts, and build one MENTIONED_IN
//!   episodic edge per resolved entity.
//! - [`build_communities`](GraphModeler::build_communities) - optionally
//!   refresh community nodes. Returning `None` is a valid skip and is
//!   warning-only under validation.
//!
//! [`DefaultModeler`] composes the node, edge, and temporal operations;
//! [`ResilientModeler`] wraps any modeler with the configured
//! [`ErrorMode`]; [`validate_modeler`] exercises all three operations
//! with synthetic data before production use.

pub mod default;
pub mod resilient;
pub mod validator;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use predicato_graph::{Edge, Episode, IngestionOptions, Node};

use crate::error::Result;

pub use default::{
    CommunityBuilder, ConnectedComponentCommunities, DefaultModeler, ModelerClients,
};
pub use resilient::{ErrorMode, ResilientModeler};
pub use validator::{validate_modeler, StepReport, ValidationReport};

/// Input to entity resolution.
#[derive(Debug, Clone)]
pub struct EntityResolutionInput {
    /// Freshly extracted entity mentions, all chunks flattened.
    pub extracted_nodes: Vec<Node>,
    /// The episode being ingested.
    pub episode: Episode,
    /// Recent episodic nodes for context.
    pub previous_episodes: Vec<Node>,
    /// Tenant partition.
    pub group_id: String,
    /// Policy knobs (`skip_resolution`, `similarity_threshold`, ...).
    pub options: IngestionOptions,
}

/// Output of entity resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityResolutionOutput {
    /// Entities after resolution, one per distinct mention.
    pub resolved_nodes: Vec<Node>,
    /// Extracted uuid -> resolved uuid; total over the input.
    pub uuid_map: HashMap<Uuid, Uuid>,
    /// `(mention, existing)` pairs awaiting IS_DUPLICATE_OF edges.
    pub duplicate_pairs: Vec<(Uuid, Uuid)>,
    /// Mentions merged into existing nodes.
    pub merged_count: usize,
    /// Mentions kept as new nodes.
    pub new_count: usize,
}

impl EntityResolutionOutput {
    /// The identity resolution: every mention is new, the uuid map is
    /// the identity over the distinct mentions.
    pub fn identity(extracted_nodes: &[Node]) -> Self {
        let mut output = Self::default();
        for node in extracted_nodes {
            output.uuid_map.insert(node.uuid, node.uuid);
            output.resolved_nodes.push(node.clone());
        }
        output.new_count = output.resolved_nodes.len();
        output
    }
}

/// Input to relationship resolution.
#[derive(Debug, Clone)]
pub struct RelationshipResolutionInput {
    /// Freshly extracted edges, all chunks flattened.
    pub extracted_edges: Vec<Edge>,
    /// Entities after resolution.
    pub resolved_nodes: Vec<Node>,
    /// Extracted uuid -> resolved uuid, applied to every endpoint.
    pub uuid_map: HashMap<Uuid, Uuid>,
    /// Duplicate pairs surviving entity resolution.
    pub duplicate_pairs: Vec<(Uuid, Uuid)>,
    /// The episode being ingested.
    pub episode: Episode,
    /// The episodic node standing for the episode.
    pub episode_node: Node,
    /// Recent episodic nodes for context.
    pub previous_episodes: Vec<Node>,
    /// Tenant partition.
    pub group_id: String,
    /// Policy knobs.
    pub options: IngestionOptions,
}

/// Output of relationship resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipResolutionOutput {
    /// Union of new and kept-existing edges, IS_DUPLICATE_OF included.
    pub resolved_edges: Vec<Edge>,
    /// Prior edges closed by this episode (`valid_to` written).
    pub invalidated_edges: Vec<Edge>,
    /// MENTIONED_IN edges from the episode node to each entity.
    pub episodic_edges: Vec<Edge>,
    /// Edges minted fresh.
    pub new_count: usize,
    /// Extractions folded into existing edges.
    pub updated_count: usize,
}

impl RelationshipResolutionOutput {
    /// The passthrough resolution: every extracted edge kept as new,
    /// nothing invalidated.
    pub fn passthrough(input: &RelationshipResolutionInput) -> Self {
        let episodic_edges = crate::ops::edges::build_episodic_edges(
            &input.episode_node,
            &input.resolved_nodes,
        );
        Self {
            new_count: input.extracted_edges.len(),
            resolved_edges: input.extracted_edges.clone(),
            invalidated_edges: Vec::new(),
            episodic_edges,
            updated_count: 0,
        }
    }
}

/// Input to community building.
#[derive(Debug, Clone)]
pub struct CommunityInput {
    /// Entities touched by this episode.
    pub resolved_nodes: Vec<Node>,
    /// Edges resolved for this episode.
    pub resolved_edges: Vec<Edge>,
    /// Tenant partition.
    pub group_id: String,
}

/// Output of community building.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunityOutput {
    pub communities: Vec<Node>,
    pub community_edges: Vec<Edge>,
}

/// Resolution policy consumed by the orchestrator.
#[async_trait]
pub trait GraphModeler: Send + Sync {
    /// Map extracted entity mentions onto the existing graph.
    async fn resolve_entities(
        &self,
        input: EntityResolutionInput,
    ) -> Result<EntityResolutionOutput>;

    /// Resolve extracted relationships against existing edges.
    async fn resolve_relationships(
        &self,
        input: RelationshipResolutionInput,
    ) -> Result<RelationshipResolutionOutput>;

    /// Refresh communities. `None` is a valid skip.
    async fn build_communities(&self, input: CommunityInput) -> Result<Option<CommunityOutput>>;
}
