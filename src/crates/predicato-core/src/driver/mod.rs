//! Graph driver capability consumed by the pipeline.
//!
//! The orchestrator never talks to a database directly; it produces node
//! and edge deltas and commits them through this narrow interface.
//! Backends (embedded KV stores, remote graph databases) implement
//! [`GraphDriver`]; the crate ships [`InMemoryGraphDriver`] as the
//! reference implementation and test backend.
//!
//! All operations are scoped to a `group_id` - a tenant partition. A
//! driver must never return elements from another group, and writes are
//! expected to be atomic at the single-node/single-edge level. Upserts
//! key on `(group_id, uuid)`, which is what lets the commit stage replay
//! safely after a partial failure.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use predicato_graph::{Edge, Node, NodeType};

use crate::error::Result;

pub use memory::InMemoryGraphDriver;

/// Options for name/full-text node search.
#[derive(Debug, Clone)]
pub struct NodeSearchOptions {
    /// Maximum results.
    pub limit: usize,
    /// Match on full node text instead of names only.
    pub use_full_text: bool,
    /// Restrict to these node kinds; empty means all.
    pub node_types: Vec<NodeType>,
    /// Restrict to nodes whose `valid_from` falls in this window.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Default for NodeSearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            use_full_text: false,
            node_types: Vec::new(),
            time_range: None,
        }
    }
}

impl NodeSearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_node_types(mut self, node_types: Vec<NodeType>) -> Self {
        self.node_types = node_types;
        self
    }

    pub fn with_full_text(mut self, use_full_text: bool) -> Self {
        self.use_full_text = use_full_text;
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some((start, end));
        self
    }
}

/// Options for vector similarity node search.
#[derive(Debug, Clone)]
pub struct VectorSearchOptions {
    /// Maximum results.
    pub limit: usize,
    /// Drop results below this cosine similarity.
    pub min_score: f32,
    /// Restrict to these node kinds; empty means all.
    pub node_types: Vec<NodeType>,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            min_score: 0.0,
            node_types: Vec::new(),
        }
    }
}

impl VectorSearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_node_types(mut self, node_types: Vec<NodeType>) -> Self {
        self.node_types = node_types;
        self
    }
}

/// Options for edge search, by text or by vector.
#[derive(Debug, Clone)]
pub struct EdgeSearchOptions {
    /// Maximum results.
    pub limit: usize,
    /// Drop vector results below this cosine similarity.
    pub min_score: f32,
    /// Restrict to edges incident to any of these nodes; empty means all.
    pub node_ids: Vec<Uuid>,
    /// Restrict to these edge kinds; empty means all.
    pub edge_types: Vec<predicato_graph::EdgeType>,
}

impl Default for EdgeSearchOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            min_score: 0.0,
            node_ids: Vec::new(),
            edge_types: Vec::new(),
        }
    }
}

impl EdgeSearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_node_ids(mut self, node_ids: Vec<Uuid>) -> Self {
        self.node_ids = node_ids;
        self
    }

    pub fn with_edge_types(mut self, edge_types: Vec<predicato_graph::EdgeType>) -> Self {
        self.edge_types = edge_types;
        self
    }
}

/// Per-group graph statistics.
#[derive(Debug, Clone, Default)]
pub struct GraphStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes_by_type: HashMap<String, usize>,
    pub edges_by_type: HashMap<String, usize>,
}

/// Read/write access to the persisted property graph.
#[async_trait]
pub trait GraphDriver: Send + Sync {
    /// Create indices and constraints. Idempotent.
    async fn create_indices(&self) -> Result<()>;

    /// Insert or replace a node, keyed on `(group_id, uuid)`.
    async fn upsert_node(&self, node: &Node) -> Result<()>;

    /// Insert or replace an edge, keyed on `(group_id, uuid)`.
    async fn upsert_edge(&self, edge: &Edge) -> Result<()>;

    /// Fetch a node by id.
    async fn get_node(&self, uuid: Uuid, group_id: &str) -> Result<Option<Node>>;

    /// Fetch an edge by id.
    async fn get_edge(&self, uuid: Uuid, group_id: &str) -> Result<Option<Edge>>;

    /// Remove a node. Missing ids succeed.
    async fn delete_node(&self, uuid: Uuid, group_id: &str) -> Result<()>;

    /// Remove an edge. Missing ids succeed.
    async fn delete_edge(&self, uuid: Uuid, group_id: &str) -> Result<()>;

    /// Name (or full-text) search over nodes, best match first.
    async fn search_nodes(
        &self,
        query: &str,
        group_id: &str,
        options: &NodeSearchOptions,
    ) -> Result<Vec<Node>>;

    /// Vector similarity search over nodes, best match first.
    async fn search_nodes_by_vector(
        &self,
        vector: &[f32],
        group_id: &str,
        options: &VectorSearchOptions,
    ) -> Result<Vec<Node>>;

    /// Text search over edge facts, best match first.
    async fn search_edges(
        &self,
        query: &str,
        group_id: &str,
        options: &EdgeSearchOptions,
    ) -> Result<Vec<Edge>>;

    /// Vector similarity search over edge facts, best match first.
    async fn search_edges_by_vector(
        &self,
        vector: &[f32],
        group_id: &str,
        options: &EdgeSearchOptions,
    ) -> Result<Vec<Edge>>;

    /// All edges connecting `source_id` and `target_id`, in either
    /// direction.
    async fn get_edges_between(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        group_id: &str,
    ) -> Result<Vec<Edge>>;

    /// Nodes whose `valid_from` lies in `[start, end)`.
    async fn get_nodes_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        group_id: &str,
    ) -> Result<Vec<Node>>;

    /// Nodes reachable from `node_id` within `max_distance` hops.
    async fn get_neighbors(
        &self,
        node_id: Uuid,
        group_id: &str,
        max_distance: usize,
    ) -> Result<Vec<Node>>;

    /// The most recent episodic nodes before `before`, newest first.
    async fn get_recent_episodes(
        &self,
        group_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Node>>;

    /// Aggregate counts for a group.
    async fn get_stats(&self, group_id: &str) -> Result<GraphStats>;
}
