//! In-memory reference implementation of [`GraphDriver`].
//!
//! Backed by `parking_lot` read/write-locked maps keyed on
//! `(group_id, uuid)`. Name search scores case-insensitive exact,
//! substring, and token-overlap matches; vector search ranks by cosine
//! similarity over `name_embedding` (nodes) or `embedding` (edges).
//! Suitable for tests, validation harnesses, and small embedded
//! deployments; not a durability story.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use predicato_graph::{Edge, Node, NodeType};

use crate::driver::{
    EdgeSearchOptions, GraphDriver, GraphStats, NodeSearchOptions, VectorSearchOptions,
};
use crate::embedder::cosine_similarity;
use crate::error::Result;

#[derive(Default)]
struct GraphState {
    nodes: HashMap<(String, Uuid), Node>,
    edges: HashMap<(String, Uuid), Edge>,
}

/// Reference in-memory graph backend.
#[derive(Default)]
pub struct InMemoryGraphDriver {
    state: RwLock<GraphState>,
}

impl InMemoryGraphDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total node count across all groups.
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Total edge count across all groups.
    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }
}

fn name_score(query: &str, node: &Node, use_full_text: bool) -> f32 {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    let name = node.name.to_lowercase();
    if name == query {
        return 1.0;
    }
    let mut haystack = name.clone();
    if use_full_text {
        haystack.push(' ');
        haystack.push_str(&node.summary.to_lowercase());
        if let Some(content) = &node.content {
            haystack.push(' ');
            haystack.push_str(&content.to_lowercase());
        }
    }
    if haystack.contains(&query) || query.contains(&name) {
        return 0.75;
    }
    let query_tokens: HashSet<&str> = query.split_whitespace().collect();
    let hay_tokens: HashSet<&str> = haystack.split_whitespace().collect();
    let overlap = query_tokens.intersection(&hay_tokens).count();
    if overlap == 0 {
        0.0
    } else {
        0.5 * overlap as f32 / query_tokens.len() as f32
    }
}

fn node_type_allowed(node: &Node, types: &[NodeType]) -> bool {
    types.is_empty() || types.contains(&node.node_type)
}

#[async_trait]
impl GraphDriver for InMemoryGraphDriver {
    async fn create_indices(&self) -> Result<()> {
        // Maps are their own index.
        Ok(())
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        self.state
            .write()
            .nodes
            .insert((node.group_id.clone(), node.uuid), node.clone());
        Ok(())
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<()> {
        self.state
            .write()
            .edges
            .insert((edge.group_id.clone(), edge.uuid), edge.clone());
        Ok(())
    }

    async fn get_node(&self, uuid: Uuid, group_id: &str) -> Result<Option<Node>> {
        Ok(self
            .state
            .read()
            .nodes
            .get(&(group_id.to_string(), uuid))
            .cloned())
    }

    async fn get_edge(&self, uuid: Uuid, group_id: &str) -> Result<Option<Edge>> {
        Ok(self
            .state
            .read()
            .edges
            .get(&(group_id.to_string(), uuid))
            .cloned())
    }

    async fn delete_node(&self, uuid: Uuid, group_id: &str) -> Result<()> {
        self.state.write().nodes.remove(&(group_id.to_string(), uuid));
        Ok(())
    }

    async fn delete_edge(&self, uuid: Uuid, group_id: &str) -> Result<()> {
        self.state.write().edges.remove(&(group_id.to_string(), uuid));
        Ok(())
    }

    async fn search_nodes(
        &self,
        query: &str,
        group_id: &str,
        options: &NodeSearchOptions,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut scored: Vec<(f32, &Node)> = state
            .nodes
            .values()
            .filter(|node| node.group_id == group_id)
            .filter(|node| node_type_allowed(node, &options.node_types))
            .filter(|node| {
                options.time_range.map_or(true, |(start, end)| {
                    node.valid_from >= start && node.valid_from < end
                })
            })
            .filter_map(|node| {
                let score = name_score(query, node, options.use_full_text);
                (score > 0.0).then_some((score, node))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.uuid.cmp(&b.1.uuid))
        });
        Ok(scored
            .into_iter()
            .take(options.limit)
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn search_nodes_by_vector(
        &self,
        vector: &[f32],
        group_id: &str,
        options: &VectorSearchOptions,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut scored: Vec<(f32, &Node)> = state
            .nodes
            .values()
            .filter(|node| node.group_id == group_id)
            .filter(|node| node_type_allowed(node, &options.node_types))
            .filter_map(|node| {
                let candidate = node.name_embedding.as_ref().or(node.embedding.as_ref())?;
                let score = cosine_similarity(vector, candidate);
                (score >= options.min_score && score > 0.0).then_some((score, node))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.uuid.cmp(&b.1.uuid))
        });
        Ok(scored
            .into_iter()
            .take(options.limit)
            .map(|(_, node)| node.clone())
            .collect())
    }

    async fn search_edges(
        &self,
        query: &str,
        group_id: &str,
        options: &EdgeSearchOptions,
    ) -> Result<Vec<Edge>> {
        let query = query.trim().to_lowercase();
        let state = self.state.read();
        let mut matches: Vec<&Edge> = state
            .edges
            .values()
            .filter(|edge| edge.group_id == group_id)
            .filter(|edge| {
                options.edge_types.is_empty() || options.edge_types.contains(&edge.edge_type)
            })
            .filter(|edge| {
                options.node_ids.is_empty()
                    || options.node_ids.contains(&edge.source_id)
                    || options.node_ids.contains(&edge.target_id)
            })
            .filter(|edge| {
                query.is_empty()
                    || edge.name.to_lowercase().contains(&query)
                    || edge.summary.to_lowercase().contains(&query)
            })
            .collect();
        matches.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(matches
            .into_iter()
            .take(options.limit)
            .cloned()
            .collect())
    }

    async fn search_edges_by_vector(
        &self,
        vector: &[f32],
        group_id: &str,
        options: &EdgeSearchOptions,
    ) -> Result<Vec<Edge>> {
        let state = self.state.read();
        let mut scored: Vec<(f32, &Edge)> = state
            .edges
            .values()
            .filter(|edge| edge.group_id == group_id)
            .filter(|edge| {
                options.edge_types.is_empty() || options.edge_types.contains(&edge.edge_type)
            })
            .filter_map(|edge| {
                let embedding = edge.embedding.as_ref()?;
                let score = cosine_similarity(vector, embedding);
                (score >= options.min_score && score > 0.0).then_some((score, edge))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.uuid.cmp(&b.1.uuid))
        });
        Ok(scored
            .into_iter()
            .take(options.limit)
            .map(|(_, edge)| edge.clone())
            .collect())
    }

    async fn get_edges_between(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        group_id: &str,
    ) -> Result<Vec<Edge>> {
        let state = self.state.read();
        let mut edges: Vec<Edge> = state
            .edges
            .values()
            .filter(|edge| edge.group_id == group_id)
            .filter(|edge| {
                (edge.source_id == source_id && edge.target_id == target_id)
                    || (edge.source_id == target_id && edge.target_id == source_id)
            })
            .cloned()
            .collect();
        edges.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(edges)
    }

    async fn get_nodes_in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        group_id: &str,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut nodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| node.group_id == group_id)
            .filter(|node| node.valid_from >= start && node.valid_from < end)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        Ok(nodes)
    }

    async fn get_neighbors(
        &self,
        node_id: Uuid,
        group_id: &str,
        max_distance: usize,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut visited: HashSet<Uuid> = HashSet::from([node_id]);
        let mut frontier: VecDeque<(Uuid, usize)> = VecDeque::from([(node_id, 0)]);
        let mut found: Vec<Uuid> = Vec::new();

        while let Some((current, distance)) = frontier.pop_front() {
            if distance >= max_distance {
                continue;
            }
            for edge in state.edges.values().filter(|e| e.group_id == group_id) {
                let next = if edge.source_id == current {
                    edge.target_id
                } else if edge.target_id == current {
                    edge.source_id
                } else {
                    continue;
                };
                if visited.insert(next) {
                    found.push(next);
                    frontier.push_back((next, distance + 1));
                }
            }
        }

        let mut nodes: Vec<Node> = found
            .into_iter()
            .filter_map(|uuid| state.nodes.get(&(group_id.to_string(), uuid)).cloned())
            .collect();
        nodes.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(nodes)
    }

    async fn get_recent_episodes(
        &self,
        group_id: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Node>> {
        let state = self.state.read();
        let mut episodes: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| node.group_id == group_id)
            .filter(|node| node.node_type == NodeType::Episodic)
            .filter(|node| node.valid_from < before)
            .cloned()
            .collect();
        episodes.sort_by(|a, b| b.valid_from.cmp(&a.valid_from));
        episodes.truncate(limit);
        Ok(episodes)
    }

    async fn get_stats(&self, group_id: &str) -> Result<GraphStats> {
        let state = self.state.read();
        let mut stats = GraphStats::default();
        for node in state.nodes.values().filter(|n| n.group_id == group_id) {
            stats.node_count += 1;
            let tag = format!("{:?}", node.node_type).to_lowercase();
            *stats.nodes_by_type.entry(tag).or_insert(0) += 1;
        }
        for edge in state.edges.values().filter(|e| e.group_id == group_id) {
            stats.edge_count += 1;
            let tag = format!("{:?}", edge.edge_type).to_lowercase();
            *stats.edges_by_type.entry(tag).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
