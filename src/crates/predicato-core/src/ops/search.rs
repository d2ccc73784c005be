//! Candidate ranking helpers for entity resolution.

use std::collections::HashMap;

use predicato_graph::Node;
use uuid::Uuid;

/// Conventional reciprocal-rank-fusion damping constant.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuse several rank lists with reciprocal rank fusion.
///
/// Each id scores `sum over lists of 1 / (k + rank + 1)`. The output is a
/// deterministic function of the inputs: ties break on the id itself, so
/// identical rank lists always fuse to the same order.
pub fn reciprocal_rank_fusion(rankings: &[Vec<Uuid>], k: f32) -> Vec<Uuid> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    for ranking in rankings {
        for (rank, id) in ranking.iter().enumerate() {
            *scores.entry(*id).or_insert(0.0) += 1.0 / (k + rank as f32 + 1.0);
        }
    }
    let mut fused: Vec<(Uuid, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused.into_iter().map(|(id, _)| id).collect()
}

/// Drop repeated nodes, keeping the first occurrence of each uuid.
pub fn dedupe_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = std::collections::HashSet::new();
    nodes
        .into_iter()
        .filter(|node| seen.insert(node.uuid))
        .collect()
}
