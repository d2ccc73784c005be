//! Edge operations: relationship extraction, resolution, invalidation,
//! episodic linkage.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use predicato_graph::{Edge, EdgeType, Episode, IngestionOptions, Node};

use crate::driver::{EdgeSearchOptions, GraphDriver};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::nlp::NlpClient;
use crate::ops::temporal::TemporalOperations;
use crate::prompts::{
    self,
    edges::{EdgeResolutionRow, ExtractedEdgeRow},
};
use crate::tabular::{self, index_list, TabularFormat, DEFAULT_PARSE_ATTEMPTS};

/// Outcome of edge resolution for one episode.
#[derive(Debug, Clone, Default)]
pub struct EdgeResolutionOutcome {
    /// Union of new and kept-existing edges.
    pub resolved: Vec<Edge>,
    /// Prior edges whose spans this episode closed.
    pub invalidated: Vec<Edge>,
    /// Edges minted fresh.
    pub new_count: usize,
    /// Extractions folded into existing edges.
    pub updated_count: usize,
}

/// Relationship processing for one episode.
pub struct EdgeOperations {
    extraction_nlp: Arc<dyn NlpClient>,
    resolution_nlp: Arc<dyn NlpClient>,
    embedder: Arc<dyn Embedder>,
    driver: Arc<dyn GraphDriver>,
    temporal: TemporalOperations,
    parse_attempts: usize,
}

impl EdgeOperations {
    /// Operations sharing one NLP client for every call site.
    pub fn new(
        nlp: Arc<dyn NlpClient>,
        embedder: Arc<dyn Embedder>,
        driver: Arc<dyn GraphDriver>,
    ) -> Self {
        Self {
            extraction_nlp: nlp.clone(),
            resolution_nlp: nlp.clone(),
            embedder,
            driver,
            temporal: TemporalOperations::new(nlp),
            parse_attempts: DEFAULT_PARSE_ATTEMPTS,
        }
    }

    pub fn with_extraction_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.extraction_nlp = nlp;
        self
    }

    pub fn with_resolution_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.resolution_nlp = nlp;
        self
    }

    pub fn with_temporal(mut self, temporal: TemporalOperations) -> Self {
        self.temporal = temporal;
        self
    }

    pub fn with_parse_attempts(mut self, attempts: usize) -> Self {
        self.parse_attempts = attempts;
        self
    }

    fn format(options: &IngestionOptions) -> TabularFormat {
        if options.use_yaml {
            TabularFormat::Yaml
        } else {
            TabularFormat::Tsv
        }
    }

    /// Extract fact triples from one chunk, restricted to the entities
    /// provided. Rows whose endpoints cannot be mapped back to an entity
    /// are skipped.
    pub async fn extract(
        &self,
        episode: &Episode,
        chunk_text: &str,
        entities: &[Node],
        previous: &[Node],
        options: &IngestionOptions,
    ) -> Result<Vec<Edge>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let format = Self::format(options);
        let messages = prompts::edges::extract_edges(
            episode, chunk_text, entities, options, previous, format,
        );
        let rows: Vec<ExtractedEdgeRow> = tabular::request_rows(
            self.extraction_nlp.as_ref(),
            messages,
            format,
            &prompts::tags(prompts::edges::EXTRACTION_FIELDS),
            self.parse_attempts,
        )
        .await?;

        let by_name: HashMap<String, &Node> = entities
            .iter()
            .map(|node| (node.name.to_lowercase(), node))
            .collect();

        let mut edges = Vec::new();
        for row in rows {
            let source = by_name.get(&row.source_name.trim().to_lowercase());
            let target = by_name.get(&row.target_name.trim().to_lowercase());
            let (Some(source), Some(target)) = (source, target) else {
                debug!(
                    source = %row.source_name,
                    target = %row.target_name,
                    "skipping fact with unresolvable endpoint"
                );
                continue;
            };
            let relation = normalize_relation(&row.relation);
            if relation.is_empty() {
                continue;
            }
            let fact = row.fact.unwrap_or_else(|| {
                format!("{} {} {}", source.name, relation, target.name)
            });
            let edge = Edge::entity(&episode.group_id, source.uuid, target.uuid, relation, fact)
                .with_valid_from(episode.reference_time)
                .with_metadata("episode_id", serde_json::json!(episode.id));
            edges.push(edge);
        }
        Ok(edges)
    }

    /// Resolve extracted edges against the existing graph: dedup against
    /// edges at the same endpoints, discover and close contradicted
    /// facts, date and embed what stays new.
    pub async fn resolve(
        &self,
        extracted: Vec<Edge>,
        episode: &Episode,
        previous: &[Node],
        options: &IngestionOptions,
    ) -> Result<EdgeResolutionOutcome> {
        let mut outcome = EdgeResolutionOutcome::default();
        if extracted.is_empty() {
            return Ok(outcome);
        }

        if options.skip_edge_resolution {
            let mut resolved = extracted;
            self.embed_edges(&mut resolved).await?;
            outcome.new_count = resolved.len();
            outcome.resolved = resolved;
            return Ok(outcome);
        }

        let format = Self::format(options);
        for mut edge in extracted {
            let same_endpoints: Vec<Edge> = self
                .driver
                .get_edges_between(edge.source_id, edge.target_id, &episode.group_id)
                .await?
                .into_iter()
                .filter(|existing| existing.edge_type == EdgeType::Entity)
                .collect();

            if !same_endpoints.is_empty() {
                let decision = self
                    .resolve_against(&edge, &same_endpoints, episode, format)
                    .await?;
                if let Some(row) = decision {
                    let duplicate = usize::try_from(row.duplicate_idx)
                        .ok()
                        .and_then(|idx| same_endpoints.get(idx));
                    let invalidated = self.apply_invalidations(
                        &edge,
                        &same_endpoints,
                        index_list(row.invalidates.as_ref()),
                        duplicate.map(|e| e.uuid),
                    );
                    outcome.invalidated.extend(invalidated);

                    if let Some(existing) = duplicate {
                        debug!(edge = %existing.uuid, "extraction folded into existing edge");
                        let mut kept = existing.clone();
                        kept.updated_at = chrono::Utc::now();
                        outcome.resolved.push(kept);
                        outcome.updated_count += 1;
                        continue;
                    }
                }
            }

            // The fact is new: date it, look for contradicted facts at
            // either endpoint, embed it.
            let (valid_at, invalid_at) =
                self.temporal.extract_edge_dates(&edge, episode, previous).await?;
            if let Some(valid_at) = valid_at {
                edge.valid_from = valid_at;
            }
            if let Some(invalid_at) = invalid_at {
                edge.valid_to = Some(invalid_at);
            }
            for warning in TemporalOperations::check_consistency(&edge) {
                warn!(warning = %warning, "temporal consistency");
            }

            let contradiction_candidates = self
                .contradiction_candidates(&edge, &same_endpoints, &episode.group_id)
                .await?;
            if !contradiction_candidates.is_empty() {
                let contradicted = self
                    .temporal
                    .find_contradictions(&edge, &contradiction_candidates)
                    .await?;
                let chosen: Vec<Edge> = contradicted
                    .into_iter()
                    .filter_map(|index| contradiction_candidates.get(index).cloned())
                    .collect();
                outcome
                    .invalidated
                    .extend(TemporalOperations::invalidate_overlapping(&edge, chosen));
            }

            outcome.new_count += 1;
            outcome.resolved.push(edge);
        }

        self.embed_new_edges(&mut outcome.resolved).await?;
        Ok(outcome)
    }

    async fn resolve_against(
        &self,
        edge: &Edge,
        existing: &[Edge],
        episode: &Episode,
        format: TabularFormat,
    ) -> Result<Option<EdgeResolutionRow>> {
        let new_facts = vec![crate::ops::temporal::edge_fact(edge)];
        let existing_facts: Vec<String> =
            existing.iter().map(crate::ops::temporal::edge_fact).collect();
        let messages =
            prompts::edges::resolve_edges(&new_facts, &existing_facts, episode, format);
        let rows: Vec<EdgeResolutionRow> = tabular::request_rows(
            self.resolution_nlp.as_ref(),
            messages,
            format,
            &prompts::tags(prompts::edges::RESOLUTION_FIELDS),
            self.parse_attempts,
        )
        .await?;
        Ok(rows.into_iter().find(|row| row.id == 0))
    }

    fn apply_invalidations(
        &self,
        new_edge: &Edge,
        existing: &[Edge],
        indices: Vec<i64>,
        skip: Option<Uuid>,
    ) -> Vec<Edge> {
        let chosen: Vec<Edge> = indices
            .into_iter()
            .filter_map(|index| usize::try_from(index).ok())
            .filter_map(|index| existing.get(index).cloned())
            .filter(|edge| Some(edge.uuid) != skip)
            .collect();
        TemporalOperations::invalidate_overlapping(new_edge, chosen)
    }

    /// Entity edges incident to either endpoint, excluding the edges
    /// already handled by same-endpoint resolution and anything already
    /// expired at the new fact's start.
    async fn contradiction_candidates(
        &self,
        edge: &Edge,
        same_endpoints: &[Edge],
        group_id: &str,
    ) -> Result<Vec<Edge>> {
        let options = EdgeSearchOptions::default()
            .with_limit(CANDIDATE_EDGE_LIMIT)
            .with_node_ids(vec![edge.source_id, edge.target_id])
            .with_edge_types(vec![EdgeType::Entity]);
        let incident = self.driver.search_edges("", group_id, &options).await?;
        let handled: std::collections::HashSet<Uuid> =
            same_endpoints.iter().map(|e| e.uuid).collect();
        Ok(incident
            .into_iter()
            .filter(|candidate| !handled.contains(&candidate.uuid))
            .filter(|candidate| !candidate.is_expired_at(edge.valid_from))
            .collect())
    }

    async fn embed_edges(&self, edges: &mut [Edge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = edges.iter().map(crate::ops::temporal::edge_fact).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        for (edge, embedding) in edges.iter_mut().zip(embeddings) {
            edge.embedding = Some(embedding);
        }
        Ok(())
    }

    /// Embeddings are always computed for new edges; kept-existing edges
    /// retain theirs.
    async fn embed_new_edges(&self, edges: &mut [Edge]) -> Result<()> {
        let mut missing: Vec<&mut Edge> = edges
            .iter_mut()
            .filter(|edge| edge.embedding.is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = missing
            .iter()
            .map(|edge| crate::ops::temporal::edge_fact(edge))
            .collect();
        let embeddings = self.embedder.embed(&texts).await?;
        for (edge, embedding) in missing.iter_mut().zip(embeddings) {
            edge.embedding = Some(embedding);
        }
        Ok(())
    }
}

/// Incident-edge fetch cap for contradiction discovery.
pub const CANDIDATE_EDGE_LIMIT: usize = 50;

/// One MENTIONED_IN edge from the episode node to every resolved entity,
/// stamped with the episode's validity start.
pub fn build_episodic_edges(episode_node: &Node, entities: &[Node]) -> Vec<Edge> {
    entities
        .iter()
        .map(|entity| {
            Edge::episodic(
                &episode_node.group_id,
                episode_node.uuid,
                entity.uuid,
                episode_node.valid_from,
            )
        })
        .collect()
}

/// IS_DUPLICATE_OF edges for surviving duplicate pairs.
pub fn build_duplicate_edges(group_id: &str, pairs: &[(Uuid, Uuid)]) -> Vec<Edge> {
    pairs
        .iter()
        .map(|(a, b)| Edge::duplicate_of(group_id, *a, *b))
        .collect()
}

/// Rewrite every endpoint through the extracted-to-resolved uuid map.
/// Endpoints absent from the map are left alone.
pub fn rewrite_endpoints(edges: &mut [Edge], uuid_map: &HashMap<Uuid, Uuid>) {
    for edge in edges {
        if let Some(resolved) = uuid_map.get(&edge.source_id) {
            edge.source_id = *resolved;
        }
        if let Some(resolved) = uuid_map.get(&edge.target_id) {
            edge.target_id = *resolved;
        }
    }
}

fn normalize_relation(raw: &str) -> String {
    raw.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::new_uuid;

    #[test]
    fn test_rewrite_endpoints_applies_map() {
        let a = new_uuid();
        let b = new_uuid();
        let canonical = new_uuid();
        let mut edges = vec![Edge::entity("g", a, b, "WORKS_FOR", "")];
        let uuid_map = HashMap::from([(a, canonical), (b, b)]);

        rewrite_endpoints(&mut edges, &uuid_map);
        assert_eq!(edges[0].source_id, canonical);
        assert_eq!(edges[0].target_id, b);
    }

    #[test]
    fn test_episodic_edges_cover_every_entity() {
        let episode_node = Node::episodic("g", "ep-1", "content", chrono::Utc::now());
        let entities = vec![Node::entity("g", "Alice"), Node::entity("g", "Acme")];
        let edges = build_episodic_edges(&episode_node, &entities);
        assert_eq!(edges.len(), 2);
        for edge in &edges {
            assert_eq!(edge.source_id, episode_node.uuid);
            assert_eq!(edge.name, predicato_graph::MENTIONED_IN);
            assert_eq!(edge.valid_from, episode_node.valid_from);
        }
    }

    #[test]
    fn test_normalize_relation() {
        assert_eq!(normalize_relation("works for"), "WORKS_FOR");
        assert_eq!(normalize_relation(" WORKS_FOR "), "WORKS_FOR");
        assert_eq!(normalize_relation(""), "");
    }
}
