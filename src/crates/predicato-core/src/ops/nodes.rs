//! Node operations: extraction, reflexion, resolution, attribute fill.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use predicato_graph::{
    Episode, IngestionOptions, Node, NodeType, IS_DUPLICATE_OF, DEFAULT_ENTITY_TYPE,
};

use crate::driver::{GraphDriver, NodeSearchOptions, VectorSearchOptions};
use crate::embedder::Embedder;
use crate::error::Result;
use crate::modeler::EntityResolutionOutput;
use crate::nlp::NlpClient;
use crate::ops::search::{dedupe_nodes, reciprocal_rank_fusion, DEFAULT_RRF_K};
use crate::prompts::{
    self,
    dedupe::NodeResolutionRow,
    entities::{ExtractedEntityRow, ReflexionRow},
};
use crate::tabular::{self, index_list, TabularFormat, DEFAULT_PARSE_ATTEMPTS};

/// Existing-graph candidates fetched per extracted entity.
pub const CANDIDATE_LIMIT: usize = 50;

/// Nodes per attribute-fill batch.
pub const ATTRIBUTE_BATCH_SIZE: usize = 24;

/// Default cap on reflexion passes per chunk.
pub const DEFAULT_MAX_REFLEXION_ITERATIONS: usize = 2;

/// Chunk-aware entity processing.
pub struct NodeOperations {
    extraction_nlp: Arc<dyn NlpClient>,
    reflexion_nlp: Arc<dyn NlpClient>,
    resolution_nlp: Arc<dyn NlpClient>,
    attribute_nlp: Arc<dyn NlpClient>,
    embedder: Arc<dyn Embedder>,
    driver: Arc<dyn GraphDriver>,
    semaphore: Arc<Semaphore>,
    parse_attempts: usize,
}

impl NodeOperations {
    /// Operations sharing one NLP client for every call site.
    pub fn new(
        nlp: Arc<dyn NlpClient>,
        embedder: Arc<dyn Embedder>,
        driver: Arc<dyn GraphDriver>,
    ) -> Self {
        Self {
            extraction_nlp: nlp.clone(),
            reflexion_nlp: nlp.clone(),
            resolution_nlp: nlp.clone(),
            attribute_nlp: nlp,
            embedder,
            driver,
            semaphore: Arc::new(Semaphore::new(crate::orchestrator::DEFAULT_SEMAPHORE_LIMIT)),
            parse_attempts: DEFAULT_PARSE_ATTEMPTS,
        }
    }

    pub fn with_extraction_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.extraction_nlp = nlp;
        self
    }

    pub fn with_reflexion_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.reflexion_nlp = nlp;
        self
    }

    pub fn with_resolution_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.resolution_nlp = nlp;
        self
    }

    pub fn with_attribute_client(mut self, nlp: Arc<dyn NlpClient>) -> Self {
        self.attribute_nlp = nlp;
        self
    }

    pub fn with_semaphore(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.semaphore = semaphore;
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

    /// Extract entity mentions from one chunk, looping through reflexion
    /// passes until nothing new is reported or the cap is reached.
    pub async fn extract(
        &self,
        episode: &Episode,
        chunk_text: &str,
        previous: &[Node],
        options: &IngestionOptions,
        max_reflexion_iterations: usize,
    ) -> Result<Vec<Node>> {
        let format = Self::format(options);
        let excluded: HashSet<String> = options
            .excluded_entity_types
            .iter()
            .map(|t| t.to_lowercase())
            .collect();

        let mut custom_prompt = String::new();
        let mut nodes: Vec<Node> = Vec::new();
        let mut reflexion_passes = 0usize;

        loop {
            let messages = prompts::entities::extract_entities(
                episode,
                chunk_text,
                previous,
                &options.entity_types,
                &custom_prompt,
                format,
            );
            let rows: Vec<ExtractedEntityRow> = tabular::request_rows(
                self.extraction_nlp.as_ref(),
                messages,
                format,
                &prompts::tags(prompts::entities::EXTRACTION_FIELDS),
                self.parse_attempts,
            )
            .await?;

            nodes = self.rows_to_nodes(rows, episode, options, &excluded);

            if options.skip_reflexion || reflexion_passes >= max_reflexion_iterations {
                break;
            }
            reflexion_passes += 1;

            let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
            let messages =
                prompts::entities::reflexion(episode, chunk_text, previous, &names, format);
            let missed: Vec<ReflexionRow> = tabular::request_rows(
                self.reflexion_nlp.as_ref(),
                messages,
                format,
                &prompts::tags(prompts::entities::REFLEXION_FIELDS),
                self.parse_attempts,
            )
            .await?;

            let known: HashSet<String> = names.iter().map(|n| n.to_lowercase()).collect();
            let missed: Vec<String> = missed
                .into_iter()
                .map(|row| row.name.trim().to_string())
                .filter(|name| !name.is_empty() && !known.contains(&name.to_lowercase()))
                .collect();
            if missed.is_empty() {
                break;
            }
            debug!(missed = missed.len(), pass = reflexion_passes, "reflexion found missed entities");
            custom_prompt = format!(
                "A previous pass missed these entities; make sure they are \
                 included this time: {}",
                missed.join(", ")
            );
        }

        Ok(nodes)
    }

    fn rows_to_nodes(
        &self,
        rows: Vec<ExtractedEntityRow>,
        episode: &Episode,
        options: &IngestionOptions,
        excluded: &HashSet<String>,
    ) -> Vec<Node> {
        let mut seen: HashSet<String> = HashSet::new();
        rows.into_iter()
            .filter_map(|row| {
                let name = row.name.trim().to_string();
                if name.is_empty() || !seen.insert(name.to_lowercase()) {
                    return None;
                }
                let entity_type = entity_type_for(row.entity_type_id, &options.entity_types);
                if excluded.contains(&entity_type.to_lowercase()) {
                    debug!(name = %name, entity_type = %entity_type, "dropping excluded entity type");
                    return None;
                }
                let mut node = Node::entity(&episode.group_id, name)
                    .with_entity_type(entity_type)
                    .with_valid_from(episode.reference_time);
                if let Some(summary) = row.summary {
                    node.summary = summary;
                }
                Some(node)
            })
            .collect()
    }

    /// Resolve extracted mentions against the existing graph.
    ///
    /// The returned uuid map is total over `extracted`: mentions collapse
    /// first onto a representative per distinct `(name, entity_type)`,
    /// then each representative maps to an existing node or stays new.
    pub async fn resolve(
        &self,
        extracted: &[Node],
        episode: &Episode,
        previous: &[Node],
        options: &IngestionOptions,
    ) -> Result<EntityResolutionOutput> {
        if extracted.is_empty() {
            return Ok(EntityResolutionOutput::default());
        }
        if options.skip_resolution {
            return Ok(EntityResolutionOutput::identity(extracted));
        }

        // Collapse repeated mentions across chunks.
        let mut representatives: Vec<Node> = Vec::new();
        let mut mention_of: HashMap<Uuid, Uuid> = HashMap::new();
        {
            let mut by_key: HashMap<(String, String), Uuid> = HashMap::new();
            for node in extracted {
                let key = (node.name.to_lowercase(), node.entity_type.clone());
                match by_key.get(&key) {
                    Some(representative) => {
                        mention_of.insert(node.uuid, *representative);
                    }
                    None => {
                        by_key.insert(key, node.uuid);
                        mention_of.insert(node.uuid, node.uuid);
                        representatives.push(node.clone());
                    }
                }
            }
        }

        let candidates = self
            .candidate_pool(&representatives, &episode.group_id, options)
            .await?;

        let mut output = EntityResolutionOutput::default();
        let mut resolution: HashMap<Uuid, Uuid> = HashMap::new();

        if candidates.is_empty() {
            for node in &representatives {
                resolution.insert(node.uuid, node.uuid);
                output.resolved_nodes.push(node.clone());
                output.new_count += 1;
            }
        } else {
            let format = Self::format(options);
            let messages = prompts::dedupe::resolve_entities(
                &representatives,
                &candidates,
                episode,
                previous,
                format,
            );
            let rows: Vec<NodeResolutionRow> = tabular::request_rows(
                self.resolution_nlp.as_ref(),
                messages,
                format,
                &prompts::tags(prompts::dedupe::RESOLUTION_FIELDS),
                self.parse_attempts,
            )
            .await?;
            let decisions: HashMap<i64, NodeResolutionRow> =
                rows.into_iter().map(|row| (row.id, row)).collect();

            for (index, node) in representatives.iter().enumerate() {
                let decision = decisions.get(&(index as i64));
                let duplicate_idx = decision.map_or(-1, |row| row.duplicate_idx);
                match usize::try_from(duplicate_idx)
                    .ok()
                    .and_then(|idx| candidates.get(idx))
                {
                    Some(existing) => {
                        resolution.insert(node.uuid, existing.uuid);
                        output.resolved_nodes.push(existing.clone());
                        output.merged_count += 1;
                        output.duplicate_pairs.push((node.uuid, existing.uuid));

                        // Extra existing nodes naming the same entity.
                        if let Some(row) = decision {
                            for extra in index_list(row.duplicates.as_ref()) {
                                if extra == duplicate_idx {
                                    continue;
                                }
                                if let Some(other) = usize::try_from(extra)
                                    .ok()
                                    .and_then(|idx| candidates.get(idx))
                                {
                                    if other.uuid != existing.uuid {
                                        output
                                            .duplicate_pairs
                                            .push((existing.uuid, other.uuid));
                                    }
                                }
                            }
                        }
                    }
                    None => {
                        resolution.insert(node.uuid, node.uuid);
                        output.resolved_nodes.push(node.clone());
                        output.new_count += 1;
                    }
                }
            }
        }

        // Mentions inherit their representative's resolution.
        for node in extracted {
            let representative = mention_of[&node.uuid];
            output.uuid_map.insert(node.uuid, resolution[&representative]);
        }

        debug!(
            extracted = extracted.len(),
            resolved = output.resolved_nodes.len(),
            merged = output.merged_count,
            new = output.new_count,
            "entity resolution"
        );
        Ok(output)
    }

    /// Candidate pool per extracted node: name search fused with vector
    /// search by reciprocal rank, deduplicated, capped.
    async fn candidate_pool(
        &self,
        extracted: &[Node],
        group_id: &str,
        options: &IngestionOptions,
    ) -> Result<Vec<Node>> {
        let name_options = NodeSearchOptions::default()
            .with_limit(CANDIDATE_LIMIT)
            .with_node_types(vec![NodeType::Entity]);
        let vector_options = VectorSearchOptions::default()
            .with_limit(CANDIDATE_LIMIT)
            .with_min_score(options.similarity_threshold)
            .with_node_types(vec![NodeType::Entity]);

        let mut pool: Vec<Node> = Vec::new();
        for node in extracted {
            let by_name = self
                .driver
                .search_nodes(&node.name, group_id, &name_options)
                .await?;

            let by_vector = match self.embedder.embed_single(&node.name).await {
                Ok(vector) => {
                    self.driver
                        .search_nodes_by_vector(&vector, group_id, &vector_options)
                        .await?
                }
                Err(err) => {
                    warn!(name = %node.name, error = %err, "name embedding failed, using text search only");
                    Vec::new()
                }
            };

            let mut by_uuid: HashMap<Uuid, Node> = HashMap::new();
            let name_ranks: Vec<Uuid> = by_name.iter().map(|n| n.uuid).collect();
            let vector_ranks: Vec<Uuid> = by_vector.iter().map(|n| n.uuid).collect();
            for candidate in by_name.into_iter().chain(by_vector) {
                by_uuid.entry(candidate.uuid).or_insert(candidate);
            }
            for uuid in reciprocal_rank_fusion(&[name_ranks, vector_ranks], DEFAULT_RRF_K) {
                if let Some(candidate) = by_uuid.remove(&uuid) {
                    pool.push(candidate);
                }
            }
        }

        let extracted_ids: HashSet<Uuid> = extracted.iter().map(|n| n.uuid).collect();
        let mut pool = dedupe_nodes(pool);
        pool.retain(|candidate| !extracted_ids.contains(&candidate.uuid));
        pool.truncate(CANDIDATE_LIMIT);
        Ok(pool)
    }

    /// Drop duplicate pairs that already carry an IS_DUPLICATE_OF edge.
    pub async fn filter_existing_duplicate_pairs(
        &self,
        group_id: &str,
        pairs: Vec<(Uuid, Uuid)>,
    ) -> Result<Vec<(Uuid, Uuid)>> {
        let mut surviving = Vec::new();
        for (a, b) in pairs {
            if a == b {
                continue;
            }
            let existing = self.driver.get_edges_between(a, b, group_id).await?;
            if existing.iter().any(|edge| edge.name == IS_DUPLICATE_OF) {
                continue;
            }
            surviving.push((a, b));
        }
        Ok(surviving)
    }

    /// Refresh summaries and embeddings for resolved entities, in
    /// batches of [`ATTRIBUTE_BATCH_SIZE`].
    pub async fn fill_attributes(
        &self,
        nodes: Vec<Node>,
        episode: &Episode,
        previous: &[Node],
        options: &IngestionOptions,
    ) -> Result<Vec<Node>> {
        if nodes.is_empty() || options.skip_attributes {
            return Ok(nodes);
        }
        let format = Self::format(options);

        let batches: Vec<Vec<Node>> = nodes
            .chunks(ATTRIBUTE_BATCH_SIZE)
            .map(|batch| batch.to_vec())
            .collect();
        let futures = batches.into_iter().map(|batch| {
            let semaphore = self.semaphore.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| crate::error::CoreError::Cancelled)?;
                self.fill_batch(batch, episode, previous, format).await
            }
        });
        let filled = futures::future::try_join_all(futures).await?;
        let mut hydrated: Vec<Node> = filled.into_iter().flatten().collect();

        // Recompute both embeddings over the updated summaries.
        let texts: Vec<String> = hydrated.iter().map(Node::embedding_text).collect();
        let embeddings = self.embedder.embed(&texts).await?;
        let names: Vec<String> = hydrated.iter().map(|n| n.name.clone()).collect();
        let name_embeddings = self.embedder.embed(&names).await?;
        for ((node, embedding), name_embedding) in
            hydrated.iter_mut().zip(embeddings).zip(name_embeddings)
        {
            node.embedding = Some(embedding);
            node.name_embedding = Some(name_embedding);
            node.updated_at = chrono::Utc::now();
        }
        Ok(hydrated)
    }

    async fn fill_batch(
        &self,
        mut batch: Vec<Node>,
        episode: &Episode,
        previous: &[Node],
        format: TabularFormat,
    ) -> Result<Vec<Node>> {
        let messages = prompts::attributes::fill_attributes(&batch, episode, previous, format);
        let rows: Vec<prompts::attributes::AttributeRow> = tabular::request_rows(
            self.attribute_nlp.as_ref(),
            messages,
            format,
            &prompts::tags(prompts::attributes::ATTRIBUTE_FIELDS),
            self.parse_attempts,
        )
        .await?;
        for row in rows {
            if let Some(node) = usize::try_from(row.id).ok().and_then(|i| batch.get_mut(i)) {
                if !row.summary.trim().is_empty() {
                    node.summary = row.summary.trim().to_string();
                }
            }
        }
        Ok(batch)
    }
}

/// Resolve a type-table id to its tag; unknown ids fall back to the
/// catch-all.
fn entity_type_for(id: Option<i64>, entity_types: &[predicato_graph::EntityTypeSpec]) -> String {
    match id {
        Some(0) | None => DEFAULT_ENTITY_TYPE.to_string(),
        Some(id) => usize::try_from(id - 1)
            .ok()
            .and_then(|index| entity_types.get(index))
            .map(|spec| spec.name.clone())
            .unwrap_or_else(|| DEFAULT_ENTITY_TYPE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::EntityTypeSpec;

    #[test]
    fn test_entity_type_table_ids() {
        let types = vec![
            EntityTypeSpec::new("PERSON", ""),
            EntityTypeSpec::new("ORGANIZATION", ""),
        ];
        assert_eq!(entity_type_for(None, &types), "Entity");
        assert_eq!(entity_type_for(Some(0), &types), "Entity");
        assert_eq!(entity_type_for(Some(1), &types), "PERSON");
        assert_eq!(entity_type_for(Some(2), &types), "ORGANIZATION");
        assert_eq!(entity_type_for(Some(9), &types), "Entity");
        assert_eq!(entity_type_for(Some(-3), &types), "Entity");
    }
}
