//! The ingestion orchestrator - a 13-stage, checkpointed state machine.
//!
//! Every episode walks the same fixed, linear stage order:
//!
//! ```text
//! initial → prepared → got_previous_episodes → created_chunks →
//! extracted_entities → deduplicated_entities → extracted_edges →
//! resolved_edges → extracted_attributes → built_episodic_edges →
//! performed_graph_update → updated_communities → completed
//! ```
//!
//! On entry the orchestrator loads (or creates) the episode's checkpoint,
//! returns the recorded result if a completion tombstone exists, verifies
//! the retry gate, and replays from the recorded step - every earlier
//! stage's output is already cached in the checkpoint. Each successful
//! stage persists its output and the new step marker before the next
//! stage starts, so a crash, cancellation, or NLP failure costs at most
//! the stage in flight.
//!
//! Ordering guarantees: extraction finishes for all chunks before entity
//! resolution; entity resolution finishes before edge extraction; every
//! edge endpoint is rewritten through the uuid map before edge
//! resolution; and the graph commit is one logical step - if it fails,
//! the checkpoint stays at `built_episodic_edges` and the commit replays
//! on the next attempt (upserts key on `(group_id, uuid)`).
//!
//! Concurrency: per-chunk extraction fans out under a shared semaphore
//! bounding outstanding NLP calls; stages themselves are strictly
//! sequential. All outbound calls observe the orchestrator's
//! cancellation token; a trip persists the checkpoint and surfaces
//! [`CoreError::Cancelled`] without consuming an attempt.
//!
//! Failures are recorded into the checkpoint (`attempt_count`,
//! `last_error`, `last_error_stack`) before the error - naming the failed
//! stage - reaches the caller. Panics inside stages are caught at this
//! boundary and saved the same way. A later call with the same episode id
//! resumes from the recorded stage while `can_retry` allows.

pub mod chunker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use predicato_checkpoint::{CheckpointManager, ChunkTuple, EpisodeCheckpoint, IngestStep};
use predicato_graph::{Edge, Episode, IngestionOptions, Node};

use crate::driver::GraphDriver;
use crate::embedder::Embedder;
use crate::error::{CoreError, Result};
use crate::modeler::{
    CommunityInput, DefaultModeler, EntityResolutionInput, GraphModeler,
    RelationshipResolutionInput,
};
use crate::nlp::{NlpClient, RetryConfig, RetryingNlp};
use crate::ops::edges::{build_episodic_edges, EdgeOperations};
use crate::ops::nodes::NodeOperations;

/// Default bound on outstanding NLP calls.
pub const DEFAULT_SEMAPHORE_LIMIT: usize = 10;

/// Default chunking limit in characters.
pub const DEFAULT_MAX_CHARACTERS: usize = 2048;

/// Default previous-episode context window.
pub const DEFAULT_PREVIOUS_EPISODE_WINDOW: usize = 5;

/// Default retry gate on checkpoint attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Orchestrator configuration surface.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Checkpoint directory; `None` uses the manager default
    /// (`$TMPDIR/predicato-checkpoints`).
    pub checkpoint_dir: Option<PathBuf>,
    /// Chunking limit in characters (per-episode override via
    /// [`IngestionOrchestrator::ingest_with_limit`]).
    pub max_characters: usize,
    /// Bound on outstanding NLP calls.
    pub semaphore_limit: usize,
    /// Cap on reflexion passes per chunk.
    pub max_reflexion_iterations: usize,
    /// Checkpoint retry gate: attempts.
    pub max_attempts: u32,
    /// Checkpoint retry gate: age.
    pub max_age: chrono::Duration,
    /// Previous episodes fetched for context.
    pub previous_episode_window: usize,
    /// Refresh communities at the end of every episode.
    pub update_communities: bool,
    /// Retry policy for the NLP client wrapper.
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            max_characters: DEFAULT_MAX_CHARACTERS,
            semaphore_limit: DEFAULT_SEMAPHORE_LIMIT,
            max_reflexion_iterations: crate::ops::nodes::DEFAULT_MAX_REFLEXION_ITERATIONS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_age: chrono::Duration::hours(24),
            previous_episode_window: DEFAULT_PREVIOUS_EPISODE_WINDOW,
            update_communities: false,
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn with_max_characters(mut self, max_characters: usize) -> Self {
        self.max_characters = max_characters;
        self
    }

    pub fn with_semaphore_limit(mut self, limit: usize) -> Self {
        self.semaphore_limit = limit.max(1);
        self
    }

    pub fn with_max_reflexion_iterations(mut self, iterations: usize) -> Self {
        self.max_reflexion_iterations = iterations;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_previous_episode_window(mut self, window: usize) -> Self {
        self.previous_episode_window = window;
        self
    }

    pub fn with_update_communities(mut self, update: bool) -> Self {
        self.update_communities = update;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// What an episode contributed to the graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionResult {
    pub resolved_nodes: Vec<Node>,
    pub resolved_edges: Vec<Edge>,
    pub episodic_edges: Vec<Edge>,
    pub invalidated_edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<Vec<Node>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_edges: Option<Vec<Edge>>,
}

/// Drives episodes through the ingestion pipeline.
pub struct IngestionOrchestrator {
    driver: Arc<dyn GraphDriver>,
    modeler: Arc<dyn GraphModeler>,
    node_ops: NodeOperations,
    edge_ops: EdgeOperations,
    checkpoints: CheckpointManager,
    config: OrchestratorConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl IngestionOrchestrator {
    /// Orchestrator with the default configuration. The provided NLP
    /// client is wrapped with the retry layer; the default modeler
    /// shares it.
    pub fn new(
        driver: Arc<dyn GraphDriver>,
        nlp: Arc<dyn NlpClient>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self::with_config(driver, nlp, embedder, OrchestratorConfig::default())
    }

    /// Orchestrator with an explicit configuration.
    pub fn with_config(
        driver: Arc<dyn GraphDriver>,
        nlp: Arc<dyn NlpClient>,
        embedder: Arc<dyn Embedder>,
        config: OrchestratorConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let retrying: Arc<dyn NlpClient> = Arc::new(
            RetryingNlp::new(nlp)
                .with_config(config.retry.clone())
                .with_cancellation(cancel.clone()),
        );
        let semaphore = Arc::new(Semaphore::new(config.semaphore_limit.max(1)));
        let node_ops = NodeOperations::new(retrying.clone(), embedder.clone(), driver.clone())
            .with_semaphore(semaphore.clone());
        let edge_ops = EdgeOperations::new(retrying.clone(), embedder.clone(), driver.clone());
        let modeler: Arc<dyn GraphModeler> =
            Arc::new(DefaultModeler::new(retrying, embedder, driver.clone()));
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => CheckpointManager::with_directory(dir),
            None => CheckpointManager::new(),
        };
        Self {
            driver,
            modeler,
            node_ops,
            edge_ops,
            checkpoints,
            config,
            semaphore,
            cancel,
        }
    }

    /// Substitute the resolution policy.
    pub fn with_modeler(mut self, modeler: Arc<dyn GraphModeler>) -> Self {
        self.modeler = modeler;
        self
    }

    /// Substitute the checkpoint manager.
    pub fn with_checkpoint_manager(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// The token outbound calls observe; cancel it on shutdown and the
    /// in-flight episode persists its checkpoint and returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The checkpoint manager in use.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Ingest one episode under the configured chunking limit.
    pub async fn ingest(
        &self,
        episode: Episode,
        options: IngestionOptions,
    ) -> Result<IngestionResult> {
        self.ingest_with_limit(episode, options, self.config.max_characters)
            .await
    }

    /// Ingest one episode with an explicit chunking limit.
    pub async fn ingest_with_limit(
        &self,
        episode: Episode,
        options: IngestionOptions,
        max_characters: usize,
    ) -> Result<IngestionResult> {
        if episode.group_id.trim().is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "episode {:?} has no group",
                episode.id
            )));
        }

        // A completed episode replays its recorded result until the
        // caller clears the tombstone.
        if let Some(recorded) = self.checkpoints.load_tombstone(&episode.id).await? {
            match serde_json::from_value::<IngestionResult>(recorded) {
                Ok(result) => {
                    info!(episode_id = %episode.id, "episode already completed, returning recorded result");
                    return Ok(result);
                }
                Err(err) => {
                    warn!(episode_id = %episode.id, error = %err, "unreadable tombstone, re-ingesting");
                }
            }
        }

        let mut checkpoint = self
            .checkpoints
            .load_or_create(&episode, &options, max_characters)
            .await?;
        if !checkpoint.can_retry(self.config.max_attempts, self.config.max_age) {
            return Err(CoreError::RetryExhausted {
                episode_id: checkpoint.episode_id.clone(),
                attempts: checkpoint.attempt_count,
            });
        }

        let outcome = std::panic::AssertUnwindSafe(self.run_pipeline(&mut checkpoint))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => {
                self.checkpoints
                    .save_tombstone(&checkpoint.episode_id, &serde_json::to_value(&result)?)
                    .await?;
                self.checkpoints.delete(&checkpoint.episode_id).await?;
                info!(
                    episode_id = %checkpoint.episode_id,
                    nodes = result.resolved_nodes.len(),
                    edges = result.resolved_edges.len(),
                    "episode ingested"
                );
                Ok(result)
            }
            Ok(Err(err)) if is_cancellation(&err) => {
                // Shutdown: persist progress without consuming an attempt.
                if let Err(save_err) = self.checkpoints.save(&mut checkpoint).await {
                    warn!(error = %save_err, "failed to persist checkpoint on cancellation");
                }
                warn!(episode_id = %checkpoint.episode_id, step = %checkpoint.step, "ingestion cancelled");
                Err(err)
            }
            Ok(Err(err)) => {
                if let Err(save_err) = self
                    .checkpoints
                    .save_with_error(&mut checkpoint, &err, None)
                    .await
                {
                    warn!(error = %save_err, "failed to record stage error into checkpoint");
                }
                Err(err)
            }
            Err(panic) => {
                let payload = panic_payload(panic);
                let step = checkpoint.step.successor().unwrap_or(checkpoint.step);
                if let Err(save_err) = self
                    .checkpoints
                    .save_with_error(
                        &mut checkpoint,
                        format!("stage {step} panicked: {payload}"),
                        Some(payload.clone()),
                    )
                    .await
                {
                    warn!(error = %save_err, "failed to record panic into checkpoint");
                }
                Err(CoreError::Panicked { step, payload })
            }
        }
    }

    async fn run_pipeline(&self, cp: &mut EpisodeCheckpoint) -> Result<IngestionResult> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            debug!(episode_id = %cp.episode_id, step = %cp.step, progress = cp.progress(), "pipeline step");
            match cp.step {
                IngestStep::Initial => {
                    self.stage_prepare(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::Prepared, e))?;
                }
                IngestStep::Prepared => {
                    self.stage_previous_episodes(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::GotPreviousEpisodes, e))?;
                }
                IngestStep::GotPreviousEpisodes => {
                    self.stage_create_chunk_nodes(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::CreatedChunks, e))?;
                }
                IngestStep::CreatedChunks => {
                    // Nothing to extract from an empty episode.
                    if cp.chunks.as_ref().map_or(true, Vec::is_empty) {
                        self.checkpoints
                            .save_with_step(cp, IngestStep::Completed)
                            .await?;
                        continue;
                    }
                    self.stage_extract_entities(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::ExtractedEntities, e))?;
                }
                IngestStep::ExtractedEntities => {
                    self.stage_deduplicate_entities(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::DeduplicatedEntities, e))?;
                }
                IngestStep::DeduplicatedEntities => {
                    self.stage_extract_edges(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::ExtractedEdges, e))?;
                }
                IngestStep::ExtractedEdges => {
                    self.stage_resolve_edges(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::ResolvedEdges, e))?;
                }
                IngestStep::ResolvedEdges => {
                    self.stage_fill_attributes(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::ExtractedAttributes, e))?;
                }
                IngestStep::ExtractedAttributes => {
                    self.stage_build_episodic_edges(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::BuiltEpisodicEdges, e))?;
                }
                IngestStep::BuiltEpisodicEdges => {
                    self.stage_commit(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::PerformedGraphUpdate, e))?;
                }
                IngestStep::PerformedGraphUpdate => {
                    self.stage_update_communities(cp)
                        .await
                        .map_err(|e| CoreError::stage(IngestStep::UpdatedCommunities, e))?;
                }
                IngestStep::UpdatedCommunities => {
                    cp.advance_to(IngestStep::Completed);
                }
                IngestStep::Completed => {
                    return Ok(self.result_from(cp));
                }
            }
        }
    }

    async fn stage_prepare(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let chunks = chunker::split_text(&cp.episode.content, cp.max_characters);
        debug!(episode_id = %cp.episode_id, chunks = chunks.len(), "episode chunked");
        cp.chunks = Some(chunks);
        self.checkpoints
            .save_with_step(cp, IngestStep::Prepared)
            .await?;
        Ok(())
    }

    async fn stage_previous_episodes(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let previous = self
            .driver
            .get_recent_episodes(
                &cp.group_id,
                cp.episode.reference_time,
                self.config.previous_episode_window,
            )
            .await?;
        cp.previous_episodes = Some(previous);
        self.checkpoints
            .save_with_step(cp, IngestStep::GotPreviousEpisodes)
            .await?;
        Ok(())
    }

    async fn stage_create_chunk_nodes(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let chunks = cp.chunks.clone().unwrap_or_default();
        let episode = &cp.episode;

        let mut main = Node::episodic(
            &episode.group_id,
            &episode.name,
            &episode.content,
            episode.reference_time,
        );
        main.metadata = episode.metadata.clone();
        main.metadata
            .insert("episode_id".to_string(), serde_json::json!(episode.id));

        let chunk_nodes: Vec<Node> = if chunks.len() <= 1 {
            // A single chunk is the episode itself.
            chunks.iter().map(|_| main.clone()).collect()
        } else {
            chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| {
                    Node::episodic(
                        &episode.group_id,
                        format!("{} (chunk {})", episode.name, index + 1),
                        chunk,
                        episode.reference_time,
                    )
                })
                .collect()
        };
        let tuples: Vec<ChunkTuple> = chunk_nodes
            .iter()
            .enumerate()
            .map(|(chunk_index, node)| ChunkTuple {
                chunk_index,
                episode_node: node.uuid,
            })
            .collect();

        cp.main_episode_node = Some(main);
        cp.chunk_episode_nodes = Some(chunk_nodes);
        cp.episode_tuples = Some(tuples);
        self.checkpoints
            .save_with_step(cp, IngestStep::CreatedChunks)
            .await?;
        Ok(())
    }

    async fn stage_extract_entities(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let chunks = cp.chunks.clone().unwrap_or_default();
        let previous = cp.previous_episodes.clone().unwrap_or_default();
        let episode = cp.episode.clone();
        let options = cp.options.clone();

        let futures = chunks.iter().map(|chunk| {
            let semaphore = self.semaphore.clone();
            let episode = &episode;
            let previous = &previous;
            let options = &options;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| CoreError::Cancelled)?;
                self.node_ops
                    .extract(
                        episode,
                        chunk,
                        previous,
                        options,
                        self.config.max_reflexion_iterations,
                    )
                    .await
            }
        });
        let by_chunk = futures::future::try_join_all(futures).await?;
        debug!(
            episode_id = %cp.episode_id,
            entities = by_chunk.iter().map(Vec::len).sum::<usize>(),
            "entities extracted"
        );
        cp.extracted_nodes_by_chunk = Some(by_chunk);
        self.checkpoints
            .save_with_step(cp, IngestStep::ExtractedEntities)
            .await?;
        Ok(())
    }

    async fn stage_deduplicate_entities(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let extracted: Vec<Node> = cp
            .extracted_nodes_by_chunk
            .clone()
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();

        let input = EntityResolutionInput {
            extracted_nodes: extracted.clone(),
            episode: cp.episode.clone(),
            previous_episodes: cp.previous_episodes.clone().unwrap_or_default(),
            group_id: cp.group_id.clone(),
            options: cp.options.clone(),
        };
        let mut output = self.modeler.resolve_entities(input).await?;

        // The uuid map must stay total over the extractions.
        for node in &extracted {
            if !output.uuid_map.contains_key(&node.uuid) {
                warn!(uuid = %node.uuid, name = %node.name, "modeler left a mention unmapped, keeping it as new");
                output.uuid_map.insert(node.uuid, node.uuid);
                output.resolved_nodes.push(node.clone());
                output.new_count += 1;
            }
        }

        cp.resolved_nodes = Some(output.resolved_nodes);
        cp.uuid_map = Some(output.uuid_map);
        cp.duplicate_pairs = Some(output.duplicate_pairs);
        self.checkpoints
            .save_with_step(cp, IngestStep::DeduplicatedEntities)
            .await?;
        Ok(())
    }

    async fn stage_extract_edges(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let chunks = cp.chunks.clone().unwrap_or_default();
        let by_chunk = cp.extracted_nodes_by_chunk.clone().unwrap_or_default();
        let uuid_map = cp.uuid_map.clone().unwrap_or_default();
        let resolved: HashMap<Uuid, Node> = cp
            .resolved_nodes
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|node| (node.uuid, node))
            .collect();
        let previous = cp.previous_episodes.clone().unwrap_or_default();
        let episode = cp.episode.clone();
        let options = cp.options.clone();

        let futures = chunks.iter().enumerate().map(|(index, chunk)| {
            // Resolved entities mentioned in this chunk.
            let mut entities: Vec<Node> = Vec::new();
            let mut seen = std::collections::HashSet::new();
            for extracted in by_chunk.get(index).map(Vec::as_slice).unwrap_or(&[]) {
                let resolved_id = uuid_map.get(&extracted.uuid).copied().unwrap_or(extracted.uuid);
                if seen.insert(resolved_id) {
                    if let Some(node) = resolved.get(&resolved_id) {
                        entities.push(node.clone());
                    }
                }
            }
            let semaphore = self.semaphore.clone();
            let episode = &episode;
            let previous = &previous;
            let options = &options;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| CoreError::Cancelled)?;
                self.edge_ops
                    .extract(episode, chunk, &entities, previous, options)
                    .await
            }
        });
        let by_chunk_edges = futures::future::try_join_all(futures).await?;
        let mut edges: Vec<Edge> = by_chunk_edges.into_iter().flatten().collect();

        // Endpoints must come from the resolution map.
        edges.retain(|edge| {
            let known = |id: &Uuid| {
                uuid_map.contains_key(id) || uuid_map.values().any(|resolved| resolved == id)
            };
            let keep = known(&edge.source_id) && known(&edge.target_id);
            if !keep {
                warn!(edge = %edge.uuid, "dropping edge with endpoints outside the uuid map");
            }
            keep
        });

        debug!(episode_id = %cp.episode_id, edges = edges.len(), "edges extracted");
        cp.extracted_edges = Some(edges);
        self.checkpoints
            .save_with_step(cp, IngestStep::ExtractedEdges)
            .await?;
        Ok(())
    }

    async fn stage_resolve_edges(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let episode_node = cp
            .main_episode_node
            .clone()
            .ok_or_else(|| CoreError::InvalidInput("checkpoint lost its episode node".into()))?;
        let input = RelationshipResolutionInput {
            extracted_edges: cp.extracted_edges.clone().unwrap_or_default(),
            resolved_nodes: cp.resolved_nodes.clone().unwrap_or_default(),
            uuid_map: cp.uuid_map.clone().unwrap_or_default(),
            duplicate_pairs: cp.duplicate_pairs.clone().unwrap_or_default(),
            episode: cp.episode.clone(),
            episode_node,
            previous_episodes: cp.previous_episodes.clone().unwrap_or_default(),
            group_id: cp.group_id.clone(),
            options: cp.options.clone(),
        };
        let output = self.modeler.resolve_relationships(input).await?;
        cp.resolved_edges = Some(output.resolved_edges);
        cp.invalidated_edges = Some(output.invalidated_edges);
        self.checkpoints
            .save_with_step(cp, IngestStep::ResolvedEdges)
            .await?;
        Ok(())
    }

    async fn stage_fill_attributes(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let hydrated = self
            .node_ops
            .fill_attributes(
                cp.resolved_nodes.clone().unwrap_or_default(),
                &cp.episode,
                cp.previous_episodes.as_deref().unwrap_or(&[]),
                &cp.options,
            )
            .await?;
        cp.hydrated_nodes = Some(hydrated);
        self.checkpoints
            .save_with_step(cp, IngestStep::ExtractedAttributes)
            .await?;
        Ok(())
    }

    async fn stage_build_episodic_edges(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        let episode_node = cp
            .main_episode_node
            .clone()
            .ok_or_else(|| CoreError::InvalidInput("checkpoint lost its episode node".into()))?;
        let entities = cp.hydrated_nodes.clone().unwrap_or_default();
        cp.episodic_edges = Some(build_episodic_edges(&episode_node, &entities));
        self.checkpoints
            .save_with_step(cp, IngestStep::BuiltEpisodicEdges)
            .await?;
        Ok(())
    }

    /// Commit every delta. On failure the checkpoint stays at
    /// `built_episodic_edges`; upserts key on `(group_id, uuid)`, so the
    /// retry replays without double-writing.
    async fn stage_commit(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        if let Some(main) = &cp.main_episode_node {
            self.driver.upsert_node(main).await?;
            for chunk_node in cp.chunk_episode_nodes.as_deref().unwrap_or(&[]) {
                if chunk_node.uuid != main.uuid {
                    self.driver.upsert_node(chunk_node).await?;
                }
            }
        }
        for node in cp.hydrated_nodes.as_deref().unwrap_or(&[]) {
            self.driver.upsert_node(node).await?;
        }
        for edge in cp.resolved_edges.as_deref().unwrap_or(&[]) {
            self.driver.upsert_edge(edge).await?;
        }
        for edge in cp.invalidated_edges.as_deref().unwrap_or(&[]) {
            self.driver.upsert_edge(edge).await?;
        }
        for edge in cp.episodic_edges.as_deref().unwrap_or(&[]) {
            self.driver.upsert_edge(edge).await?;
        }
        self.checkpoints
            .save_with_step(cp, IngestStep::PerformedGraphUpdate)
            .await?;
        Ok(())
    }

    async fn stage_update_communities(&self, cp: &mut EpisodeCheckpoint) -> Result<()> {
        if self.config.update_communities {
            let input = CommunityInput {
                resolved_nodes: cp.hydrated_nodes.clone().unwrap_or_default(),
                resolved_edges: cp.resolved_edges.clone().unwrap_or_default(),
                group_id: cp.group_id.clone(),
            };
            if let Some(output) = self.modeler.build_communities(input).await? {
                for community in &output.communities {
                    self.driver.upsert_node(community).await?;
                }
                for edge in &output.community_edges {
                    self.driver.upsert_edge(edge).await?;
                }
                cp.communities = Some(output.communities);
                cp.community_edges = Some(output.community_edges);
            }
        }
        self.checkpoints
            .save_with_step(cp, IngestStep::UpdatedCommunities)
            .await?;
        Ok(())
    }

    fn result_from(&self, cp: &EpisodeCheckpoint) -> IngestionResult {
        IngestionResult {
            resolved_nodes: cp
                .hydrated_nodes
                .clone()
                .or_else(|| cp.resolved_nodes.clone())
                .unwrap_or_default(),
            resolved_edges: cp.resolved_edges.clone().unwrap_or_default(),
            episodic_edges: cp.episodic_edges.clone().unwrap_or_default(),
            invalidated_edges: cp.invalidated_edges.clone().unwrap_or_default(),
            communities: cp.communities.clone(),
            community_edges: cp.community_edges.clone(),
        }
    }
}

fn is_cancellation(err: &CoreError) -> bool {
    match err {
        CoreError::Cancelled => true,
        CoreError::Stage { source, .. } => matches!(source.as_ref(), CoreError::Cancelled),
        _ => false,
    }
}

fn panic_payload(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
