//! The per-episode checkpoint document.
//!
//! An [`EpisodeCheckpoint`] is a complete snapshot of one episode's trip
//! through the ingestion pipeline: the original inputs, the step reached,
//! retry bookkeeping, and the cached output of every completed stage. A
//! resumed run consults only the fields at or after the recorded step;
//! earlier fields are already baked into later ones.
//!
//! Everything here is plain serializable data. Edges cache endpoint UUIDs,
//! never node pointers, so the document round-trips through JSON without
//! cycles.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use predicato_graph::{Edge, Episode, IngestionOptions, Node};

use crate::step::IngestStep;

/// Pairing of a content chunk with the episodic node minted for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkTuple {
    /// Index into the cached `chunks` vector.
    pub chunk_index: usize,
    /// UUID of the episodic node standing for this chunk.
    pub episode_node: Uuid,
}

/// Durable snapshot of one episode's pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeCheckpoint {
    /// Caller-assigned episode id; also keys the checkpoint file.
    pub episode_id: String,

    /// Tenant partition.
    pub group_id: String,

    /// Last step whose output is fully recorded.
    #[serde(default)]
    pub step: IngestStep,

    /// When processing of this episode first began.
    pub created_at: DateTime<Utc>,

    /// Stamped on every save.
    pub last_updated_at: DateTime<Utc>,

    /// Number of failed attempts so far.
    #[serde(default)]
    pub attempt_count: u32,

    /// Display form of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Debug form (or captured panic payload) of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_stack: Option<String>,

    /// The episode exactly as submitted.
    pub episode: Episode,

    /// Options the episode was submitted with.
    #[serde(default)]
    pub options: IngestionOptions,

    /// Chunking limit in characters.
    pub max_characters: usize,

    // Stage outputs, in pipeline order.
    /// `prepared`: character-bounded content slices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<String>>,

    /// `got_previous_episodes`: recent episodic nodes for context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_episodes: Option<Vec<Node>>,

    /// `created_chunks`: one episodic node per chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_episode_nodes: Option<Vec<Node>>,

    /// `created_chunks`: the episodic node for the whole episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_episode_node: Option<Node>,

    /// `created_chunks`: chunk-to-node pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_tuples: Option<Vec<ChunkTuple>>,

    /// `extracted_entities`: raw extractions, outer index = chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_nodes_by_chunk: Option<Vec<Vec<Node>>>,

    /// `deduplicated_entities`: entities after resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_nodes: Option<Vec<Node>>,

    /// `deduplicated_entities`: extracted UUID -> resolved UUID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid_map: Option<HashMap<Uuid, Uuid>>,

    /// `deduplicated_entities`: extra (extracted, existing) duplicate
    /// pairs awaiting IS_DUPLICATE_OF edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_pairs: Option<Vec<(Uuid, Uuid)>>,

    /// `extracted_edges`: raw relationship extractions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_edges: Option<Vec<Edge>>,

    /// `resolved_edges`: union of new and kept-existing edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_edges: Option<Vec<Edge>>,

    /// `resolved_edges`: prior edges closed by this episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_edges: Option<Vec<Edge>>,

    /// `extracted_attributes`: entities after summary/embedding fill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hydrated_nodes: Option<Vec<Node>>,

    /// `built_episodic_edges`: MENTIONED_IN edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodic_edges: Option<Vec<Edge>>,

    /// `updated_communities`: refreshed community nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<Vec<Node>>,

    /// `updated_communities`: refreshed community membership edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_edges: Option<Vec<Edge>>,
}

impl EpisodeCheckpoint {
    /// Create a fresh checkpoint at [`IngestStep::Initial`].
    pub fn new(episode: Episode, options: IngestionOptions, max_characters: usize) -> Self {
        let now = Utc::now();
        Self {
            episode_id: episode.id.clone(),
            group_id: episode.group_id.clone(),
            step: IngestStep::Initial,
            created_at: now,
            last_updated_at: now,
            attempt_count: 0,
            last_error: None,
            last_error_stack: None,
            episode,
            options,
            max_characters,
            chunks: None,
            previous_episodes: None,
            chunk_episode_nodes: None,
            main_episode_node: None,
            episode_tuples: None,
            extracted_nodes_by_chunk: None,
            resolved_nodes: None,
            uuid_map: None,
            duplicate_pairs: None,
            extracted_edges: None,
            resolved_edges: None,
            invalidated_edges: None,
            hydrated_nodes: None,
            episodic_edges: None,
            communities: None,
            community_edges: None,
        }
    }

    /// Percentage complete for the recorded step.
    pub fn progress(&self) -> u8 {
        self.step.progress()
    }

    /// True when the recorded step is an NLP-backed, resumable one.
    pub fn is_recoverable(&self) -> bool {
        self.step.is_recoverable()
    }

    /// Whether another attempt is allowed: fewer than `max_attempts`
    /// failures so far and the checkpoint is no older than `max_age`.
    pub fn can_retry(&self, max_attempts: u32, max_age: Duration) -> bool {
        self.attempt_count < max_attempts && Utc::now() - self.created_at <= max_age
    }

    /// Record a failed attempt.
    pub fn record_error(&mut self, error: impl std::fmt::Display, stack: Option<String>) {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
        self.last_error_stack = stack;
        self.last_updated_at = Utc::now();
    }

    /// Advance to `step`, stamping the update time.
    pub fn advance_to(&mut self, step: IngestStep) {
        self.step = step;
        self.last_updated_at = Utc::now();
    }

    /// Age of the checkpoint relative to its first attempt.
    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// Time since the last save.
    pub fn idle_for(&self) -> Duration {
        Utc::now() - self.last_updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::Episode;

    fn checkpoint() -> EpisodeCheckpoint {
        EpisodeCheckpoint::new(
            Episode::new("ep-1", "g", "Alice works for Acme."),
            IngestionOptions::default(),
            1000,
        )
    }

    #[test]
    fn test_new_checkpoint_starts_at_initial() {
        let cp = checkpoint();
        assert_eq!(cp.step, IngestStep::Initial);
        assert_eq!(cp.attempt_count, 0);
        assert_eq!(cp.progress(), 0);
        assert!(cp.chunks.is_none());
    }

    #[test]
    fn test_can_retry_gates_on_attempts_and_age() {
        let mut cp = checkpoint();
        assert!(cp.can_retry(3, Duration::hours(1)));

        cp.attempt_count = 3;
        assert!(!cp.can_retry(3, Duration::hours(1)));

        cp.attempt_count = 0;
        cp.created_at = Utc::now() - Duration::hours(2);
        assert!(!cp.can_retry(3, Duration::hours(1)));
    }

    #[test]
    fn test_record_error_increments_attempts() {
        let mut cp = checkpoint();
        cp.record_error("stage extracted_edges failed", Some("trace".into()));
        assert_eq!(cp.attempt_count, 1);
        assert_eq!(
            cp.last_error.as_deref(),
            Some("stage extracted_edges failed")
        );
        assert_eq!(cp.last_error_stack.as_deref(), Some("trace"));
    }

    proptest::proptest! {
        #[test]
        fn prop_checkpoint_document_roundtrips(
            content in ".{0,200}",
            attempts in 0u32..10,
            step_index in 0usize..13,
        ) {
            let mut cp = EpisodeCheckpoint::new(
                Episode::new("ep-prop", "g", content),
                IngestionOptions::default(),
                1000,
            );
            cp.attempt_count = attempts;
            cp.step = IngestStep::ALL[step_index];
            let json = serde_json::to_string(&cp).unwrap();
            let restored: EpisodeCheckpoint = serde_json::from_str(&json).unwrap();
            proptest::prop_assert_eq!(cp, restored);
        }
    }

    #[test]
    fn test_roundtrip_preserves_stage_outputs() {
        let mut cp = checkpoint();
        cp.chunks = Some(vec!["Alice works for Acme.".into()]);
        cp.uuid_map = Some(HashMap::from([(uuid::Uuid::nil(), uuid::Uuid::nil())]));
        cp.advance_to(IngestStep::DeduplicatedEntities);

        let json = serde_json::to_string_pretty(&cp).unwrap();
        let restored: EpisodeCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(cp, restored);
    }
}
