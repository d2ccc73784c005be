//! The fixed step order of the per-episode ingestion state machine.

use serde::{Deserialize, Serialize};

/// Processing steps, in pipeline order.
///
/// Transitions are strictly linear: each step has exactly one successor
/// and a resumed episode replays from the recorded step with every earlier
/// stage's output already cached. The six NLP-backed steps are
/// *recoverable*: a failure there keeps partial outputs and a later
/// attempt re-enters the same step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestStep {
    #[default]
    Initial,
    Prepared,
    GotPreviousEpisodes,
    CreatedChunks,
    ExtractedEntities,
    DeduplicatedEntities,
    ExtractedEdges,
    ResolvedEdges,
    ExtractedAttributes,
    BuiltEpisodicEdges,
    PerformedGraphUpdate,
    UpdatedCommunities,
    Completed,
}

impl IngestStep {
    /// Every step, in pipeline order.
    pub const ALL: [IngestStep; 13] = [
        IngestStep::Initial,
        IngestStep::Prepared,
        IngestStep::GotPreviousEpisodes,
        IngestStep::CreatedChunks,
        IngestStep::ExtractedEntities,
        IngestStep::DeduplicatedEntities,
        IngestStep::ExtractedEdges,
        IngestStep::ResolvedEdges,
        IngestStep::ExtractedAttributes,
        IngestStep::BuiltEpisodicEdges,
        IngestStep::PerformedGraphUpdate,
        IngestStep::UpdatedCommunities,
        IngestStep::Completed,
    ];

    /// Zero-based position within [`IngestStep::ALL`].
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|step| step == self).unwrap_or(0)
    }

    /// The unique next step, or `None` from `Completed`.
    pub fn successor(&self) -> Option<IngestStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Percentage complete: `ceil(100 * index / (N - 1))`.
    pub fn progress(&self) -> u8 {
        let last = Self::ALL.len() - 1;
        ((self.index() * 100 + last - 1) / last) as u8
    }

    /// True for steps whose action is an NLP call; failures there preserve
    /// partial outputs and are worth retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IngestStep::ExtractedEntities
                | IngestStep::DeduplicatedEntities
                | IngestStep::ExtractedEdges
                | IngestStep::ResolvedEdges
                | IngestStep::ExtractedAttributes
                | IngestStep::UpdatedCommunities
        )
    }

    /// Stable snake_case tag, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStep::Initial => "initial",
            IngestStep::Prepared => "prepared",
            IngestStep::GotPreviousEpisodes => "got_previous_episodes",
            IngestStep::CreatedChunks => "created_chunks",
            IngestStep::ExtractedEntities => "extracted_entities",
            IngestStep::DeduplicatedEntities => "deduplicated_entities",
            IngestStep::ExtractedEdges => "extracted_edges",
            IngestStep::ResolvedEdges => "resolved_edges",
            IngestStep::ExtractedAttributes => "extracted_attributes",
            IngestStep::BuiltEpisodicEdges => "built_episodic_edges",
            IngestStep::PerformedGraphUpdate => "performed_graph_update",
            IngestStep::UpdatedCommunities => "updated_communities",
            IngestStep::Completed => "completed",
        }
    }
}

impl std::fmt::Display for IngestStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_step_has_unique_successor() {
        for window in IngestStep::ALL.windows(2) {
            assert_eq!(window[0].successor(), Some(window[1]));
        }
        assert_eq!(IngestStep::Completed.successor(), None);
    }

    #[test]
    fn test_progress_endpoints() {
        assert_eq!(IngestStep::Initial.progress(), 0);
        assert_eq!(IngestStep::Completed.progress(), 100);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut last = 0;
        for step in IngestStep::ALL {
            assert!(step.progress() >= last);
            last = step.progress();
        }
    }

    #[test]
    fn test_progress_rounds_up() {
        // index 1 of 12 transitions: ceil(100/12) = 9
        assert_eq!(IngestStep::Prepared.progress(), 9);
    }

    #[test]
    fn test_recoverable_steps_are_the_nlp_ones() {
        let recoverable: Vec<_> = IngestStep::ALL
            .iter()
            .filter(|step| step.is_recoverable())
            .collect();
        assert_eq!(
            recoverable,
            vec![
                &IngestStep::ExtractedEntities,
                &IngestStep::DeduplicatedEntities,
                &IngestStep::ExtractedEdges,
                &IngestStep::ResolvedEdges,
                &IngestStep::ExtractedAttributes,
                &IngestStep::UpdatedCommunities,
            ]
        );
    }

    #[test]
    fn test_serde_tags_match_as_str() {
        for step in IngestStep::ALL {
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }
    }
}
