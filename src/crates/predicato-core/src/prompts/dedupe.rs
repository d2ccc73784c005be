//! Entity resolution prompt: map fresh extractions onto existing nodes.

use predicato_graph::{Episode, Node};
use serde::Deserialize;

use crate::nlp::NlpMessage;
use crate::prompts::{episode_context, previous_episodes_context, system_prompt};
use crate::tabular::TabularFormat;

/// Columns of the resolution response table.
pub const RESOLUTION_FIELDS: &[(&str, &str)] = &[
    ("id", "index of the extracted entity this row is about"),
    (
        "duplicate_idx",
        "index of the existing entity it is the same as, or -1 if it is new",
    ),
    (
        "duplicates",
        "comma-separated indices of any additional existing entities that \
         are also the same real-world entity (optional)",
    ),
];

/// One resolution decision.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeResolutionRow {
    pub id: i64,
    #[serde(default = "new_entity")]
    pub duplicate_idx: i64,
    #[serde(default)]
    pub duplicates: Option<serde_json::Value>,
}

fn new_entity() -> i64 {
    -1
}

/// Build the resolution conversation: extracted mentions vs. existing
/// candidates.
pub fn resolve_entities(
    extracted: &[Node],
    candidates: &[Node],
    episode: &Episode,
    previous: &[Node],
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&episode_context(episode, &episode.content));

    user.push_str("EXTRACTED ENTITIES:\n");
    for (index, node) in extracted.iter().enumerate() {
        user.push_str(&format!("  {index}: {} ({})", node.name, node.entity_type));
        if !node.summary.is_empty() {
            user.push_str(&format!(" - {}", node.summary));
        }
        user.push('\n');
    }

    user.push_str("EXISTING ENTITIES:\n");
    for (index, node) in candidates.iter().enumerate() {
        user.push_str(&format!("  {index}: {} ({})", node.name, node.entity_type));
        if !node.summary.is_empty() {
            user.push_str(&format!(" - {}", node.summary));
        }
        user.push('\n');
    }

    user.push_str(
        "\nFor each extracted entity, decide whether it is a duplicate of \
         an existing entity. Two entries are duplicates only when they \
         refer to the same real-world entity, not merely similar ones. \
         Emit one row per extracted entity.\n\n",
    );
    user.push_str(&format.instructions(RESOLUTION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_indexes_both_lists() {
        let extracted = vec![Node::entity("g", "Alice"), Node::entity("g", "Acme")];
        let candidates = vec![Node::entity("g", "Acme Corporation").with_summary("a company")];
        let episode = Episode::new("ep", "g", "Alice joined Acme.");

        let messages = resolve_entities(&extracted, &candidates, &episode, &[], TabularFormat::Tsv);
        let content = &messages[1].content;
        assert!(content.contains("0: Alice"));
        assert!(content.contains("1: Acme"));
        assert!(content.contains("0: Acme Corporation"));
        assert!(content.contains("duplicate of an existing entity"));
    }

    #[test]
    fn test_row_defaults_to_new() {
        let row: NodeResolutionRow = serde_json::from_value(serde_json::json!({"id": 0})).unwrap();
        assert_eq!(row.duplicate_idx, -1);
        assert!(row.duplicates.is_none());
    }
}
