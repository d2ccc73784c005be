//! Relationship extraction and edge resolution prompts.

use predicato_graph::{Episode, IngestionOptions, Node};
use serde::Deserialize;

use crate::nlp::NlpMessage;
use crate::prompts::{episode_context, previous_episodes_context, system_prompt};
use crate::tabular::TabularFormat;

/// Columns of the relationship extraction response table.
pub const EXTRACTION_FIELDS: &[(&str, &str)] = &[
    ("source_name", "name of the source entity, from the ENTITIES list"),
    ("relation", "relation label in UPPER_SNAKE_CASE, e.g. WORKS_FOR"),
    ("target_name", "name of the target entity, from the ENTITIES list"),
    ("fact", "one full sentence stating the fact"),
];

/// One extracted fact triple.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEdgeRow {
    pub source_name: String,
    pub relation: String,
    pub target_name: String,
    #[serde(default)]
    pub fact: Option<String>,
}

/// Columns of the edge resolution response table.
pub const RESOLUTION_FIELDS: &[(&str, &str)] = &[
    ("id", "index of the new relationship this row is about"),
    (
        "duplicate_idx",
        "index of the existing relationship stating the same fact, or -1",
    ),
    (
        "invalidates",
        "comma-separated indices of existing relationships this new fact \
         supersedes (optional)",
    ),
];

/// One edge resolution decision.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeResolutionRow {
    pub id: i64,
    #[serde(default = "new_edge")]
    pub duplicate_idx: i64,
    #[serde(default)]
    pub invalidates: Option<serde_json::Value>,
}

fn new_edge() -> i64 {
    -1
}

/// Build the relationship extraction conversation for one chunk.
///
/// Extraction is restricted to the entities provided; when the options
/// carry edge-type rules, the legal relation labels per head/tail pair
/// are listed as well.
pub fn extract_edges(
    episode: &Episode,
    chunk_text: &str,
    entities: &[Node],
    options: &IngestionOptions,
    previous: &[Node],
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&episode_context(episode, chunk_text));

    user.push_str("ENTITIES:\n");
    for node in entities {
        user.push_str(&format!("  - {} ({})\n", node.name, node.entity_type));
    }

    if !options.edge_type_rules.is_empty() {
        user.push_str("ALLOWED RELATIONS:\n");
        for rule in &options.edge_type_rules {
            user.push_str(&format!(
                "  {} -> {}: {}\n",
                rule.source_type,
                rule.target_type,
                rule.relations.join(", ")
            ));
        }
        user.push_str(
            "For entity pairs not listed above, any UPPER_SNAKE_CASE label \
             is allowed.\n",
        );
    }

    user.push_str(
        "\nExtract factual relationships between the ENTITIES above that \
         the episode states or clearly implies. Use only entities from the \
         list; skip facts involving anything else.\n\n",
    );
    user.push_str(&format.instructions(EXTRACTION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

/// Build the edge resolution conversation: new facts vs. existing edges
/// at the same endpoints.
pub fn resolve_edges(
    new_facts: &[String],
    existing_facts: &[String],
    episode: &Episode,
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&episode_context(episode, &episode.content));

    user.push_str("NEW RELATIONSHIPS:\n");
    for (index, fact) in new_facts.iter().enumerate() {
        user.push_str(&format!("  {index}: {fact}\n"));
    }
    user.push_str("EXISTING RELATIONSHIPS:\n");
    for (index, fact) in existing_facts.iter().enumerate() {
        user.push_str(&format!("  {index}: {fact}\n"));
    }

    user.push_str(
        "\nFor each new relationship, decide whether it is a duplicate of \
         an existing relationship (the same fact, possibly reworded), and \
         which existing relationships it supersedes because the new fact \
         replaces them. Emit one row per new relationship.\n\n",
    );
    user.push_str(&format.instructions(RESOLUTION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}
