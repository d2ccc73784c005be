//! Attribute/summary fill and community summarization prompts.

use predicato_graph::{Episode, Node};
use serde::Deserialize;

use crate::nlp::NlpMessage;
use crate::prompts::{previous_episodes_context, system_prompt};
use crate::tabular::TabularFormat;

/// Columns of the attribute-fill response table.
pub const ATTRIBUTE_FIELDS: &[(&str, &str)] = &[
    ("id", "index of the entity this row is about"),
    (
        "summary",
        "updated one-paragraph summary of the entity, folding in what this \
         episode adds",
    ),
];

/// One attribute-fill decision.
#[derive(Debug, Clone, Deserialize)]
pub struct AttributeRow {
    pub id: i64,
    pub summary: String,
}

/// Build the attribute-fill conversation for one batch of nodes.
pub fn fill_attributes(
    nodes: &[Node],
    episode: &Episode,
    previous: &[Node],
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&format!("EPISODE:\n{}\n", episode.content));

    user.push_str("ENTITIES:\n");
    for (index, node) in nodes.iter().enumerate() {
        user.push_str(&format!("  {index}: {} ({})\n", node.name, node.entity_type));
        if !node.summary.is_empty() {
            user.push_str(&format!("     current summary: {}\n", node.summary));
        }
        for (key, value) in &node.metadata {
            user.push_str(&format!("     {key}: {value}\n"));
        }
    }

    user.push_str(
        "\nWrite an updated one-paragraph summary for each entity, keeping \
         what the current summary already records and folding in what this \
         episode adds. Emit one row per entity.\n\n",
    );
    user.push_str(&format.instructions(ATTRIBUTE_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

/// Build a plain-text community summarization conversation.
pub fn summarize_community(members: &[Node]) -> Vec<NlpMessage> {
    let mut user = String::from("COMMUNITY MEMBERS:\n");
    for node in members {
        user.push_str(&format!("  - {}", node.name));
        if !node.summary.is_empty() {
            user.push_str(&format!(": {}", node.summary));
        }
        user.push('\n');
    }
    user.push_str(
        "\nSummarize this community of related entities in two or three \
         sentences: what connects them and what the graph knows about \
         them. Reply with the summary text only.\n",
    );

    vec![system_prompt(), NlpMessage::user(user)]
}
