//! Entity extraction and reflexion prompts.

use predicato_graph::{Episode, EpisodeType, Node};
use serde::Deserialize;

use crate::nlp::NlpMessage;
use crate::prompts::{episode_context, previous_episodes_context, system_prompt};
use crate::tabular::TabularFormat;

/// Columns of the extraction response table.
pub const EXTRACTION_FIELDS: &[(&str, &str)] = &[
    ("name", "the entity's name, exactly as it should appear in the graph"),
    (
        "entity_type_id",
        "integer id from the ENTITY TYPES table (0 when nothing fits better)",
    ),
    (
        "summary",
        "one short sentence about the entity based on this episode (optional)",
    ),
];

/// One extracted entity mention.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedEntityRow {
    pub name: String,
    #[serde(default)]
    pub entity_type_id: Option<i64>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Columns of the reflexion response table.
pub const REFLEXION_FIELDS: &[(&str, &str)] =
    &[("name", "the name of an entity that was missed")];

/// One entity the reflexion pass believes was missed.
#[derive(Debug, Clone, Deserialize)]
pub struct ReflexionRow {
    pub name: String,
}

/// Render the entity-type table: id 0 is always the catch-all "Entity",
/// caller types are numbered from 1.
pub fn entity_type_table(entity_types: &[predicato_graph::EntityTypeSpec]) -> String {
    let mut out = String::from("ENTITY TYPES:\n  0: Entity - anything not covered below\n");
    for (offset, spec) in entity_types.iter().enumerate() {
        out.push_str(&format!("  {}: {}", offset + 1, spec.name));
        if !spec.description.is_empty() {
            out.push_str(&format!(" - {}", spec.description));
        }
        out.push('\n');
    }
    out
}

/// Build the extraction conversation for one chunk.
///
/// `custom_prompt` is a free-form slot; the reflexion loop uses it to
/// inject entities missed by the previous iteration.
pub fn extract_entities(
    episode: &Episode,
    chunk_text: &str,
    previous: &[Node],
    entity_types: &[predicato_graph::EntityTypeSpec],
    custom_prompt: &str,
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let task = match episode.episode_type {
        EpisodeType::Message => {
            "Extract the entities mentioned in the CURRENT MESSAGE below. \
             Only extract entities the message itself refers to; the \
             previous episodes are context for resolving pronouns and \
             shorthand."
        }
        EpisodeType::Text => {
            "Extract the entities mentioned in the DOCUMENT below. Extract \
             every distinct person, organization, place, or thing the text \
             is about."
        }
        EpisodeType::Json => {
            "Extract the entities described by the JSON RECORD below. Treat \
             keys as hints about what the values are; extract the values \
             that name real-world entities."
        }
    };

    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&episode_context(episode, chunk_text));
    user.push_str(&entity_type_table(entity_types));
    user.push('\n');
    user.push_str(task);
    user.push('\n');
    if !custom_prompt.is_empty() {
        user.push('\n');
        user.push_str(custom_prompt);
        user.push('\n');
    }
    user.push('\n');
    user.push_str(&format.instructions(EXTRACTION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

/// Build the reflexion conversation: given what extraction produced, ask
/// which salient entities were missed.
pub fn reflexion(
    episode: &Episode,
    chunk_text: &str,
    previous: &[Node],
    extracted_names: &[String],
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&episode_context(episode, chunk_text));
    user.push_str("ALREADY EXTRACTED:\n");
    if extracted_names.is_empty() {
        user.push_str("  (nothing)\n");
    }
    for name in extracted_names {
        user.push_str(&format!("  - {name}\n"));
    }
    user.push_str(
        "\nWhich entities were missed? List only entities that appear in \
         the episode and matter to its meaning. If nothing was missed, \
         return an empty table.\n\n",
    );
    user.push_str(&format.instructions(REFLEXION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use predicato_graph::EntityTypeSpec;

    #[test]
    fn test_type_table_always_has_entity_zero() {
        let table = entity_type_table(&[]);
        assert!(table.contains("0: Entity"));

        let table = entity_type_table(&[
            EntityTypeSpec::new("PERSON", "a human being"),
            EntityTypeSpec::new("ORGANIZATION", ""),
        ]);
        assert!(table.contains("0: Entity"));
        assert!(table.contains("1: PERSON - a human being"));
        assert!(table.contains("2: ORGANIZATION"));
    }

    #[test]
    fn test_extraction_prompt_dispatches_on_episode_type() {
        let message = Episode::new("ep", "g", "hi");
        let json = message.clone().with_episode_type(predicato_graph::EpisodeType::Json);

        let for_message = extract_entities(&message, "hi", &[], &[], "", TabularFormat::Tsv);
        assert!(for_message[1].content.contains("CURRENT MESSAGE"));

        let for_json = extract_entities(&json, "hi", &[], &[], "", TabularFormat::Tsv);
        assert!(for_json[1].content.contains("JSON RECORD"));
    }

    #[test]
    fn test_custom_prompt_is_injected() {
        let episode = Episode::new("ep", "g", "hi");
        let messages = extract_entities(
            &episode,
            "hi",
            &[],
            &[],
            "Make sure to include: Globex",
            TabularFormat::Tsv,
        );
        assert!(messages[1].content.contains("Make sure to include: Globex"));
    }
}
