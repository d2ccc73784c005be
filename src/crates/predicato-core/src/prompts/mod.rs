//! Prompt library - templated, context-filled prompts for every NLP call
//! in the pipeline.
//!
//! Each call site lives in its own module together with the serde row
//! struct its response table decodes into and the `FIELDS` table that
//! both documents the columns and drives the format instructions. The
//! orchestrator and operations never assemble prompt text themselves.
//!
//! | module | call sites |
//! |--------|-----------|
//! | [`entities`] | extraction (message/text/json), reflexion |
//! | [`dedupe`] | entity resolution against existing candidates |
//! | [`edges`] | relationship extraction, edge dedup + invalidation |
//! | [`temporal`] | fact dating, contradiction discovery |
//! | [`attributes`] | summary/attribute fill, community summaries |

pub mod attributes;
pub mod dedupe;
pub mod edges;
pub mod entities;
pub mod temporal;

use predicato_graph::{Episode, EpisodeType, Node};

use crate::nlp::NlpMessage;

/// Shared system persona for every structured call.
pub fn system_prompt() -> NlpMessage {
    NlpMessage::system(
        "You are an information extraction system that converts textual \
         episodes into a temporally-aware knowledge graph. Only state what \
         the provided text supports, and follow the response format \
         instructions exactly.",
    )
}

/// Field tags of a `FIELDS` table, for header validation.
pub fn tags<'a>(fields: &'a [(&'a str, &'a str)]) -> Vec<&'a str> {
    fields.iter().map(|(tag, _)| *tag).collect()
}

/// Render the episode block shared by extraction-style prompts.
pub fn episode_context(episode: &Episode, chunk_text: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "EPISODE ({}):\n{}\n",
        episode_kind(episode.episode_type),
        chunk_text
    ));
    out.push_str(&format!(
        "REFERENCE TIME: {}\n",
        episode.reference_time.to_rfc3339()
    ));
    if !episode.source_description.is_empty() {
        out.push_str(&format!("SOURCE: {}\n", episode.source_description));
    }
    out
}

fn episode_kind(episode_type: EpisodeType) -> &'static str {
    match episode_type {
        EpisodeType::Message => "conversational message",
        EpisodeType::Text => "text document",
        EpisodeType::Json => "JSON record",
    }
}

/// Render prior-episode context, newest first.
pub fn previous_episodes_context(previous: &[Node]) -> String {
    if previous.is_empty() {
        return "PREVIOUS EPISODES: (none)\n".to_string();
    }
    let mut out = String::from("PREVIOUS EPISODES:\n");
    for node in previous {
        let gist = if !node.summary.is_empty() {
            node.summary.clone()
        } else {
            let content = node.content.as_deref().unwrap_or("");
            content.chars().take(200).collect()
        };
        out.push_str(&format!("- {}: {}\n", node.name, gist));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_episode_context_mentions_reference_time() {
        let episode = Episode::new("ep-1", "g", "Alice works for Acme.")
            .with_reference_time("2024-06-01T12:00:00Z".parse().unwrap());
        let context = episode_context(&episode, &episode.content);
        assert!(context.contains("2024-06-01T12:00:00"));
        assert!(context.contains("Alice works for Acme."));
    }

    #[test]
    fn test_previous_context_prefers_summary() {
        let mut node = Node::episodic("g", "ep-0", "raw content here", Utc::now());
        node.summary = "a prior chat".into();
        let context = previous_episodes_context(&[node]);
        assert!(context.contains("a prior chat"));
        assert!(!context.contains("raw content here"));
    }
}
