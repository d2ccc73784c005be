//! Fact dating and contradiction discovery prompts.

use chrono::{DateTime, Utc};
use predicato_graph::{Episode, Node};
use serde::Deserialize;

use crate::nlp::NlpMessage;
use crate::prompts::{previous_episodes_context, system_prompt};
use crate::tabular::TabularFormat;

/// Columns of the one-row dating response table.
pub const DATE_FIELDS: &[(&str, &str)] = &[
    (
        "valid_at",
        "RFC3339 timestamp at which the fact became true, or null if the \
         episode does not say",
    ),
    (
        "invalid_at",
        "RFC3339 timestamp at which the fact stopped being true, or null",
    ),
];

/// The dating decision for one fact.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeDatesRow {
    #[serde(default)]
    pub valid_at: Option<String>,
    #[serde(default)]
    pub invalid_at: Option<String>,
}

/// Columns of the contradiction response table.
pub const CONTRADICTION_FIELDS: &[(&str, &str)] =
    &[("id", "index of an existing fact the new fact contradicts")];

/// One contradicted candidate, by position.
#[derive(Debug, Clone, Deserialize)]
pub struct ContradictionRow {
    pub id: i64,
}

/// Build the dating conversation for one fact.
///
/// The reference timestamp is the episode's own validity start; relative
/// expressions in the episode ("last year", "since March") resolve
/// against it.
pub fn extract_edge_dates(
    fact: &str,
    episode: &Episode,
    previous: &[Node],
    reference: DateTime<Utc>,
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&previous_episodes_context(previous));
    user.push_str(&format!("EPISODE:\n{}\n", episode.content));
    user.push_str(&format!("REFERENCE TIME: {}\n", reference.to_rfc3339()));
    user.push_str(&format!("FACT: {fact}\n"));
    user.push_str(
        "\nDetermine when the fact became true and, if the episode says \
         so, when it stopped being true. Resolve relative dates against \
         the REFERENCE TIME and answer in UTC. Use null when the episode \
         gives no date.\n\n",
    );
    user.push_str(&format.instructions(DATE_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

/// Build the contradiction conversation: which existing facts does the
/// new fact invalidate?
pub fn find_contradictions(
    new_fact: &str,
    existing_facts: &[String],
    reference: DateTime<Utc>,
    format: TabularFormat,
) -> Vec<NlpMessage> {
    let mut user = String::new();
    user.push_str(&format!("REFERENCE TIME: {}\n", reference.to_rfc3339()));
    user.push_str(&format!("NEW FACT: {new_fact}\n"));
    user.push_str("EXISTING FACTS:\n");
    for (index, fact) in existing_facts.iter().enumerate() {
        user.push_str(&format!("  {index}: {fact}\n"));
    }
    user.push_str(
        "\nGiven the new fact, decide which of the existing facts it \
         contradicts - facts that can no longer be true now that the new \
         fact holds. Facts that can coexist with the new fact are not \
         contradicted. Return one row per contradicted fact; return an \
         empty table when nothing is contradicted.\n\n",
    );
    user.push_str(&format.instructions(CONTRADICTION_FIELDS));

    vec![system_prompt(), NlpMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dating_prompt_carries_reference_time() {
        let episode = Episode::new("ep", "g", "Alice joined Acme last June.");
        let reference: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();
        let messages =
            extract_edge_dates("Alice works for Acme.", &episode, &[], reference, TabularFormat::Tsv);
        let content = &messages[1].content;
        assert!(content.contains("REFERENCE TIME: 2024-06-01T12:00:00+00:00"));
        assert!(content.contains("FACT: Alice works for Acme."));
        assert!(content.contains("when the fact became true"));
    }

    #[test]
    fn test_contradiction_prompt_indexes_candidates() {
        let reference: DateTime<Utc> = "2024-06-01T00:00:00Z".parse().unwrap();
        let messages = find_contradictions(
            "Alice works for Globex.",
            &["Alice works for Acme.".to_string()],
            reference,
            TabularFormat::Tsv,
        );
        let content = &messages[1].content;
        assert!(content.contains("0: Alice works for Acme."));
        assert!(content.contains("it contradicts"));
    }
}
