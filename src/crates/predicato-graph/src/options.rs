//! Per-episode ingestion policy.

use serde::{Deserialize, Serialize};

/// Default minimum cosine similarity for merging two entity mentions.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;

/// A caller-supplied entity type offered to extraction.
///
/// Type id 0 is always the catch-all `"Entity"`; caller types are numbered
/// from 1 in the order given here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityTypeSpec {
    /// Tag stored on matching nodes (e.g. `PERSON`).
    pub name: String,
    /// One-line description shown to the extraction prompt.
    #[serde(default)]
    pub description: String,
}

impl EntityTypeSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Relation labels legal for a given head/tail entity-type pair.
///
/// When any rules are present, relationship extraction is restricted to
/// the labels they admit; pairs with no matching rule fall back to
/// free-form labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeTypeRule {
    pub source_type: String,
    pub target_type: String,
    pub relations: Vec<String>,
}

/// Policy knobs consumed by the resolution pipeline.
///
/// These are persisted verbatim inside the processing checkpoint so a
/// resumed episode replays under the options it was submitted with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionOptions {
    /// Mint a fresh node per extraction instead of resolving against the
    /// existing graph (identity uuid map).
    #[serde(default)]
    pub skip_resolution: bool,

    /// Skip the missed-entity reflexion pass after extraction.
    #[serde(default)]
    pub skip_reflexion: bool,

    /// Skip the attribute/summary fill stage.
    #[serde(default)]
    pub skip_attributes: bool,

    /// Keep every extracted edge as new instead of resolving against
    /// existing edges.
    #[serde(default)]
    pub skip_edge_resolution: bool,

    /// Minimum similarity for merge candidates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Ask for YAML response tables instead of TSV.
    #[serde(default)]
    pub use_yaml: bool,

    /// Caller ontology offered to extraction; id 0 ("Entity") is implicit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_types: Vec<EntityTypeSpec>,

    /// Entity-type tags dropped from extraction output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_entity_types: Vec<String>,

    /// Legal relation labels per head/tail type pair.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edge_type_rules: Vec<EdgeTypeRule>,
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            skip_resolution: false,
            skip_reflexion: false,
            skip_attributes: false,
            skip_edge_resolution: false,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            use_yaml: false,
            entity_types: Vec::new(),
            excluded_entity_types: Vec::new(),
            edge_type_rules: Vec::new(),
        }
    }
}

impl IngestionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip_resolution(mut self, skip: bool) -> Self {
        self.skip_resolution = skip;
        self
    }

    pub fn with_skip_reflexion(mut self, skip: bool) -> Self {
        self.skip_reflexion = skip;
        self
    }

    pub fn with_skip_attributes(mut self, skip: bool) -> Self {
        self.skip_attributes = skip;
        self
    }

    pub fn with_skip_edge_resolution(mut self, skip: bool) -> Self {
        self.skip_edge_resolution = skip;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_use_yaml(mut self, use_yaml: bool) -> Self {
        self.use_yaml = use_yaml;
        self
    }

    pub fn with_entity_type(mut self, spec: EntityTypeSpec) -> Self {
        self.entity_types.push(spec);
        self
    }

    pub fn with_edge_type_rule(mut self, rule: EdgeTypeRule) -> Self {
        self.edge_type_rules.push(rule);
        self
    }

    /// Relation labels admitted for a head/tail type pair, if restricted.
    pub fn relations_for(&self, source_type: &str, target_type: &str) -> Option<&[String]> {
        self.edge_type_rules
            .iter()
            .find(|rule| rule.source_type == source_type && rule.target_type == target_type)
            .map(|rule| rule.relations.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold() {
        let options = IngestionOptions::default();
        assert_eq!(options.similarity_threshold, 0.85);
        assert!(!options.skip_resolution);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: IngestionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, IngestionOptions::default());
    }

    #[test]
    fn test_relations_for_matches_pair() {
        let options = IngestionOptions::new().with_edge_type_rule(EdgeTypeRule {
            source_type: "PERSON".into(),
            target_type: "ORGANIZATION".into(),
            relations: vec!["WORKS_FOR".into(), "FOUNDED".into()],
        });
        assert_eq!(
            options.relations_for("PERSON", "ORGANIZATION").unwrap(),
            &["WORKS_FOR".to_string(), "FOUNDED".to_string()]
        );
        assert!(options.relations_for("ORGANIZATION", "PERSON").is_none());
    }
}
