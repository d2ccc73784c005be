//! Episodes - the immutable units of ingestion.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The shape of an episode's content, selecting the extraction prompt used
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    /// A chat-style message, typically `speaker: text`.
    #[default]
    Message,
    /// Free-running prose or a document fragment.
    Text,
    /// A JSON record; extraction walks keys and values.
    Json,
}

/// One unit of textual input to ingest.
///
/// Episodes are immutable once submitted: re-ingesting the same `id`
/// resumes (or replays) the earlier run rather than producing a second
/// copy of the graph delta. `reference_time` drives temporal semantics of
/// everything extracted from the episode; `created_at` records when the
/// episode entered the system and drives audit only. No ordering between
/// the two is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    /// Stable caller-assigned identifier, unique within the group.
    pub id: String,

    /// Tenant partition. Every graph element produced from this episode
    /// lands in this group.
    pub group_id: String,

    /// Human-readable label for the episode node.
    pub name: String,

    /// Raw textual content.
    pub content: String,

    /// Logical event time of the content.
    pub reference_time: DateTime<Utc>,

    /// Ingestion time.
    pub created_at: DateTime<Utc>,

    /// Content shape, selecting the extraction prompt.
    #[serde(default)]
    pub episode_type: EpisodeType,

    /// Where the content came from, quoted to the extraction prompts.
    #[serde(default)]
    pub source_description: String,

    /// Free-form caller metadata, carried onto the episode node.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Episode {
    /// Create an episode with `reference_time` and `created_at` both set
    /// to now.
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: id.clone(),
            id,
            group_id: group_id.into(),
            content: content.into(),
            reference_time: now,
            created_at: now,
            episode_type: EpisodeType::default(),
            source_description: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the logical event time.
    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    /// Set the content shape.
    pub fn with_episode_type(mut self, episode_type: EpisodeType) -> Self {
        self.episode_type = episode_type;
        self
    }

    /// Set the source description quoted to extraction prompts.
    pub fn with_source_description(mut self, description: impl Into<String>) -> Self {
        self.source_description = description.into();
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
