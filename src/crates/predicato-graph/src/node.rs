//! Graph vertices: entities, episode nodes, and communities.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::ids::new_uuid;

/// Entity-type tag used when the caller supplies no ontology.
pub const DEFAULT_ENTITY_TYPE: &str = "Entity";

/// Vertex kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// An extracted, resolved entity.
    Entity,
    /// The node standing for one ingested episode (or chunk of one).
    Episodic,
    /// A cluster-of-entities summary node.
    Community,
}

/// A vertex of the property graph.
///
/// `(group_id, uuid)` is unique. `valid_from`/`valid_to` bound the span in
/// which the node's fact content held; `valid_to` of `None` means "still
/// valid". Entity nodes must carry a non-empty `name`. Episodic nodes are
/// the only kind that populate `content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Time-ordered unique id.
    pub uuid: Uuid,

    /// Tenant partition.
    pub group_id: String,

    /// Vertex kind.
    pub node_type: NodeType,

    /// Free-form entity-type tag (`"Entity"` by default).
    #[serde(default = "default_entity_type")]
    pub entity_type: String,

    /// Display name. Non-empty for entity nodes.
    pub name: String,

    /// Accumulated natural-language summary.
    #[serde(default)]
    pub summary: String,

    /// Raw episode content. Episodic nodes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Dense vector over `name + " " + summary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Dense vector over `name` alone, used for resolution lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_embedding: Option<Vec<f32>>,

    /// Start of the validity span.
    pub valid_from: DateTime<Utc>,

    /// End of the validity span; `None` while still valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,

    /// When the graph learned about this node.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,

    /// Free-form properties.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_entity_type() -> String {
    DEFAULT_ENTITY_TYPE.to_string()
}

impl Node {
    /// Create an entity node valid from now.
    pub fn entity(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            uuid: new_uuid(),
            group_id: group_id.into(),
            node_type: NodeType::Entity,
            entity_type: default_entity_type(),
            name: name.into(),
            summary: String::new(),
            content: None,
            embedding: None,
            name_embedding: None,
            valid_from: now,
            valid_to: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Create an episodic node for ingested content.
    pub fn episodic(
        group_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        reference_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: new_uuid(),
            group_id: group_id.into(),
            node_type: NodeType::Episodic,
            entity_type: default_entity_type(),
            name: name.into(),
            summary: String::new(),
            content: Some(content.into()),
            embedding: None,
            name_embedding: None,
            valid_from: reference_time,
            valid_to: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Create a community node.
    pub fn community(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        let mut node = Self::entity(group_id, name);
        node.node_type = NodeType::Community;
        node
    }

    /// Set the entity-type tag.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the start of the validity span.
    pub fn with_valid_from(mut self, valid_from: DateTime<Utc>) -> Self {
        self.valid_from = valid_from;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Text fed to the full embedding.
    pub fn embedding_text(&self) -> String {
        if self.summary.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.summary)
        }
    }

    /// Check the model invariants for this node.
    pub fn validate(&self) -> Result<()> {
        if self.node_type == NodeType::Entity && self.name.trim().is_empty() {
            return Err(GraphError::EmptyName(self.uuid));
        }
        if let Some(valid_to) = self.valid_to {
            if valid_to < self.valid_from {
                return Err(GraphError::InvalidLifespan(self.uuid));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_defaults() {
        let node = Node::entity("g", "Alice");
        assert_eq!(node.node_type, NodeType::Entity);
        assert_eq!(node.entity_type, DEFAULT_ENTITY_TYPE);
        assert!(node.valid_to.is_none());
        assert!(node.validate().is_ok());
    }

    #[test]
    fn test_empty_name_is_invalid() {
        let node = Node::entity("g", "  ");
        assert!(matches!(node.validate(), Err(GraphError::EmptyName(_))));
    }

    #[test]
    fn test_lifespan_ordering_is_checked() {
        let mut node = Node::entity("g", "Alice");
        node.valid_to = Some(node.valid_from - chrono::Duration::seconds(1));
        assert!(matches!(
            node.validate(),
            Err(GraphError::InvalidLifespan(_))
        ));
    }

    #[test]
    fn test_embedding_text_joins_name_and_summary() {
        let node = Node::entity("g", "Alice").with_summary("Works for Acme.");
        assert_eq!(node.embedding_text(), "Alice Works for Acme.");
        let bare = Node::entity("g", "Alice");
        assert_eq!(bare.embedding_text(), "Alice");
    }
}
