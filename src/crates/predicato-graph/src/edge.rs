//! Graph edges: relationships, episodic mentions, duplicate links.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::ids::new_uuid;

/// Relation label of the episode-to-entity mention edge.
pub const MENTIONED_IN: &str = "MENTIONED_IN";

/// Relation label linking an entity to another entity it duplicates.
pub const IS_DUPLICATE_OF: &str = "IS_DUPLICATE_OF";

/// Edge kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    /// A fact relating two entities.
    Entity,
    /// A mention edge from an episode node to an entity.
    Episodic,
    /// Membership of an entity in a community.
    Community,
}

/// A directed relationship between two nodes of the same group.
///
/// Endpoints are referenced by UUID only so edges can be cached inside
/// checkpoints without dragging node state along. `name` holds the
/// relation label (e.g. `WORKS_FOR`), `summary` the full fact sentence the
/// relation was distilled from. The `valid_from`/`valid_to` pair bounds
/// when the fact held; temporal invalidation closes the span by writing
/// `valid_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    /// Time-ordered unique id.
    pub uuid: Uuid,

    /// Tenant partition; endpoints live in the same group.
    pub group_id: String,

    /// Edge kind.
    pub edge_type: EdgeType,

    /// Source node UUID.
    pub source_id: Uuid,

    /// Target node UUID.
    pub target_id: Uuid,

    /// Relation label.
    pub name: String,

    /// Fact sentence.
    #[serde(default)]
    pub summary: String,

    /// Dense vector over the fact sentence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Optional relation strength in `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f32>,

    /// Start of the validity span.
    pub valid_from: DateTime<Utc>,

    /// End of the validity span; `None` while still valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,

    /// When the graph learned about this edge.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,

    /// Free-form properties.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Edge {
    /// Create an entity-to-entity fact edge valid from now.
    pub fn entity(
        group_id: impl Into<String>,
        source_id: Uuid,
        target_id: Uuid,
        name: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: new_uuid(),
            group_id: group_id.into(),
            edge_type: EdgeType::Entity,
            source_id,
            target_id,
            name: name.into(),
            summary: summary.into(),
            embedding: None,
            strength: None,
            valid_from: now,
            valid_to: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Create a `MENTIONED_IN` edge from an episode node to an entity,
    /// stamped with the episode's reference time.
    pub fn episodic(
        group_id: impl Into<String>,
        episode_uuid: Uuid,
        entity_uuid: Uuid,
        reference_time: DateTime<Utc>,
    ) -> Self {
        let mut edge = Self::entity(group_id, episode_uuid, entity_uuid, MENTIONED_IN, "");
        edge.edge_type = EdgeType::Episodic;
        edge.valid_from = reference_time;
        edge
    }

    /// Create an `IS_DUPLICATE_OF` edge between two entity nodes.
    pub fn duplicate_of(group_id: impl Into<String>, source_id: Uuid, target_id: Uuid) -> Self {
        Self::entity(group_id, source_id, target_id, IS_DUPLICATE_OF, "")
    }

    /// Set the start of the validity span.
    pub fn with_valid_from(mut self, valid_from: DateTime<Utc>) -> Self {
        self.valid_from = valid_from;
        self
    }

    /// Set the relation strength.
    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = Some(strength);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True while the fact is open or `instant` falls inside its span.
    pub fn is_valid_at(&self, instant: DateTime<Utc>) -> bool {
        self.valid_from <= instant && self.valid_to.map_or(true, |end| end > instant)
    }

    /// True once `valid_to` has been written and passed.
    pub fn is_expired_at(&self, instant: DateTime<Utc>) -> bool {
        self.valid_to.map_or(false, |end| end <= instant)
    }

    /// Check the model invariants for this edge against its group.
    pub fn validate(&self) -> Result<()> {
        if let Some(valid_to) = self.valid_to {
            if valid_to < self.valid_from {
                return Err(GraphError::InvalidLifespan(self.uuid));
            }
        }
        if self.name.trim().is_empty() {
            return Err(GraphError::InvalidIdentifier(format!(
                "edge {} has no relation label",
                self.uuid
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entity_edge_defaults() {
        let a = new_uuid();
        let b = new_uuid();
        let edge = Edge::entity("g", a, b, "WORKS_FOR", "Alice works for Acme.");
        assert_eq!(edge.edge_type, EdgeType::Entity);
        assert!(edge.valid_to.is_none());
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_episodic_edge_carries_reference_time() {
        let when = Utc::now() - Duration::days(3);
        let edge = Edge::episodic("g", new_uuid(), new_uuid(), when);
        assert_eq!(edge.name, MENTIONED_IN);
        assert_eq!(edge.edge_type, EdgeType::Episodic);
        assert_eq!(edge.valid_from, when);
    }

    #[test]
    fn test_validity_windows() {
        let start = Utc::now();
        let mut edge = Edge::entity("g", new_uuid(), new_uuid(), "KNOWS", "").with_valid_from(start);
        assert!(edge.is_valid_at(start));
        assert!(edge.is_valid_at(start + Duration::days(365)));

        edge.valid_to = Some(start + Duration::days(1));
        assert!(edge.is_valid_at(start + Duration::hours(12)));
        assert!(!edge.is_valid_at(start + Duration::days(2)));
        assert!(edge.is_expired_at(start + Duration::days(2)));
    }

    #[test]
    fn test_reversed_lifespan_is_invalid() {
        let mut edge = Edge::entity("g", new_uuid(), new_uuid(), "KNOWS", "");
        edge.valid_to = Some(edge.valid_from - Duration::seconds(5));
        assert!(edge.validate().is_err());
    }
}
