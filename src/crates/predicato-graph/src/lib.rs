//! Property-graph data model for predicato.
//!
//! This crate defines the vocabulary shared by every other predicato crate:
//!
//! - [`Episode`] - an immutable unit of textual input, carrying a reference
//!   time and a tenant group
//! - [`Node`] - an entity, episodic, or community vertex
//! - [`Edge`] - a relationship between two nodes, with temporal validity
//! - [`IngestionOptions`] - per-episode policy knobs consumed by the
//!   resolution pipeline
//! - [`new_uuid`] - time-ordered (sortable) identifier allocation
//!
//! All types serialize via serde so they can be cached verbatim inside a
//! processing checkpoint. Edges reference their endpoints by UUID only;
//! node pointers never appear in serialized state.
//!
//! # Temporal semantics
//!
//! Two timelines run through the model. `reference_time` / `valid_from` /
//! `valid_to` describe when a fact held in the world; `created_at` /
//! `updated_at` describe when the graph learned about it. Audit questions
//! use the latter, temporal queries and invalidation use the former.

pub mod edge;
pub mod episode;
pub mod error;
pub mod ids;
pub mod node;
pub mod options;

pub use edge::{Edge, EdgeType, IS_DUPLICATE_OF, MENTIONED_IN};
pub use episode::{Episode, EpisodeType};
pub use error::{GraphError, Result};
pub use ids::new_uuid;
pub use node::{Node, NodeType, DEFAULT_ENTITY_TYPE};
pub use options::{EdgeTypeRule, EntityTypeSpec, IngestionOptions};
