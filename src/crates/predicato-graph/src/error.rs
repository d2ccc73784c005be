//! Error types for the graph data model.

use thiserror::Error;

/// Result type for graph model operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised by model-level validation.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Entity nodes must carry a non-empty name.
    #[error("entity node {0} has an empty name")]
    EmptyName(uuid::Uuid),

    /// `valid_to`, when set, must not precede `valid_from`.
    #[error("element {0} has valid_to earlier than valid_from")]
    InvalidLifespan(uuid::Uuid),

    /// Edge endpoints must live in the same group as the edge.
    #[error("edge {0} references endpoints outside group {1}")]
    GroupMismatch(uuid::Uuid, String),

    /// A required identifier was empty or malformed.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}
