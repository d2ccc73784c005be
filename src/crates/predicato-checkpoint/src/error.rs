//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Episode id is empty, contains path separators, `..`, or NUL, or
    /// would resolve outside the checkpoint directory.
    #[error("Invalid episode id: {0:?}")]
    InvalidEpisodeId(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored document does not describe a usable checkpoint
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),
}

impl CheckpointError {
    /// True for the identifier-validation failure, which must be reported
    /// to the caller without touching the filesystem.
    pub fn is_invalid_id(&self) -> bool {
        matches!(self, CheckpointError::InvalidEpisodeId(_))
    }
}
