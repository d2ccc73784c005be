//! Error taxonomy for the ingestion pipeline.

use predicato_checkpoint::IngestStep;
use thiserror::Error;

use crate::nlp::NlpMessage;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Classification of an NLP failure, driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlpErrorKind {
    /// 429 or an explicitly typed rate-limit error. Retryable.
    RateLimited,
    /// 5xx or gateway failure. Retryable.
    Unavailable,
    /// Deadline elapsed. Retryable.
    Timeout,
    /// Connection reset or refused. Retryable.
    Connection,
    /// The model declined to answer. Not retryable.
    Refusal,
    /// The model returned no content. Not retryable.
    EmptyResponse,
    /// Malformed request, other 4xx. Not retryable.
    InvalidRequest,
}

impl NlpErrorKind {
    /// Whether the retry layer should re-attempt the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NlpErrorKind::RateLimited
                | NlpErrorKind::Unavailable
                | NlpErrorKind::Timeout
                | NlpErrorKind::Connection
        )
    }
}

/// Errors raised by the ingestion pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid episode, group, or options. Reported to the caller, never
    /// retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Graph driver failure.
    #[error("driver error: {0}")]
    Driver(String),

    /// NLP provider failure.
    #[error("nlp error ({kind:?}): {message}")]
    Nlp {
        kind: NlpErrorKind,
        message: String,
    },

    /// Embedder failure.
    #[error("embedder error: {0}")]
    Embedder(String),

    /// The tolerant parser exhausted its re-prompt budget. Carries the
    /// final raw reply and the full message history.
    #[error("unparseable response: {message}")]
    BadResponse {
        message: String,
        raw: String,
        transcript: Vec<NlpMessage>,
    },

    /// A modeler operation failed, annotated with what the wrapper did
    /// about it.
    #[error("modeler step {step} failed (fallback={fallback}, skipped={skipped}): {source}")]
    Modeler {
        step: &'static str,
        fallback: bool,
        skipped: bool,
        #[source]
        source: Box<CoreError>,
    },

    /// A pipeline stage failed; the checkpoint remains at `step`.
    #[error("stage {step} failed: {source}")]
    Stage {
        step: IngestStep,
        #[source]
        source: Box<CoreError>,
    },

    /// A stage panicked; the payload was captured into the checkpoint.
    #[error("stage {step} panicked: {payload}")]
    Panicked { step: IngestStep, payload: String },

    /// The checkpoint's retry gate is closed.
    #[error("episode {episode_id} exhausted retries after {attempts} attempts")]
    RetryExhausted { episode_id: String, attempts: u32 },

    /// The cancellation token tripped mid-call.
    #[error("operation cancelled")]
    Cancelled,

    /// Checkpoint storage failure.
    #[error(transparent)]
    Checkpoint(#[from] predicato_checkpoint::CheckpointError),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Data-model invariant violation.
    #[error(transparent)]
    Graph(#[from] predicato_graph::GraphError),
}

impl CoreError {
    /// Shorthand for an NLP failure of the given kind.
    pub fn nlp(kind: NlpErrorKind, message: impl Into<String>) -> Self {
        CoreError::Nlp {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a driver failure.
    pub fn driver(message: impl Into<String>) -> Self {
        CoreError::Driver(message.into())
    }

    /// Wrap a stage failure, preserving an existing wrap.
    pub fn stage(step: IngestStep, source: CoreError) -> Self {
        match source {
            CoreError::Stage { .. } | CoreError::Panicked { .. } => source,
            other => CoreError::Stage {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Whether the retry layer may re-attempt the failed call.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Nlp { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// The pipeline step a stage failure occurred in, if any.
    pub fn failed_step(&self) -> Option<IngestStep> {
        match self {
            CoreError::Stage { step, .. } | CoreError::Panicked { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::nlp(NlpErrorKind::RateLimited, "429").is_retryable());
        assert!(CoreError::nlp(NlpErrorKind::Unavailable, "502").is_retryable());
        assert!(CoreError::nlp(NlpErrorKind::Timeout, "deadline").is_retryable());
        assert!(!CoreError::nlp(NlpErrorKind::Refusal, "no").is_retryable());
        assert!(!CoreError::nlp(NlpErrorKind::EmptyResponse, "").is_retryable());
        assert!(!CoreError::Driver("constraint".into()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
    }

    #[test]
    fn test_stage_wrap_is_idempotent() {
        let inner = CoreError::nlp(NlpErrorKind::Refusal, "no");
        let wrapped = CoreError::stage(IngestStep::ExtractedEdges, inner);
        let rewrapped = CoreError::stage(IngestStep::ResolvedEdges, wrapped);
        assert_eq!(rewrapped.failed_step(), Some(IngestStep::ExtractedEdges));
    }
}
