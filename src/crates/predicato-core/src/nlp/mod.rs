//! NLP capability consumed by the pipeline.
//!
//! Predicato is an ingestion engine, not an LLM client library: the core
//! defines a minimal [`NlpClient`] trait and callers plug in their own
//! provider. Every structured call in the pipeline goes through
//! [`chat`](NlpClient::chat) with a tabular response contract (see
//! [`crate::tabular`]); providers that support schema-constrained output
//! can override
//! [`chat_with_structured_output`](NlpClient::chat_with_structured_output).
//!
//! Implementations must be safe for concurrent use; the orchestrator
//! fans out per-chunk extraction over a shared client.

pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use retry::{RetryConfig, RetryingNlp};

/// Speaker of one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One turn of an NLP conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NlpMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NlpMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A provider's reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlpResponse {
    /// Reply text.
    pub content: String,

    /// Model that produced the reply, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Prompt token count, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,

    /// Completion token count, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

impl NlpResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Chat-style structured extraction capability.
#[async_trait]
pub trait NlpClient: Send + Sync {
    /// Send a conversation and return the reply.
    async fn chat(&self, messages: &[NlpMessage]) -> Result<NlpResponse>;

    /// Send a conversation with a response schema hint. The default
    /// implementation ignores the schema and delegates to [`chat`].
    ///
    /// [`chat`]: NlpClient::chat
    async fn chat_with_structured_output(
        &self,
        messages: &[NlpMessage],
        _schema: &serde_json::Value,
    ) -> Result<NlpResponse> {
        self.chat(messages).await
    }
}
