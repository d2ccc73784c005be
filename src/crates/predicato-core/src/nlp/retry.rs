//! Retry layer for NLP calls - exponential backoff for transient failures.
//!
//! Wraps any [`NlpClient`] with the pipeline's retry policy: rate limits,
//! 5xx/gateway failures, timeouts, and connection resets are re-attempted
//! with exponential backoff; refusals, empty responses, and other 4xx are
//! surfaced immediately. The wrapper honors a [`CancellationToken`]
//! throughout, including while sleeping between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::nlp::{NlpClient, NlpMessage, NlpResponse};

/// Retry strategy configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial call.
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,

    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,

    /// Whether to add random jitter to backoff delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Configuration with custom max retries and the default backoff.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the initial backoff delay.
    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set the maximum backoff delay.
    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry `attempt` (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped at the maximum.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powi(exponent as i32)) as u64;
        let delay_ms = delay_ms.min(self.max_backoff_ms);

        let delay_ms = if self.jitter {
            // Up to 25% random jitter, spreading simultaneous retries.
            let jitter_amount = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter_amount
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// An [`NlpClient`] wrapper adding retry-with-backoff and cancellation.
pub struct RetryingNlp {
    inner: Arc<dyn NlpClient>,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryingNlp {
    /// Wrap `inner` with the default policy and a fresh token.
    pub fn new(inner: Arc<dyn NlpClient>) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the retry policy.
    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn call_with_retry<F, Fut>(&self, mut call: F) -> Result<NlpResponse>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<NlpResponse>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                result = call() => result,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient nlp failure, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    debug!(attempt, error = %err, "nlp call failed without retry");
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl NlpClient for RetryingNlp {
    async fn chat(&self, messages: &[NlpMessage]) -> Result<NlpResponse> {
        self.call_with_retry(|| self.inner.chat(messages)).await
    }

    async fn chat_with_structured_output(
        &self,
        messages: &[NlpMessage],
        schema: &serde_json::Value,
    ) -> Result<NlpResponse> {
        self.call_with_retry(|| self.inner.chat_with_structured_output(messages, schema))
            .await
    }
}
