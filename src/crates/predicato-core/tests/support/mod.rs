//! Shared test doubles: a pattern-routed NLP script and a
//! deterministic embedder.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use predicato_core::error::{CoreError, NlpErrorKind};
use predicato_core::{Embedder, NlpClient, NlpMessage, NlpResponse};

struct Rule {
    pattern: String,
    response: String,
}

/// NLP double that routes on prompt content.
///
/// The first rule whose pattern occurs in the conversation text answers
/// the call; rules are reusable. Unmatched calls answer with an empty
/// reply, which the tabular layer reads as an empty table. `fail_once_on`
/// injects a single non-retryable failure for a pattern.
#[derive(Default)]
pub struct ScriptedNlp {
    rules: Mutex<Vec<Rule>>,
    failures: Mutex<Vec<(String, String)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedNlp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.lock().push(Rule {
            pattern: pattern.into(),
            response: response.into(),
        });
        self
    }

    pub fn fail_once_on(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.lock().push((pattern.into(), message.into()));
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Number of calls whose conversation contained `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|text| text.contains(pattern))
            .count()
    }
}

#[async_trait]
impl NlpClient for ScriptedNlp {
    async fn chat(&self, messages: &[NlpMessage]) -> predicato_core::Result<NlpResponse> {
        let text: String = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.calls.lock().push(text.clone());

        {
            let mut failures = self.failures.lock();
            if let Some(position) = failures.iter().position(|(pattern, _)| text.contains(pattern))
            {
                let (_, message) = failures.remove(position);
                return Err(CoreError::nlp(NlpErrorKind::Refusal, message));
            }
        }

        let rules = self.rules.lock();
        for rule in rules.iter() {
            if text.contains(&rule.pattern) {
                return Ok(NlpResponse::new(rule.response.clone()));
            }
        }
        Ok(NlpResponse::new(""))
    }
}

/// Deterministic embedder: same text, same vector.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> predicato_core::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| embed_one(text)).collect())
    }
}

fn embed_one(text: &str) -> Vec<f32> {
    let mut state: u64 = 1469598103934665603;
    for byte in text.to_lowercase().bytes() {
        state ^= byte as u64;
        state = state.wrapping_mul(1099511628211);
    }
    (0..8)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect()
}
