//! Embedder capability consumed by the pipeline.

use async_trait::async_trait;

use crate::error::{CoreError, Result};

/// Batch text-to-dense-vector capability.
///
/// Implementations must be safe for concurrent use. Vectors from one
/// embedder instance are assumed mutually comparable by cosine
/// similarity.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text. The default implementation batches.
    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| CoreError::Embedder("empty embedding batch".to_string()))
    }
}

/// Cosine similarity between two vectors; zero for mismatched or empty
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
