//! Embedding backend plug-in point.
//!
//! The retriever depends on this seam, not on any concrete model runtime.
//! When no backend is wired in, [`NoopEmbedder`] reports unavailable and the
//! semantic/hybrid search modes silently downgrade to full-text.

use async_trait::async_trait;

use crate::error::BrokerError;

#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    /// Load the backend. Called once before first use; may fail, in which
    /// case the generator stays unavailable.
    async fn initialize(&self) -> Result<(), BrokerError>;

    fn is_available(&self) -> bool;

    /// Output vector length.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str, is_query: bool) -> Result<Vec<f32>, BrokerError>;

    async fn embed_batch(
        &self,
        texts: &[String],
        are_queries: bool,
    ) -> Result<Vec<Vec<f32>>, BrokerError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text, are_queries).await?);
        }
        Ok(out)
    }
}

/// Placeholder used when no embedding backend is present.
#[derive(Debug, Default)]
pub struct NoopEmbedder;

#[async_trait]
impl EmbeddingGenerator for NoopEmbedder {
    async fn initialize(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        false
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str, _is_query: bool) -> Result<Vec<f32>, BrokerError> {
        Err(BrokerError::IndexStoreIo {
            reason: "no embedding backend available".to_string(),
        })
    }
}

/// Cosine similarity; 0.0 for mismatched or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
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
