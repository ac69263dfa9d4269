/// Embedding provider trait and supporting types
///
/// Provides a pluggable interface for text embedding generation.
/// Supports local fastembed models (default, no API key) and any
/// OpenAI-compatible `/embeddings` endpoint.

pub mod local;
pub mod openai;
pub mod pipeline;

use async_trait::async_trait;
use thiserror::Error;

pub use pipeline::{EmbeddingPipeline, RetryPolicy};

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// fastembed model initialization failure
    #[error("Model initialization error: {0}")]
    ModelInit(String),

    /// Embedding generation failure (inference error)
    #[error("Embedding generation error: {0}")]
    Generation(String),

    /// Network-level failure reaching a remote provider
    #[error("Transport error: {0}")]
    Transport(String),

    /// API provider returned an HTTP error
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider not configured (e.g., missing API key)
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// Provider answered with vectors of the wrong shape
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Provider answered with a different number of vectors than inputs
    #[error("Count mismatch: sent {expected} texts, got {actual} vectors")]
    CountMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Whether retrying the same provider may succeed.
    ///
    /// Rate limits, server errors and transport failures are transient.
    /// Everything else moves straight on to the next provider in the chain.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Transport(_) => true,
            EmbeddingError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Core trait for embedding text into fixed-dimension float vectors.
///
/// Implementations must be Send + Sync to support use in async contexts
/// and across thread boundaries (e.g., Arc<dyn EmbeddingProvider>).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for the given text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed several texts in one call. Output order matches input order.
    ///
    /// The default implementation calls `embed` sequentially; providers with
    /// native batching override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Return the model name identifier (e.g., "all-MiniLM-L6-v2").
    fn model_name(&self) -> &str;

    /// Return the dimension of the embedding vectors produced by this model.
    fn dimension(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EmbeddingError::Api { status: 429, message: "slow down".into() }.is_retryable());
        assert!(EmbeddingError::Api { status: 503, message: "busy".into() }.is_retryable());
        assert!(EmbeddingError::Transport("reset".into()).is_retryable());
        assert!(!EmbeddingError::Api { status: 401, message: "bad key".into() }.is_retryable());
        assert!(!EmbeddingError::NotConfigured("no key".into()).is_retryable());
        assert!(!EmbeddingError::DimensionMismatch { expected: 3, actual: 4 }.is_retryable());
    }
}
