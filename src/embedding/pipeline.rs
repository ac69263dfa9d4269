/// Batched embedding pipeline with an ordered provider fallback chain.
///
/// Texts are embedded in fixed-size batches. For each batch the strategies are
/// tried in order: transient failures are retried on the same strategy with
/// exponential backoff (1s, 2s, 4s by default), anything else moves on to the
/// next strategy. A batch that no strategy can embed fails the whole run, since
/// a partial matrix could not stay aligned with its chunks.

use indicatif::ProgressBar;
use std::sync::Arc;
use std::time::Duration;

use super::{EmbeddingError, EmbeddingProvider};

/// Retry policy applied per strategy for retryable errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    pub fn delay(&self, attempt: u8) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt as u32))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct EmbeddingPipeline {
    strategies: Vec<Arc<dyn EmbeddingProvider>>,
    batch_size: usize,
    pacing: Duration,
    retry: RetryPolicy,
    progress: Option<ProgressBar>,
}

impl EmbeddingPipeline {
    /// Create a pipeline over `strategies`, tried in order for every batch.
    pub fn new(strategies: Vec<Arc<dyn EmbeddingProvider>>) -> Self {
        EmbeddingPipeline {
            strategies,
            batch_size: 100,
            pacing: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            progress: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach a progress bar that ticks once per completed batch.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Names of the configured strategies, primary first.
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.model_name().to_string()).collect()
    }

    /// Embed every text, preserving order. All rows share one dimension.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.strategies.is_empty() {
            return Err(EmbeddingError::NotConfigured("No embedding provider configured".to_string()));
        }

        let total_batches = texts.len().div_ceil(self.batch_size);
        if let Some(pb) = &self.progress {
            pb.set_length(total_batches as u64);
        }

        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        let mut dim: Option<usize> = None;

        for (batch, chunk) in texts.chunks(self.batch_size).enumerate() {
            if batch > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }

            let vectors = self.embed_with_fallback(chunk, dim, batch).await?;
            if dim.is_none() {
                dim = vectors.first().map(|v| v.len());
            }
            out.extend(vectors);

            tracing::debug!(batch, total_batches, embedded = out.len(), "Embedding batch complete");
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        Ok(out)
    }

    /// Embed a single query through the same chain, requiring `expected_dim` when given.
    pub async fn embed_query(
        &self,
        text: &str,
        expected_dim: Option<usize>,
    ) -> Result<Vec<f32>, EmbeddingError> {
        if self.strategies.is_empty() {
            return Err(EmbeddingError::NotConfigured("No embedding provider configured".to_string()));
        }
        let mut vectors = self
            .embed_with_fallback(&[text.to_string()], expected_dim, 0)
            .await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Generation("No query embedding returned".to_string()))
    }

    async fn embed_with_fallback(
        &self,
        texts: &[String],
        expected_dim: Option<usize>,
        batch: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut last_error = None;

        for (index, strategy) in self.strategies.iter().enumerate() {
            match self.embed_with_retry(strategy.as_ref(), texts, expected_dim).await {
                Ok(vectors) => {
                    if index > 0 {
                        tracing::warn!(
                            batch,
                            strategy = strategy.model_name(),
                            "Embedding batch succeeded via fallback provider"
                        );
                    }
                    return Ok(vectors);
                }
                Err(e) => {
                    tracing::warn!(
                        batch,
                        strategy = strategy.model_name(),
                        error = %e,
                        "Embedding strategy failed for batch"
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| EmbeddingError::NotConfigured("No embedding provider configured".to_string()));
        tracing::error!(batch, error = %err, "All embedding strategies failed for batch");
        Err(err)
    }

    async fn embed_with_retry(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        expected_dim: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut attempt: u8 = 0;
        loop {
            let result = provider
                .embed_batch(texts)
                .await
                .and_then(|vectors| check_shape(vectors, texts.len(), expected_dim));
            match result {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        strategy = provider.model_name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Embedding failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Reject responses with the wrong row count or ragged/mismatched dimensions.
fn check_shape(
    vectors: Vec<Vec<f32>>,
    expected_rows: usize,
    expected_dim: Option<usize>,
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected_rows {
        return Err(EmbeddingError::CountMismatch {
            expected: expected_rows,
            actual: vectors.len(),
        });
    }
    let dim = expected_dim.or_else(|| vectors.first().map(|v| v.len()));
    if let Some(dim) = dim {
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
    }
    Ok(vectors)
}
