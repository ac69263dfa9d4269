/// Pairwise reranking with diversity filtering and a source-diversity diagnostic.
///
/// A `RelevanceModel` scores (query, passage) pairs. The reranker sorts by that
/// score, greedily drops near-duplicate passages by word-set overlap and warns
/// when the prioritized source type did not make the final cut.

pub mod http;
pub mod local;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::errors::GroundrankError;
use crate::types::{RetrievalResult, SourceType};

#[derive(Debug, Error)]
pub enum RerankError {
    #[error("Model initialization error: {0}")]
    ModelInit(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Reranker not configured: {0}")]
    NotConfigured(String),
}

/// Cross-encoder style relevance oracle.
#[async_trait]
pub trait RelevanceModel: Send + Sync {
    /// One relevance score per passage, in passage order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
pub struct RerankOptions {
    /// Character budget for query plus passage
    pub max_length: usize,
    pub diversity_threshold: f64,
    pub prioritized_source: SourceType,
}

impl Default for RerankOptions {
    fn default() -> Self {
        RerankOptions {
            max_length: 512,
            diversity_threshold: 0.8,
            prioritized_source: SourceType::Primary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub results: Vec<RetrievalResult>,
    /// True when the prioritized source type is absent from `results`
    pub missing_priority_source: bool,
    /// True when the model failed and `results` is the input order, truncated
    pub degraded: bool,
}

impl RerankOutcome {
    fn empty() -> Self {
        RerankOutcome {
            results: Vec::new(),
            missing_priority_source: false,
            degraded: false,
        }
    }
}

pub struct Reranker {
    model: Option<Arc<dyn RelevanceModel>>,
    options: RerankOptions,
}

impl Reranker {
    pub fn new(model: Option<Arc<dyn RelevanceModel>>, options: RerankOptions) -> Self {
        Reranker { model, options }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_some()
    }

    pub fn options(&self) -> RerankOptions {
        self.options
    }

    /// Rerank `candidates` for `query`, returning at most `top_n` results.
    ///
    /// `diversity_threshold` overrides the configured one; 1.0 disables the filter.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
        top_n: usize,
        diversity_threshold: Option<f64>,
    ) -> Result<RerankOutcome, GroundrankError> {
        let model = self.model.as_ref().ok_or_else(|| {
            GroundrankError::RerankerUnavailable("no relevance model initialized".to_string())
        })?;

        let threshold = diversity_threshold.unwrap_or(self.options.diversity_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(GroundrankError::validation(
                "diversity_threshold",
                "diversity threshold must be within [0, 1]",
            ));
        }

        if candidates.is_empty() || top_n == 0 {
            return Ok(RerankOutcome::empty());
        }

        let budget = self
            .options
            .max_length
            .saturating_sub(query.chars().count() + 10);
        let passages: Vec<String> = candidates
            .iter()
            .map(|c| truncate_chars(&c.chunk.content, budget).to_string())
            .collect();

        let scores = match model.score(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                tracing::error!(
                    model = model.model_name(),
                    expected = candidates.len(),
                    got = scores.len(),
                    "Relevance model returned wrong number of scores, keeping retrieval order"
                );
                return Ok(degraded(candidates, top_n));
            }
            Err(e) => {
                tracing::error!(
                    model = model.model_name(),
                    error = %e,
                    "Reranking failed, keeping retrieval order"
                );
                return Ok(degraded(candidates, top_n));
            }
        };

        let mut scored: Vec<RetrievalResult> = candidates
            .into_iter()
            .zip(scores)
            .map(|(mut result, score)| {
                result.rerank_score = Some(score);
                result
            })
            .collect();
        scored.sort_by(|a, b| {
            b.rerank_score
                .unwrap_or(f64::NEG_INFINITY)
                .total_cmp(&a.rerank_score.unwrap_or(f64::NEG_INFINITY))
        });

        let mut results = if threshold < 1.0 {
            diversity_filter(scored, threshold, top_n)
        } else {
            scored
        };
        results.truncate(top_n);

        let prioritized = self.options.prioritized_source;
        let missing_priority_source = !results.iter().any(|r| r.chunk.source_type == prioritized);
        if missing_priority_source {
            tracing::warn!(
                query = %query,
                source_type = %prioritized,
                returned = results.len(),
                "No results from prioritized source after reranking"
            );
        }

        tracing::debug!(model = model.model_name(), returned = results.len(), "Rerank complete");
        Ok(RerankOutcome {
            results,
            missing_priority_source,
            degraded: false,
        })
    }

    /// Rerank several query/candidate lists with the same model.
    pub async fn batch_rerank(
        &self,
        requests: Vec<(String, Vec<RetrievalResult>)>,
        top_n: usize,
    ) -> Result<Vec<RerankOutcome>, GroundrankError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (query, candidates) in requests {
            outcomes.push(self.rerank(&query, candidates, top_n, None).await?);
        }
        Ok(outcomes)
    }
}

fn degraded(mut candidates: Vec<RetrievalResult>, top_n: usize) -> RerankOutcome {
    candidates.truncate(top_n);
    RerankOutcome {
        results: candidates,
        missing_priority_source: false,
        degraded: true,
    }
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

/// Jaccard overlap of the lowercase whitespace-separated word sets; 0 when both are empty.
pub fn jaccard_overlap(a: &str, b: &str) -> f64 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    let a_words: HashSet<&str> = a_lower.split_whitespace().collect();
    let b_words: HashSet<&str> = b_lower.split_whitespace().collect();
    let union = a_words.union(&b_words).count();
    if union == 0 {
        return 0.0;
    }
    a_words.intersection(&b_words).count() as f64 / union as f64
}

/// Greedy filter over results sorted best-first: keep the first, then admit
/// each next result only if its overlap with every kept one is <= `threshold`.
pub fn diversity_filter(
    sorted: Vec<RetrievalResult>,
    threshold: f64,
    limit: usize,
) -> Vec<RetrievalResult> {
    let mut kept: Vec<RetrievalResult> = Vec::new();
    for candidate in sorted {
        if kept.len() >= limit {
            break;
        }
        let too_similar = kept
            .iter()
            .any(|k| jaccard_overlap(&k.chunk.content, &candidate.chunk.content) > threshold);
        if !too_similar {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scores passages by how many query words they contain.
    struct OverlapModel {
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl OverlapModel {
        fn new() -> Arc<Self> {
            Arc::new(OverlapModel { calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl RelevanceModel for OverlapModel {
        async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(passages.iter().cloned());
            let words: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
            Ok(passages
                .iter()
                .map(|p| {
                    let p = p.to_lowercase();
                    words.iter().filter(|w| p.contains(w.as_str())).count() as f64
                })
                .collect())
        }

        fn model_name(&self) -> &str {
            "overlap"
        }
    }

    struct FailingModel;

    #[async_trait]
    impl RelevanceModel for FailingModel {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f64>, RerankError> {
            Err(RerankError::Inference("onnx session crashed".into()))
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    fn result(source_type: SourceType, source_id: &str, content: &str, combined: f64) -> RetrievalResult {
        RetrievalResult {
            chunk: Arc::new(Chunk::new(source_type, source_id, "t", content)),
            lexical_score: combined,
            dense_score: combined,
            combined_score: combined,
            rerank_score: None,
            query: "q".to_string(),
        }
    }

    fn candidates() -> Vec<RetrievalResult> {
        vec![
            result(SourceType::Secondary, "a", "walking program for older adults", 0.9),
            result(SourceType::Primary, "b", "knee strengthening with squats", 0.8),
            result(SourceType::Tertiary, "c", "knee strengthening with squats and lunges", 0.7),
            result(SourceType::Secondary, "d", "knee brace fitting", 0.6),
        ]
    }

    #[tokio::test]
    async fn test_missing_model_fails_fast() {
        let reranker = Reranker::new(None, RerankOptions::default());
        let err = reranker.rerank("knee", candidates(), 3, None).await.unwrap_err();
        assert_eq!(err.kind(), "reranker_unavailable");
    }

    #[tokio::test]
    async fn test_empty_candidates_skip_the_model() {
        let model = OverlapModel::new();
        let reranker = Reranker::new(Some(model.clone()), RerankOptions::default());
        let outcome = reranker.rerank("knee", Vec::new(), 3, None).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rerank_orders_by_model_score() {
        let reranker = Reranker::new(Some(OverlapModel::new()), RerankOptions::default());
        let outcome = reranker
            .rerank("knee squats lunges", candidates(), 4, Some(1.0))
            .await
            .unwrap();
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.chunk.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "d", "a"]);
        assert_eq!(outcome.results[0].rerank_score, Some(3.0));
        assert!(!outcome.missing_priority_source);
    }

    #[tokio::test]
    async fn test_diversity_filter_drops_near_duplicates() {
        let reranker = Reranker::new(Some(OverlapModel::new()), RerankOptions::default());
        let outcome = reranker
            .rerank("knee squats lunges", candidates(), 4, Some(0.5))
            .await
            .unwrap();
        // "b" shares 4 of 6 words with "c"
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.chunk.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "a"]);
        for (i, a) in outcome.results.iter().enumerate() {
            for b in &outcome.results[i + 1..] {
                assert!(jaccard_overlap(&a.chunk.content, &b.chunk.content) <= 0.5);
            }
        }
        assert!(outcome.missing_priority_source);
    }

    #[tokio::test]
    async fn test_model_failure_keeps_input_order() {
        let reranker = Reranker::new(Some(Arc::new(FailingModel)), RerankOptions::default());
        let outcome = reranker.rerank("knee", candidates(), 2, None).await.unwrap();
        assert!(outcome.degraded);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.chunk.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(outcome.results.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_passages_are_truncated_to_budget() {
        let model = OverlapModel::new();
        let options = RerankOptions { max_length: 20, ..Default::default() };
        let reranker = Reranker::new(Some(model.clone()), options);
        reranker
            .rerank("knee", vec![result(SourceType::Primary, "a", "ééééééééééééééééééééé", 1.0)], 1, None)
            .await
            .unwrap();
        // 20 - 4 - 10 = 6 characters
        assert_eq!(model.seen.lock().unwrap()[0], "éééééé");
    }

    #[tokio::test]
    async fn test_batch_rerank_runs_each_request() {
        let model = OverlapModel::new();
        let reranker = Reranker::new(Some(model.clone()), RerankOptions::default());
        let outcomes = reranker
            .batch_rerank(
                vec![("knee".to_string(), candidates()), ("walking".to_string(), candidates())],
                1,
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].results[0].chunk.source_id, "a");
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_jaccard_edge_cases() {
        assert_eq!(jaccard_overlap("", "   "), 0.0);
        assert_eq!(jaccard_overlap("Knee Pain", "knee pain"), 1.0);
        assert_eq!(jaccard_overlap("a b", "b c"), 1.0 / 3.0);
    }

    #[test]
    fn test_truncate_chars_is_boundary_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
        assert_eq!(truncate_chars("hi", 0), "");
    }
}
