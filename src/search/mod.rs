/// Hybrid retrieval: BM25 and dense scores, normalized, fused and boosted.

pub mod boost;

pub use boost::{BoostManifest, PreparedBoosts};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task;

use crate::embedding::EmbeddingPipeline;
use crate::errors::GroundrankError;
use crate::index::CorpusIndex;
use crate::types::RetrievalResult;

/// Linear fusion weights for the normalized lexical and dense scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub lexical: f64,
    pub dense: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        FusionWeights { lexical: 0.5, dense: 0.5 }
    }
}

/// Min-max normalize values to [0, 1].
///
/// Returns an empty vec for empty input and all 1.0 when every value is equal.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        return vec![1.0; values.len()];
    }
    values.iter().map(|&v| (v - min) / (max - min)).collect()
}

/// Normalize both score vectors independently and combine them linearly.
pub fn fuse_scores(lexical: &[f64], dense: &[f64], weights: FusionWeights) -> Vec<f64> {
    let lexical = normalize(lexical);
    let dense = normalize(dense);
    lexical
        .iter()
        .zip(&dense)
        .map(|(l, d)| weights.lexical * l + weights.dense * d)
        .collect()
}

/// Indices ordered by score descending; equal scores keep their original order.
pub fn rank_descending(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

/// Score every chunk of `index` against one query. Pure and CPU-bound.
pub fn score_corpus(
    index: &CorpusIndex,
    query: &str,
    query_embedding: &[f32],
    top_k: usize,
    weights: FusionWeights,
    boosts: Option<&PreparedBoosts>,
) -> Result<Vec<RetrievalResult>, GroundrankError> {
    let tokens = index.tokenize(query);
    let lexical = normalize(&index.lexical_scores(&tokens));
    let dense = normalize(&index.dense_scores(query_embedding)?);

    let mut combined: Vec<f64> = lexical
        .iter()
        .zip(&dense)
        .map(|(l, d)| weights.lexical * l + weights.dense * d)
        .collect();

    if let Some(boosts) = boosts {
        for (score, chunk) in combined.iter_mut().zip(index.chunks()) {
            *score *= boosts.multiplier(chunk);
        }
    }

    Ok(rank_descending(&combined)
        .into_iter()
        .take(top_k)
        .map(|i| RetrievalResult {
            chunk: Arc::clone(&index.chunks()[i]),
            lexical_score: lexical[i],
            dense_score: dense[i],
            combined_score: combined[i],
            rerank_score: None,
            query: query.to_string(),
        })
        .collect())
}

/// Query-side entry point over a shared, immutable corpus index.
#[derive(Clone)]
pub struct HybridRetriever {
    index: Arc<CorpusIndex>,
    pipeline: Arc<EmbeddingPipeline>,
    weights: FusionWeights,
}

impl HybridRetriever {
    pub fn new(index: Arc<CorpusIndex>, pipeline: Arc<EmbeddingPipeline>, weights: FusionWeights) -> Self {
        HybridRetriever { index, pipeline, weights }
    }

    pub fn index(&self) -> &Arc<CorpusIndex> {
        &self.index
    }

    pub fn weights(&self) -> FusionWeights {
        self.weights
    }

    /// Top `top_k` chunks for `query`, non-increasing by combined score.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        boosts: Option<&BoostManifest>,
    ) -> Result<Vec<RetrievalResult>, GroundrankError> {
        let prepared = match boosts {
            Some(manifest) => {
                manifest.validate()?;
                Some(manifest.prepare())
            }
            None => None,
        };

        if top_k == 0 || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self
            .pipeline
            .embed_query(query, Some(self.index.dimension()))
            .await?;

        let index = Arc::clone(&self.index);
        let query_owned = query.to_string();
        let weights = self.weights;
        let results = task::spawn_blocking(move || {
            score_corpus(&index, &query_owned, &query_embedding, top_k, weights, prepared.as_ref())
        })
        .await
        .map_err(|e| GroundrankError::Internal(format!("Scoring task failed: {}", e)))??;

        tracing::debug!(
            query = %query,
            top_k,
            returned = results.len(),
            boosted = boosts.is_some(),
            "Hybrid search complete"
        );
        Ok(results)
    }

    /// Search each query and merge: one result per chunk, keeping its best hit.
    pub async fn search_many(
        &self,
        queries: &[String],
        top_k: usize,
        boosts: Option<&BoostManifest>,
    ) -> Result<Vec<RetrievalResult>, GroundrankError> {
        let mut merged: Vec<RetrievalResult> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();

        for query in queries {
            for hit in self.search(query, top_k, boosts).await? {
                match position.get(&hit.chunk.chunk_id) {
                    Some(&i) => {
                        if hit.combined_score > merged[i].combined_score {
                            merged[i] = hit;
                        }
                    }
                    None => {
                        position.insert(hit.chunk.chunk_id.clone(), merged.len());
                        merged.push(hit);
                    }
                }
            }
        }

        merged.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
        tracing::debug!(queries = queries.len(), unique = merged.len(), "Merged multi-query results");
        Ok(merged)
    }
}
