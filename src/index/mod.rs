/// Corpus index: chunks, BM25 index and dense embedding matrix.
///
/// Built once (or loaded from disk keyed by content hash) and read-only afterwards.
/// Shared across queries behind an `Arc`; nothing on the query path locks.

pub mod lexical;
pub mod persist;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task;

use crate::embedding::EmbeddingPipeline;
use crate::errors::GroundrankError;
use crate::types::{Chunk, SourceType};
use lexical::{Bm25Index, Bm25Params, Tokenizer};
use persist::IndexMetadata;

pub struct CorpusIndex {
    chunks: Vec<Arc<Chunk>>,
    embeddings: Vec<Vec<f32>>,
    dimension: usize,
    tokenizer: Tokenizer,
    bm25: Bm25Index,
    content_hash: String,
}

/// Per-source-type breakdown of the indexed corpus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcesInfo {
    pub total_chunks: usize,
    pub sources: BTreeMap<SourceType, SourceSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub chunk_count: usize,
    /// Distinct document ids, sorted
    pub source_ids: Vec<String>,
}

impl CorpusIndex {
    /// Build an index from chunks and their embeddings (row i belongs to chunk i).
    ///
    /// Headers are clamped, chunk ids must be unique and every row must share
    /// one dimension.
    pub fn from_parts(
        chunks: Vec<Chunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self, GroundrankError> {
        if chunks.len() != embeddings.len() {
            return Err(GroundrankError::validation(
                "embeddings",
                &format!(
                    "{} embeddings for {} chunks",
                    embeddings.len(),
                    chunks.len()
                ),
            ));
        }

        let dimension = embeddings.first().map(|r| r.len()).unwrap_or(0);
        if let Some(row) = embeddings.iter().position(|r| r.len() != dimension) {
            return Err(GroundrankError::validation(
                "embeddings",
                &format!("row {} has dimension {}, expected {}", row, embeddings[row].len(), dimension),
            ));
        }

        let mut seen = HashSet::with_capacity(chunks.len());
        for chunk in &chunks {
            if !seen.insert(chunk.chunk_id.as_str()) {
                return Err(GroundrankError::validation(
                    "chunk_id",
                    &format!("duplicate chunk id {}", chunk.chunk_id),
                ));
            }
        }

        let content_hash = persist::content_hash(&chunks);
        let tokenizer = Tokenizer::new()?;
        let tokens: Vec<Vec<String>> = chunks.iter().map(|c| tokenizer.tokenize(&c.content)).collect();
        let bm25 = Bm25Index::build(&tokens, Bm25Params::default());

        let chunks = chunks
            .into_iter()
            .map(|mut c| {
                c.clamp_headers();
                Arc::new(c)
            })
            .collect();

        Ok(CorpusIndex {
            chunks,
            embeddings,
            dimension,
            tokenizer,
            bm25,
            content_hash,
        })
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn embeddings(&self) -> &[Vec<f32>] {
        &self.embeddings
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenizer.tokenize(text)
    }

    /// Raw BM25 score per chunk, in corpus order.
    pub fn lexical_scores(&self, query_tokens: &[String]) -> Vec<f64> {
        self.bm25.scores(query_tokens)
    }

    /// Inner product of `query` with every stored embedding, in corpus order.
    pub fn dense_scores(&self, query: &[f32]) -> Result<Vec<f64>, GroundrankError> {
        if !self.is_empty() && query.len() != self.dimension {
            return Err(GroundrankError::EmbeddingProvider(format!(
                "query embedding has dimension {}, index has {}",
                query.len(),
                self.dimension
            )));
        }
        Ok(self
            .embeddings
            .iter()
            .map(|row| {
                row.iter()
                    .zip(query)
                    .map(|(a, b)| *a as f64 * *b as f64)
                    .sum()
            })
            .collect())
    }

    pub fn sources_info(&self) -> SourcesInfo {
        let mut counts: BTreeMap<SourceType, (usize, BTreeSet<&str>)> = BTreeMap::new();
        for chunk in &self.chunks {
            let entry = counts.entry(chunk.source_type).or_default();
            entry.0 += 1;
            entry.1.insert(chunk.source_id.as_str());
        }
        SourcesInfo {
            total_chunks: self.chunks.len(),
            sources: counts
                .into_iter()
                .map(|(source_type, (chunk_count, ids))| {
                    (
                        source_type,
                        SourceSummary {
                            chunk_count,
                            source_ids: ids.into_iter().map(str::to_string).collect(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Where the index lives and whether it may be regenerated.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub dir: PathBuf,
    pub read_only: bool,
}

/// Load the persisted index if it matches `chunks`, otherwise rebuild it.
///
/// Reuse is gated on the content hash, not on file presence. An empty `chunks`
/// asks for the persisted corpus as-is. In a read-only deployment a missing or
/// stale index is fatal and no embedding provider is ever called.
pub async fn build_or_load(
    chunks: Vec<Chunk>,
    options: &IndexOptions,
    pipeline: &EmbeddingPipeline,
) -> Result<CorpusIndex, GroundrankError> {
    let expected_hash = if chunks.is_empty() {
        None
    } else {
        Some(persist::content_hash(&chunks))
    };

    let reason = match try_load(options, expected_hash.as_deref()).await {
        Ok(index) => {
            tracing::info!(
                dir = %options.dir.display(),
                chunk_count = index.len(),
                content_hash = %index.content_hash(),
                "Loaded persisted corpus index"
            );
            return Ok(index);
        }
        Err(GroundrankError::IndexUnavailable(reason)) => reason,
        Err(other) => other.to_string(),
    };

    if options.read_only {
        tracing::error!(dir = %options.dir.display(), reason = %reason, "Corpus index unavailable in read-only mode");
        return Err(GroundrankError::IndexUnavailable(format!(
            "{} (read-only deployment, regeneration disabled)",
            reason
        )));
    }
    if chunks.is_empty() {
        return Err(GroundrankError::IndexUnavailable(format!(
            "{} and no chunks were supplied to rebuild from",
            reason
        )));
    }

    tracing::info!(
        dir = %options.dir.display(),
        reason = %reason,
        chunk_count = chunks.len(),
        strategies = ?pipeline.strategy_names(),
        "Rebuilding corpus index"
    );

    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = pipeline.embed_all(&texts).await?;

    let index = task::spawn_blocking(move || CorpusIndex::from_parts(chunks, embeddings))
        .await
        .map_err(|e| GroundrankError::Internal(e.to_string()))??;

    let metadata = IndexMetadata {
        content_hash: index.content_hash().to_string(),
        chunks: index.chunks().iter().map(|c| c.as_ref().clone()).collect(),
    };
    persist::save(&options.dir, &metadata, index.embeddings()).await?;

    tracing::info!(
        dir = %options.dir.display(),
        chunk_count = index.len(),
        dimension = index.dimension(),
        content_hash = %index.content_hash(),
        "Corpus index built and persisted"
    );
    Ok(index)
}

/// Load and gate the persisted index. The error explains why it cannot be reused.
async fn try_load(
    options: &IndexOptions,
    expected_hash: Option<&str>,
) -> Result<CorpusIndex, GroundrankError> {
    let persisted = persist::load(&options.dir).await?;
    let IndexMetadata { content_hash, chunks } = persisted.metadata;

    if persisted.embeddings.len() != chunks.len() {
        return Err(GroundrankError::IndexUnavailable(format!(
            "persisted index holds {} embeddings for {} chunks",
            persisted.embeddings.len(),
            chunks.len()
        )));
    }

    let recomputed = persist::content_hash(&chunks);
    if recomputed != content_hash {
        return Err(GroundrankError::IndexUnavailable(
            "persisted content hash does not match its chunks".to_string(),
        ));
    }
    if let Some(expected) = expected_hash {
        if expected != content_hash {
            return Err(GroundrankError::IndexUnavailable(
                "corpus content changed since the index was built".to_string(),
            ));
        }
    }

    let embeddings = persisted.embeddings;
    task::spawn_blocking(move || CorpusIndex::from_parts(chunks, embeddings))
        .await
        .map_err(|e| GroundrankError::Internal(e.to_string()))?
}
