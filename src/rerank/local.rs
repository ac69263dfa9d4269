/// Local cross-encoder reranker using fastembed's `TextRerank`.
///
/// Inference is CPU-bound and needs exclusive access to the ONNX session, so the
/// model lives behind a Mutex and every call runs on the blocking pool.

use async_trait::async_trait;
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task;

use super::{RelevanceModel, RerankError};

fn reranker_model(name: &str) -> Option<RerankerModel> {
    match name {
        "BAAI/bge-reranker-base" => Some(RerankerModel::BGERerankerBase),
        "rozgo/bge-reranker-v2-m3" => Some(RerankerModel::BGERerankerV2M3),
        "jinaai/jina-reranker-v1-turbo-en" => Some(RerankerModel::JINARerankerV1TurboEn),
        _ => None,
    }
}

pub struct FastembedReranker {
    model: Arc<Mutex<TextRerank>>,
    name: String,
}

impl FastembedReranker {
    /// Load `model_name`, downloading weights into `cache_dir` on first use.
    pub async fn new(cache_dir: &str, model_name: &str) -> Result<Self, RerankError> {
        let model = reranker_model(model_name).ok_or_else(|| {
            RerankError::NotConfigured(format!("Unsupported local reranker model: {}", model_name))
        })?;
        let cache_path = PathBuf::from(cache_dir);

        let rerank = task::spawn_blocking(move || {
            std::fs::create_dir_all(&cache_path)
                .map_err(|e| RerankError::ModelInit(format!("Failed to create cache dir: {}", e)))?;
            TextRerank::try_new(
                RerankInitOptions::new(model)
                    .with_cache_dir(cache_path)
                    .with_show_download_progress(false),
            )
            .map_err(|e| RerankError::ModelInit(e.to_string()))
        })
        .await
        .map_err(|e| RerankError::ModelInit(e.to_string()))??;

        tracing::info!(model = model_name, "Local reranker loaded");
        Ok(FastembedReranker {
            model: Arc::new(Mutex::new(rerank)),
            name: model_name.to_string(),
        })
    }
}

#[async_trait]
impl RelevanceModel for FastembedReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let query = query.to_string();
        let passages = passages.to_vec();

        task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| RerankError::Inference("Reranker lock poisoned".to_string()))?;
            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            let ranked = model
                .rerank(query.as_str(), documents, false, None)
                .map_err(|e| RerankError::Inference(e.to_string()))?;

            // fastembed returns results sorted by score; put them back in passage order
            let mut scores = vec![None; passages.len()];
            for r in ranked {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = Some(r.score as f64);
                }
            }
            scores
                .into_iter()
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| RerankError::Inference("Reranker skipped some passages".to_string()))
        })
        .await
        .map_err(|e| RerankError::Inference(e.to_string()))?
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}
