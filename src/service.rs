/// Retrieval service: owns every component and wires them from `Config`.
///
/// Lifecycle is explicit. `init` loads (or builds) the corpus index and opens
/// the feedback backend; `shutdown` releases them. Any retrieval after
/// shutdown fails with `NotInitialized`.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{Config, EmbeddingConfig, RerankerConfig};
use crate::embedding::local::LocalEmbeddingProvider;
use crate::embedding::openai::OpenAIEmbeddingProvider;
use crate::embedding::{EmbeddingPipeline, EmbeddingProvider, RetryPolicy};
use crate::errors::GroundrankError;
use crate::feedback::store::open_store;
use crate::feedback::{
    apply_feedback_to_request, filter_recommendations, FeedbackManager, RecommendationSet,
};
use crate::index::{build_or_load, IndexOptions, SourcesInfo};
use crate::rerank::http::HttpReranker;
use crate::rerank::local::FastembedReranker;
use crate::rerank::{RelevanceModel, RerankOptions, Reranker};
use crate::search::{BoostManifest, FusionWeights, HybridRetriever};
use crate::types::{Chunk, RetrievalResult};

/// Create one embedding provider by name.
pub async fn create_embedding_provider(
    name: &str,
    config: &EmbeddingConfig,
) -> Result<Arc<dyn EmbeddingProvider>, GroundrankError> {
    match name {
        "openai" => {
            let api_key = config.openai_api_key.clone().ok_or_else(|| {
                GroundrankError::Config(
                    "OpenAI API key required when provider is 'openai'. \
                     Set GROUNDRANK_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in groundrank.toml"
                        .to_string(),
                )
            })?;
            Ok(Arc::new(OpenAIEmbeddingProvider::new(
                api_key,
                config.openai_base_url.clone(),
                config.openai_model.clone(),
            )?))
        }
        "local" => Ok(Arc::new(LocalEmbeddingProvider::new(&config.cache_dir).await?)),
        other => Err(GroundrankError::Config(format!(
            "Unknown embedding provider '{}': expected local or openai",
            other
        ))),
    }
}

/// Build the strategy pipeline: the primary provider, then the fallback if it differs.
///
/// A strategy that cannot be constructed is skipped with a warning; at least one must remain.
pub async fn build_embedding_pipeline(config: &EmbeddingConfig) -> Result<EmbeddingPipeline, GroundrankError> {
    let mut names = vec![config.provider.as_str()];
    if let Some(fallback) = config.fallback_provider.as_deref() {
        if fallback != config.provider {
            names.push(fallback);
        }
    }

    let mut strategies = Vec::new();
    let mut failures = Vec::new();
    for name in names {
        match create_embedding_provider(name, config).await {
            Ok(provider) => {
                tracing::info!(
                    provider = name,
                    model = provider.model_name(),
                    dimension = provider.dimension(),
                    "Embedding strategy ready"
                );
                strategies.push(provider);
            }
            Err(e) => {
                tracing::warn!(provider = name, error = %e, "Embedding strategy unavailable");
                failures.push(format!("{}: {}", name, e));
            }
        }
    }

    if strategies.is_empty() {
        return Err(GroundrankError::EmbeddingProvider(format!(
            "no embedding strategy could be initialized ({})",
            failures.join("; ")
        )));
    }

    Ok(EmbeddingPipeline::new(matching_dimension(strategies))
        .with_batch_size(config.batch_size)
        .with_pacing(Duration::from_millis(config.pacing_ms))
        .with_retry(RetryPolicy {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
        }))
}

/// Keep the strategies whose vectors share the first strategy's dimension.
///
/// The index locks its dimension on the first batch, so a fallback producing
/// another size could never serve a later batch or a query.
fn matching_dimension(strategies: Vec<Arc<dyn EmbeddingProvider>>) -> Vec<Arc<dyn EmbeddingProvider>> {
    let Some(dimension) = strategies.first().map(|s| s.dimension()) else {
        return strategies;
    };
    strategies
        .into_iter()
        .filter(|strategy| {
            let matches = strategy.dimension() == dimension;
            if !matches {
                tracing::warn!(
                    model = strategy.model_name(),
                    dimension = strategy.dimension(),
                    expected = dimension,
                    "Embedding fallback disabled: dimension differs from the primary provider"
                );
            }
            matches
        })
        .collect()
}

/// Create the relevance model named by `[reranker] provider`.
///
/// `none` disables reranking. A model that fails to initialize is logged and
/// left out, so rerank calls fail fast instead of startup failing.
pub async fn create_relevance_model(config: &RerankerConfig) -> Result<Option<Arc<dyn RelevanceModel>>, GroundrankError> {
    let model: Result<Arc<dyn RelevanceModel>, GroundrankError> = match config.provider.as_str() {
        "none" => return Ok(None),
        "local" => FastembedReranker::new(&config.cache_dir, &config.model)
            .await
            .map(|m| Arc::new(m) as Arc<dyn RelevanceModel>)
            .map_err(Into::into),
        "http" => {
            let base_url = config.http_base_url.as_deref().ok_or_else(|| {
                GroundrankError::Config(
                    "reranker.http_base_url is required when reranker provider is 'http'".to_string(),
                )
            })?;
            HttpReranker::new(base_url, config.http_api_key.clone(), config.model.clone())
                .map(|m| Arc::new(m) as Arc<dyn RelevanceModel>)
                .map_err(Into::into)
        }
        other => {
            return Err(GroundrankError::Config(format!(
                "Unknown reranker provider '{}': expected local, http or none",
                other
            )))
        }
    };

    match model {
        Ok(model) => {
            tracing::info!(provider = %config.provider, model = model.model_name(), "Reranker ready");
            Ok(Some(model))
        }
        Err(e) => {
            tracing::error!(provider = %config.provider, error = %e, "Reranker failed to initialize");
            Ok(None)
        }
    }
}

/// One retrieval call: several phrasings of the same need, optionally tied to a session.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub queries: Vec<String>,
    /// Candidates per query (defaults to `retrieval.top_k`)
    pub top_k: Option<usize>,
    /// Results after reranking (defaults to `reranker.top_n`)
    pub top_n: Option<usize>,
    pub session_id: Option<String>,
    /// Replaces the configured boosts for this call
    pub boosts: Option<BoostManifest>,
    pub rerank: bool,
}

impl RetrievalRequest {
    pub fn new(queries: Vec<String>) -> Self {
        RetrievalRequest {
            queries,
            top_k: None,
            top_n: None,
            session_id: None,
            boosts: None,
            rerank: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalResponse {
    pub results: Vec<RetrievalResult>,
    pub reranked: bool,
    /// Set when reranking left no result from the prioritized source
    pub missing_priority_source: bool,
    /// Set when the relevance model failed and retrieval order was kept
    pub degraded: bool,
}

pub struct RetrievalService {
    config: Config,
    retriever: RwLock<Option<HybridRetriever>>,
    reranker: Reranker,
    feedback: Arc<FeedbackManager>,
}

impl RetrievalService {
    /// Wire every component from `config`. `chunks` may be empty to serve the
    /// persisted index as-is.
    pub async fn init(config: Config, chunks: Vec<Chunk>) -> Result<Self, GroundrankError> {
        config.validate()?;
        let pipeline = build_embedding_pipeline(&config.embedding).await?;
        let model = create_relevance_model(&config.reranker).await?;
        let feedback = Arc::new(FeedbackManager::new(open_store(&config.feedback).await?));
        Self::from_components(config, chunks, pipeline, model, feedback).await
    }

    /// Assemble a service from already-constructed components.
    pub async fn from_components(
        config: Config,
        chunks: Vec<Chunk>,
        pipeline: EmbeddingPipeline,
        model: Option<Arc<dyn RelevanceModel>>,
        feedback: Arc<FeedbackManager>,
    ) -> Result<Self, GroundrankError> {
        let options = IndexOptions {
            dir: PathBuf::from(&config.index.dir),
            read_only: config.index.read_only,
        };
        let index = build_or_load(chunks, &options, &pipeline).await?;

        let weights = FusionWeights {
            lexical: config.retrieval.lexical_weight,
            dense: config.retrieval.dense_weight,
        };
        let retriever = HybridRetriever::new(Arc::new(index), Arc::new(pipeline), weights);
        let reranker = Reranker::new(
            model,
            RerankOptions {
                max_length: config.reranker.max_length,
                diversity_threshold: config.reranker.diversity_threshold,
                prioritized_source: config.reranker.prioritized_source,
            },
        );

        tracing::info!(
            chunk_count = retriever.index().len(),
            reranker = reranker.is_available(),
            feedback_backend = feedback.backend_name(),
            "Retrieval service initialized"
        );
        Ok(RetrievalService {
            config,
            retriever: RwLock::new(Some(retriever)),
            reranker,
            feedback,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn feedback(&self) -> &Arc<FeedbackManager> {
        &self.feedback
    }

    pub fn reranker(&self) -> &Reranker {
        &self.reranker
    }

    fn retriever(&self) -> Result<HybridRetriever, GroundrankError> {
        self.retriever
            .read()
            .map_err(|_| GroundrankError::Internal("retriever lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| GroundrankError::NotInitialized("retrieval service is shut down".to_string()))
    }

    /// Feedback-adapted hybrid search over every query, then optional reranking
    /// against the first query.
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<RetrievalResponse, GroundrankError> {
        let retriever = self.retriever()?;

        let queries: Vec<String> = request
            .queries
            .iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        let Some(main_query) = queries.first().cloned() else {
            return Err(GroundrankError::validation("queries", "at least one non-empty query is required"));
        };

        let mut manifest = request
            .boosts
            .unwrap_or_else(|| BoostManifest::from_config(&self.config.retrieval));
        if let Some(session_id) = request.session_id.as_deref() {
            let state = self.feedback.get_feedback_state(session_id).await?;
            if !state.is_neutral() {
                manifest = apply_feedback_to_request(&state, &manifest);
                tracing::debug!(session_id = %session_id, "Applied session feedback to boosts");
            }
        }

        let top_k = request.top_k.unwrap_or(self.config.retrieval.top_k);
        let top_n = request.top_n.unwrap_or(self.config.reranker.top_n);
        let candidates = retriever.search_many(&queries, top_k, Some(&manifest)).await?;

        let response = if request.rerank {
            let outcome = self.reranker.rerank(&main_query, candidates, top_n, None).await?;
            RetrievalResponse {
                results: outcome.results,
                reranked: !outcome.degraded,
                missing_priority_source: outcome.missing_priority_source,
                degraded: outcome.degraded,
            }
        } else {
            let mut results = candidates;
            results.truncate(top_n);
            RetrievalResponse {
                results,
                reranked: false,
                missing_priority_source: false,
                degraded: false,
            }
        };

        tracing::info!(
            queries = queries.len(),
            returned = response.results.len(),
            reranked = response.reranked,
            session_id = request.session_id.as_deref().unwrap_or(""),
            "Retrieval complete"
        );
        Ok(response)
    }

    /// Apply a session's blocks and corrections to a generated recommendation set.
    pub async fn filter_recommendations(
        &self,
        session_id: &str,
        set: &RecommendationSet,
    ) -> Result<RecommendationSet, GroundrankError> {
        let state = self.feedback.get_feedback_state(session_id).await?;
        Ok(filter_recommendations(&state, set))
    }

    pub fn sources_info(&self) -> Result<SourcesInfo, GroundrankError> {
        Ok(self.retriever()?.index().sources_info())
    }

    /// Release the index and close the feedback backend.
    pub async fn shutdown(&self) -> Result<(), GroundrankError> {
        let released = self
            .retriever
            .write()
            .map_err(|_| GroundrankError::Internal("retriever lock poisoned".to_string()))?
            .take();
        if released.is_some() {
            self.feedback.close().await;
            tracing::info!("Retrieval service shut down");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_embedding_provider_is_config_error() {
        let err = create_embedding_provider("word2vec", &EmbeddingConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "config");
    }

    #[tokio::test]
    async fn test_openai_provider_requires_key() {
        let config = EmbeddingConfig {
            openai_api_key: None,
            ..EmbeddingConfig::default()
        };
        let err = create_embedding_provider("openai", &config).await.err().unwrap();
        assert!(err.to_string().contains("GROUNDRANK_EMBEDDING__OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn test_pipeline_fails_when_no_strategy_initializes() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            fallback_provider: None,
            openai_api_key: None,
            ..EmbeddingConfig::default()
        };
        let err = build_embedding_pipeline(&config).await.err().unwrap();
        assert_eq!(err.kind(), "embedding_provider");
    }

    struct FixedDimension(&'static str, usize);

    #[async_trait::async_trait]
    impl EmbeddingProvider for FixedDimension {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::embedding::EmbeddingError> {
            Ok(vec![0.0; self.1])
        }

        fn model_name(&self) -> &str {
            self.0
        }

        fn dimension(&self) -> usize {
            self.1
        }
    }

    #[test]
    fn test_fallback_with_other_dimension_is_dropped() {
        let strategies: Vec<Arc<dyn EmbeddingProvider>> = vec![
            Arc::new(FixedDimension("text-embedding-3-small", 1536)),
            Arc::new(FixedDimension("all-minilm-l6-v2", 384)),
            Arc::new(FixedDimension("text-embedding-ada-002", 1536)),
        ];
        let kept: Vec<String> = matching_dimension(strategies)
            .iter()
            .map(|s| s.model_name().to_string())
            .collect();
        assert_eq!(kept, vec!["text-embedding-3-small", "text-embedding-ada-002"]);
        assert!(matching_dimension(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_reranker_provider_selection() {
        let none = RerankerConfig {
            provider: "none".to_string(),
            ..RerankerConfig::default()
        };
        assert!(create_relevance_model(&none).await.unwrap().is_none());

        let http_without_url = RerankerConfig {
            provider: "http".to_string(),
            http_base_url: None,
            ..RerankerConfig::default()
        };
        assert_eq!(create_relevance_model(&http_without_url).await.err().unwrap().kind(), "config");

        let http = RerankerConfig {
            provider: "http".to_string(),
            http_base_url: Some("http://localhost:9/v1".to_string()),
            ..RerankerConfig::default()
        };
        assert!(create_relevance_model(&http).await.unwrap().is_some());

        let unknown = RerankerConfig {
            provider: "colbert".to_string(),
            ..RerankerConfig::default()
        };
        assert_eq!(create_relevance_model(&unknown).await.err().unwrap().kind(), "config");
    }
}
