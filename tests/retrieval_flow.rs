use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use groundrank::config::Config;
use groundrank::embedding::{EmbeddingError, EmbeddingPipeline, EmbeddingProvider};
use groundrank::feedback::store::MemoryFeedbackStore;
use groundrank::feedback::filter::FILTERED_NOTE;
use groundrank::feedback::{BlockTarget, Feedback, FeedbackManager, RecommendationSet};
use groundrank::index::persist::{decode_metadata, encode_embeddings, EMBEDDINGS_FILE, METADATA_FILE};
use groundrank::index::{build_or_load, IndexOptions};
use groundrank::rerank::{RelevanceModel, RerankError};
use groundrank::service::{RetrievalRequest, RetrievalService};
use groundrank::types::{Chunk, RetrievalResult, SourceType};

const KEYWORDS: [&str; 4] = ["knee", "shoulder", "balance", "gait"];

/// Deterministic embedder: one dimension per keyword, counting every call.
#[derive(Default)]
struct CountingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = text.to_lowercase();
        Ok(KEYWORDS.iter().map(|k| lower.matches(k).count() as f32).collect())
    }

    fn model_name(&self) -> &str {
        "counting"
    }

    fn dimension(&self) -> usize {
        KEYWORDS.len()
    }
}

/// Scores a passage by how many query words it contains.
struct OverlapModel;

#[async_trait]
impl RelevanceModel for OverlapModel {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RerankError> {
        let words: Vec<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();
        Ok(passages
            .iter()
            .map(|p| {
                let lower = p.to_lowercase();
                words.iter().filter(|w| lower.contains(w.as_str())).count() as f64
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        "overlap"
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        Chunk::new(SourceType::Primary, "notes", "Knee rehab", "knee pain with squats; progress knee strength")
            .with_headers(["Exercise", "CPT 97110"]),
        Chunk::new(SourceType::Secondary, "cpg", "Shoulder", "shoulder impingement and rotator cuff loading"),
        Chunk::new(SourceType::Tertiary, "textbook", "Balance", "balance training protects the knee during gait")
            .with_page_ref("p. 212"),
        Chunk::new(SourceType::Secondary, "cpg", "Gait", "gait speed and cadence drills"),
    ]
}

fn pipeline(embedder: &Arc<CountingEmbedder>) -> EmbeddingPipeline {
    EmbeddingPipeline::new(vec![embedder.clone() as Arc<dyn EmbeddingProvider>])
        .with_batch_size(2)
        .with_pacing(Duration::ZERO)
}

fn options(dir: &tempfile::TempDir, read_only: bool) -> IndexOptions {
    IndexOptions {
        dir: dir.path().join("vector_store"),
        read_only,
    }
}

fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.index.dir = dir.path().join("vector_store").display().to_string();
    config.index.read_only = false;
    config.reranker.top_n = 3;
    config
}

async fn service(
    dir: &tempfile::TempDir,
    embedder: &Arc<CountingEmbedder>,
    model: Option<Arc<dyn RelevanceModel>>,
) -> RetrievalService {
    let feedback = Arc::new(FeedbackManager::new(Arc::new(MemoryFeedbackStore::new())));
    RetrievalService::from_components(test_config(dir), corpus(), pipeline(embedder), model, feedback)
        .await
        .expect("service should initialize")
}

#[tokio::test]
async fn test_read_only_without_persisted_index_never_embeds() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());

    let err = build_or_load(corpus(), &options(&dir, true), &pipeline(&embedder))
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), "index_unavailable");
    assert!(err.to_string().contains("read-only"));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_build_then_reload_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());

    let built = build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(built.len(), 4);
    assert_eq!(built.dimension(), KEYWORDS.len());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    assert!(dir.path().join("vector_store").join(EMBEDDINGS_FILE).exists());
    assert!(dir.path().join("vector_store").join(METADATA_FILE).exists());

    // Same chunks in another order: same hash, served from disk even when read-only.
    let mut shuffled = corpus();
    shuffled.reverse();
    let reloaded = build_or_load(shuffled, &options(&dir, true), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(reloaded.content_hash(), built.content_hash());
    assert_eq!(reloaded.embeddings(), built.embeddings());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);

    // No chunks asks for the persisted corpus as-is.
    let as_is = build_or_load(Vec::new(), &options(&dir, true), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(as_is.content_hash(), built.content_hash());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_changed_corpus_is_rebuilt_only_when_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let original = build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();

    let mut changed = corpus();
    changed.push(Chunk::new(SourceType::Primary, "notes", "Gait", "gait belt transfers"));

    let err = build_or_load(changed.clone(), &options(&dir, true), &pipeline(&embedder))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "index_unavailable");
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);

    let rebuilt = build_or_load(changed, &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(rebuilt.len(), 5);
    assert_ne!(rebuilt.content_hash(), original.content_hash());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn test_corrupt_persisted_index_is_unavailable_or_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("vector_store");
    let embedder = Arc::new(CountingEmbedder::default());
    let calls = || embedder.calls.load(Ordering::SeqCst);
    build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(calls(), 4);

    // One embedding row for four chunks
    std::fs::write(store.join(EMBEDDINGS_FILE), encode_embeddings(&[vec![1.0; 4]]).unwrap()).unwrap();
    let err = build_or_load(corpus(), &options(&dir, true), &pipeline(&embedder))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "index_unavailable");
    assert!(err.to_string().contains("1 embeddings for 4 chunks"));
    assert_eq!(calls(), 4);
    let rebuilt = build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(rebuilt.len(), 4);
    assert_eq!(calls(), 8);

    // Older layout: a bare array of chunks without a content hash
    std::fs::write(store.join(METADATA_FILE), serde_json::to_vec(&corpus()).unwrap()).unwrap();
    let err = build_or_load(corpus(), &options(&dir, true), &pipeline(&embedder))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "index_unavailable");
    assert_eq!(calls(), 8);
    build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(calls(), 12);

    // Stored hash that no longer matches the stored chunks
    let mut metadata = decode_metadata(&std::fs::read(store.join(METADATA_FILE)).unwrap()).unwrap();
    metadata.content_hash = "0".repeat(64);
    std::fs::write(store.join(METADATA_FILE), serde_json::to_vec(&metadata).unwrap()).unwrap();
    let err = build_or_load(Vec::new(), &options(&dir, true), &pipeline(&embedder))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), "index_unavailable");
    assert!(err.to_string().contains("does not match its chunks"));
    assert_eq!(calls(), 12);
    let restored = build_or_load(corpus(), &options(&dir, false), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(calls(), 16);

    let reloaded = build_or_load(Vec::new(), &options(&dir, true), &pipeline(&embedder))
        .await
        .unwrap();
    assert_eq!(reloaded.content_hash(), restored.content_hash());
    assert_eq!(calls(), 16);
}

#[tokio::test]
async fn test_retrieve_reranks_and_reports_sources() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let service = service(&dir, &embedder, Some(Arc::new(OverlapModel))).await;

    let info = service.sources_info().unwrap();
    assert_eq!(info.total_chunks, 4);
    assert_eq!(info.sources[&SourceType::Secondary].chunk_count, 2);

    let response = service
        .retrieve(RetrievalRequest::new(vec![
            "knee pain squats".to_string(),
            "knee strength".to_string(),
        ]))
        .await
        .unwrap();

    assert!(response.reranked);
    assert!(!response.degraded);
    assert!(response.results.len() <= 3);
    assert_eq!(response.results[0].chunk.title, "Knee rehab");
    assert!(response.results.iter().all(|r| r.rerank_score.is_some()));
    let ids: std::collections::HashSet<_> = response.results.iter().map(|r| r.chunk.chunk_id.clone()).collect();
    assert_eq!(ids.len(), response.results.len());
}

#[tokio::test]
async fn test_session_feedback_biases_retrieval_and_filters_recommendations() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let service = service(&dir, &embedder, None).await;

    let request = |session: Option<&str>| RetrievalRequest {
        session_id: session.map(str::to_string),
        rerank: false,
        top_n: Some(10),
        ..RetrievalRequest::new(vec!["knee balance".to_string()])
    };
    let score_of = |results: &[RetrievalResult], title: &str| {
        results
            .iter()
            .find(|r| r.chunk.title == title)
            .map(|r| r.combined_score)
            .unwrap()
    };

    // A fresh session changes nothing.
    let baseline = service.retrieve(request(None)).await.unwrap().results;
    let fresh = service.retrieve(request(Some("s1"))).await.unwrap().results;
    assert_eq!(score_of(&baseline, "Balance"), score_of(&fresh, "Balance"));

    let feedback = service.feedback();
    feedback
        .store_feedback(
            "s1",
            None,
            Feedback::from_parts("block", json!({"blocked_content": {"source": "textbook"}})).unwrap(),
            None,
        )
        .await
        .unwrap();
    feedback
        .store_feedback(
            "s1",
            Some("rec-1".to_string()),
            Feedback::Block { blocked_content: BlockTarget::Code("97530".into()) },
            Some("not billable here".to_string()),
        )
        .await
        .unwrap();
    feedback
        .store_feedback(
            "s1",
            None,
            Feedback::from_parts("correction", json!({"old_cpt": "97110", "corrected_cpt": "97112"})).unwrap(),
            None,
        )
        .await
        .unwrap();

    // Tertiary boost goes from the configured 0.6 to the preferred 1.2.
    let adapted = service.retrieve(request(Some("s1"))).await.unwrap().results;
    let ratio = score_of(&adapted, "Balance") / score_of(&baseline, "Balance");
    assert!((ratio - 2.0).abs() < 1e-9, "ratio was {}", ratio);

    let set: RecommendationSet = serde_json::from_value(json!({
        "subsections": [{
            "title": "Strength",
            "exercises": [
                {"title": "Squats", "cpt": "97110"},
                {"title": "Step-ups", "cpt": "97530"}
            ]
        }]
    }))
    .unwrap();
    let filtered = service.filter_recommendations("s1", &set).await.unwrap();
    let exercises = serde_json::to_value(&filtered).unwrap()["subsections"][0]["exercises"].clone();
    assert_eq!(
        exercises,
        json!([{
            "title": "Squats",
            "cpt": "97112",
            "notes": format!("{} (Code corrected from 97110)", FILTERED_NOTE)
        }])
    );

    feedback.clear_feedback("s1").await.unwrap();
    let cleared = service.retrieve(request(Some("s1"))).await.unwrap().results;
    assert_eq!(score_of(&cleared, "Balance"), score_of(&baseline, "Balance"));
}

#[tokio::test]
async fn test_rerank_without_model_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let service = service(&dir, &embedder, None).await;

    let err = service
        .retrieve(RetrievalRequest::new(vec!["knee".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "reranker_unavailable");

    let err = service
        .retrieve(RetrievalRequest::new(vec!["   ".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn test_shutdown_makes_service_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(CountingEmbedder::default());
    let service = service(&dir, &embedder, Some(Arc::new(OverlapModel))).await;

    service.shutdown().await.unwrap();
    service.shutdown().await.unwrap();

    let err = service
        .retrieve(RetrievalRequest::new(vec!["knee".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_initialized");
    assert_eq!(service.sources_info().unwrap_err().kind(), "not_initialized");
}
