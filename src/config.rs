/// Configuration management using figment
///
/// Loads configuration with this precedence (highest wins):
/// 1. Defaults (hardcoded)
/// 2. TOML file: groundrank.toml (in working directory)
/// 3. Environment variables: prefixed GROUNDRANK_, nested keys split on `__`
///    (e.g., GROUNDRANK_EMBEDDING__OPENAI_API_KEY=sk-...)

use figment::{
    Figment,
    providers::{Env, Format, Toml, Serialized},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::GroundrankError;
use crate::types::SourceType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional file path for log output (in addition to stderr)
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub reranker: RerankerConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,
}

/// Where the persisted corpus index lives and whether it may be regenerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_dir")]
    pub dir: String,

    /// When true, a missing or stale index is fatal instead of being rebuilt.
    #[serde(default = "default_read_only")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Primary provider: "local" (fastembed) or "openai"
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Provider tried per batch when the primary fails. None disables fallback.
    #[serde(default = "default_embedding_fallback")]
    pub fallback_provider: Option<String>,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_openai_embedding_model")]
    pub openai_model: String,

    /// Model weight cache for the local provider
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between batches to respect provider rate limits
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Retries per strategy for retryable errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    /// First backoff delay; doubles on every retry
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Candidates returned per query before reranking
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_fusion_weight")]
    pub lexical_weight: f64,

    #[serde(default = "default_fusion_weight")]
    pub dense_weight: f64,

    /// Boosts applied when a request does not bring its own manifest
    #[serde(default = "default_source_boosts")]
    pub source_boosts: BTreeMap<SourceType, f64>,

    #[serde(default = "default_header_boosts")]
    pub header_boosts: BTreeMap<String, f64>,

    #[serde(default)]
    pub topic_boosts: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// "local" (fastembed cross-encoder), "http" (remote /rerank endpoint) or "none"
    #[serde(default = "default_reranker_provider")]
    pub provider: String,

    #[serde(default = "default_reranker_model")]
    pub model: String,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    #[serde(default)]
    pub http_base_url: Option<String>,

    #[serde(default)]
    pub http_api_key: Option<String>,

    /// Pairwise model input budget in characters (query + passage)
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Jaccard overlap above which a lower-ranked result is dropped; 1.0 disables
    #[serde(default = "default_diversity_threshold")]
    pub diversity_threshold: f64,

    /// Source type whose absence from the final set triggers a warning
    #[serde(default = "default_prioritized_source")]
    pub prioritized_source: SourceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// "memory", "file" or "sqlite"
    #[serde(default = "default_feedback_backend")]
    pub backend: String,

    #[serde(default = "default_feedback_dir")]
    pub file_dir: String,

    /// SQLite database path. Supports sqlite:// URI scheme.
    #[serde(default = "default_feedback_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Directory of chunk records (*.json / *.jsonl) written by the ingestion collaborator
    #[serde(default = "default_chunks_dir")]
    pub chunks_dir: String,

    /// Per-unit budget; a unit exceeding it is skipped
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_index_dir() -> String {
    "./vector_store".to_string()
}

fn default_read_only() -> bool {
    true
}

fn default_embedding_provider() -> String {
    "local".to_string()
}

fn default_embedding_fallback() -> Option<String> {
    Some("local".to_string())
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_cache_dir() -> String {
    dirs::cache_dir()
        .map(|d| d.join("groundrank").join("models"))
        .unwrap_or_else(|| Path::new(".groundrank").join("models"))
        .to_string_lossy()
        .into_owned()
}

fn default_batch_size() -> usize {
    100
}

fn default_pacing_ms() -> u64 {
    100
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_top_k() -> usize {
    50
}

fn default_fusion_weight() -> f64 {
    0.5
}

fn default_source_boosts() -> BTreeMap<SourceType, f64> {
    BTreeMap::from([
        (SourceType::Primary, 1.0),
        (SourceType::Secondary, 0.8),
        (SourceType::Tertiary, 0.6),
    ])
}

fn default_header_boosts() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("cpt".to_string(), 1.2),
        ("documentation".to_string(), 1.1),
        ("exercise".to_string(), 1.0),
        ("safety".to_string(), 1.3),
    ])
}

fn default_reranker_provider() -> String {
    "local".to_string()
}

fn default_reranker_model() -> String {
    "BAAI/bge-reranker-base".to_string()
}

fn default_max_length() -> usize {
    512
}

fn default_top_n() -> usize {
    12
}

fn default_diversity_threshold() -> f64 {
    0.8
}

fn default_prioritized_source() -> SourceType {
    SourceType::Primary
}

fn default_feedback_backend() -> String {
    "memory".to_string()
}

fn default_feedback_dir() -> String {
    "./feedback_storage".to_string()
}

fn default_feedback_db_path() -> String {
    "sqlite://feedback.db".to_string()
}

fn default_chunks_dir() -> String {
    "./chunks".to_string()
}

fn default_unit_timeout_secs() -> u64 {
    30
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            dir: default_index_dir(),
            read_only: default_read_only(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: default_embedding_provider(),
            fallback_provider: default_embedding_fallback(),
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            openai_model: default_openai_embedding_model(),
            cache_dir: default_cache_dir(),
            batch_size: default_batch_size(),
            pacing_ms: default_pacing_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            top_k: default_top_k(),
            lexical_weight: default_fusion_weight(),
            dense_weight: default_fusion_weight(),
            source_boosts: default_source_boosts(),
            header_boosts: default_header_boosts(),
            topic_boosts: BTreeMap::new(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        RerankerConfig {
            provider: default_reranker_provider(),
            model: default_reranker_model(),
            cache_dir: default_cache_dir(),
            http_base_url: None,
            http_api_key: None,
            max_length: default_max_length(),
            top_n: default_top_n(),
            diversity_threshold: default_diversity_threshold(),
            prioritized_source: default_prioritized_source(),
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        FeedbackConfig {
            backend: default_feedback_backend(),
            file_dir: default_feedback_dir(),
            db_path: default_feedback_db_path(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        IngestionConfig {
            chunks_dir: default_chunks_dir(),
            unit_timeout_secs: default_unit_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            log_file: None,
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            reranker: RerankerConfig::default(),
            feedback: FeedbackConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, groundrank.toml, and environment variables
    ///
    /// Environment variables override TOML file values.
    /// Example: GROUNDRANK_INDEX__READ_ONLY=false overrides index.read_only in groundrank.toml
    pub fn load() -> Result<Config, GroundrankError> {
        Config::load_from("groundrank.toml")
    }

    /// Same as `load`, reading the TOML layer from `path`.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Config, GroundrankError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GROUNDRANK_").split("__"))
            .extract()
            .map_err(|e| GroundrankError::Config(format!("Failed to load config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make retrieval ill-defined.
    pub fn validate(&self) -> Result<(), GroundrankError> {
        let r = &self.retrieval;
        for (name, w) in [("lexical_weight", r.lexical_weight), ("dense_weight", r.dense_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(GroundrankError::Config(format!(
                    "retrieval.{} must be a finite non-negative number, got {}",
                    name, w
                )));
            }
        }
        if self.embedding.batch_size == 0 {
            return Err(GroundrankError::Config("embedding.batch_size must be at least 1".into()));
        }
        let t = self.reranker.diversity_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(GroundrankError::Config(format!(
                "reranker.diversity_threshold must be within [0, 1], got {}",
                t
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_file, None);
        assert_eq!(config.index.dir, "./vector_store");
        assert!(config.index.read_only);
        assert_eq!(config.embedding.batch_size, 100);
        assert_eq!(config.retrieval.top_k, 50);
        assert_eq!(config.retrieval.lexical_weight, 0.5);
        assert_eq!(config.retrieval.dense_weight, 0.5);
        assert_eq!(config.retrieval.source_boosts[&SourceType::Secondary], 0.8);
        assert_eq!(config.retrieval.header_boosts["safety"], 1.3);
        assert_eq!(config.reranker.top_n, 12);
        assert_eq!(config.reranker.diversity_threshold, 0.8);
        assert_eq!(config.feedback.backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groundrank.toml");
        std::fs::write(
            &path,
            "[retrieval]\nlexical_weight = 0.3\ndense_weight = 0.7\n\n[index]\nread_only = false\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.retrieval.lexical_weight, 0.3);
        assert_eq!(config.retrieval.dense_weight, 0.7);
        assert!(!config.index.read_only);
        // untouched sections keep their defaults
        assert_eq!(config.reranker.top_n, 12);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.reranker.diversity_threshold = 1.5;
        assert!(matches!(config.validate(), Err(GroundrankError::Config(_))));
    }
}
