/// Domain-specific error types for groundrank
///
/// Every failure that leaves the crate carries a stable `kind()` so callers can
/// map it to an explicit error response. None of these are ever converted into
/// an empty-but-successful result.

#[derive(Debug, thiserror::Error)]
pub enum GroundrankError {
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("Reranker unavailable: {0}")]
    RerankerUnavailable(String),

    #[error("Ingestion of '{unit}' timed out after {seconds}s")]
    IngestionTimeout {
        unit: String,
        seconds: u64,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for GroundrankError {
    fn from(e: sqlx::Error) -> Self {
        GroundrankError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for GroundrankError {
    fn from(e: std::io::Error) -> Self {
        GroundrankError::Storage(e.to_string())
    }
}

impl From<crate::embedding::EmbeddingError> for GroundrankError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        GroundrankError::EmbeddingProvider(e.to_string())
    }
}

impl From<crate::rerank::RerankError> for GroundrankError {
    fn from(e: crate::rerank::RerankError) -> Self {
        GroundrankError::RerankerUnavailable(e.to_string())
    }
}

impl GroundrankError {
    /// Helper to create validation errors with field names
    ///
    /// Example:
    /// ```
    /// use groundrank::errors::GroundrankError;
    /// let err = GroundrankError::validation("session_id", "Session id cannot be empty");
    /// assert_eq!(err.kind(), "validation");
    /// ```
    pub fn validation(field: &str, message: &str) -> Self {
        GroundrankError::Validation {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }

    /// Stable machine-readable error kind for the API layer.
    pub fn kind(&self) -> &'static str {
        match self {
            GroundrankError::IndexUnavailable(_) => "index_unavailable",
            GroundrankError::EmbeddingProvider(_) => "embedding_provider",
            GroundrankError::RerankerUnavailable(_) => "reranker_unavailable",
            GroundrankError::IngestionTimeout { .. } => "ingestion_timeout",
            GroundrankError::Validation { .. } => "validation",
            GroundrankError::NotInitialized(_) => "not_initialized",
            GroundrankError::Config(_) => "config",
            GroundrankError::Storage(_) => "storage",
            GroundrankError::Internal(_) => "internal",
        }
    }
}
