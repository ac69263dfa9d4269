/// Shared value types for the retrieval core.
///
/// Leaf module: the index, retriever, reranker and feedback layers all import
/// from here and nothing here imports from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Maximum number of section headers carried by a chunk.
pub const MAX_HEADERS: usize = 5;

/// Which corpus a chunk came from.
///
/// Legacy corpus names are accepted on input so existing ingestion output and
/// persisted metadata keep loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[serde(alias = "note_ninjas")]
    Primary,
    #[serde(alias = "cpg")]
    Secondary,
    #[serde(alias = "textbook")]
    Tertiary,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Primary => write!(f, "primary"),
            SourceType::Secondary => write!(f, "secondary"),
            SourceType::Tertiary => write!(f, "tertiary"),
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" | "note_ninjas" => Ok(SourceType::Primary),
            "secondary" | "cpg" => Ok(SourceType::Secondary),
            "tertiary" | "textbook" => Ok(SourceType::Tertiary),
            other => Err(format!("Unknown source type: {}", other)),
        }
    }
}

/// An immutable unit of retrievable text produced by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable, content-derived id, unique within the corpus
    pub chunk_id: String,
    pub source_type: SourceType,
    /// Originating document identifier
    pub source_id: String,
    pub title: String,
    /// Ordered section headers (at most `MAX_HEADERS`)
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub page_ref: Option<String>,
    pub content: String,
    /// Provenance of the original file, if known
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Chunk {
    /// Create a chunk whose id is derived from its source and content.
    pub fn new(
        source_type: SourceType,
        source_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let source_id = source_id.into();
        let content = content.into();
        Chunk {
            chunk_id: Chunk::derive_id(&source_id, &content),
            source_type,
            source_id,
            title: title.into(),
            headers: Vec::new(),
            page_ref: None,
            content,
            file_path: None,
        }
    }

    /// `{source_id}_{first 8 hex chars of sha256(content)}`
    pub fn derive_id(source_id: &str, content: &str) -> String {
        let digest = Sha256::digest(content.as_bytes());
        let hex = format!("{:x}", digest);
        format!("{}_{}", source_id, &hex[..8])
    }

    pub fn with_id(mut self, chunk_id: impl Into<String>) -> Self {
        self.chunk_id = chunk_id.into();
        self
    }

    /// Set headers, keeping only the first `MAX_HEADERS`.
    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.headers = headers.into_iter().take(MAX_HEADERS).map(Into::into).collect();
        self
    }

    pub fn with_page_ref(mut self, page_ref: impl Into<String>) -> Self {
        self.page_ref = Some(page_ref.into());
        self
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    /// Clamp headers to `MAX_HEADERS` (used on records read from disk).
    pub fn clamp_headers(&mut self) {
        self.headers.truncate(MAX_HEADERS);
    }
}

/// A scored passage produced by one search call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk: Arc<Chunk>,
    /// Normalized BM25 score in [0, 1]
    pub lexical_score: f64,
    /// Normalized inner-product score in [0, 1]
    pub dense_score: f64,
    /// Weighted fusion of lexical and dense, after boosts
    pub combined_score: f64,
    /// Cross-encoder relevance, filled in by the reranker
    pub rerank_score: Option<f64>,
    /// The query that produced this hit
    pub query: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_id_is_content_stable() {
        let a = Chunk::new(SourceType::Primary, "doc-1", "Title", "squats and lunges");
        let b = Chunk::new(SourceType::Secondary, "doc-1", "Other", "squats and lunges");
        let c = Chunk::new(SourceType::Primary, "doc-1", "Title", "heel raises");
        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
        assert!(a.chunk_id.starts_with("doc-1_"));
        assert_eq!(a.chunk_id.len(), "doc-1_".len() + 8);
    }

    #[test]
    fn test_headers_are_capped() {
        let chunk = Chunk::new(SourceType::Primary, "d", "t", "c")
            .with_headers(["h1", "h2", "h3", "h4", "h5", "h6", "h7"]);
        assert_eq!(chunk.headers.len(), MAX_HEADERS);
        assert_eq!(chunk.headers[4], "h5");
    }

    #[test]
    fn test_source_type_accepts_legacy_names() {
        let parsed: SourceType = serde_json::from_str("\"cpg\"").unwrap();
        assert_eq!(parsed, SourceType::Secondary);
        assert_eq!("note_ninjas".parse::<SourceType>().unwrap(), SourceType::Primary);
        assert_eq!(serde_json::to_string(&SourceType::Tertiary).unwrap(), "\"tertiary\"");
        assert!("journal".parse::<SourceType>().is_err());
    }
}
