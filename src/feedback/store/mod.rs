/// Feedback persistence abstraction
///
/// The `FeedbackStore` trait persists whole per-session `FeedbackState`
/// records. Backends: process memory, one JSON file per session, or SQLite.

use async_trait::async_trait;
use std::sync::Arc;

use super::FeedbackState;
use crate::config::FeedbackConfig;
use crate::errors::GroundrankError;

pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileFeedbackStore;
pub use memory::MemoryFeedbackStore;
pub use sqlite::SqliteFeedbackStore;

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    /// Load a session's state, or None when nothing was persisted.
    async fn load(&self, session_id: &str) -> Result<Option<FeedbackState>, GroundrankError>;

    /// Replace the persisted state for `state.session_id`.
    async fn save(&self, state: &FeedbackState) -> Result<(), GroundrankError>;

    /// Remove everything persisted for the session. Missing sessions are not an error.
    async fn delete(&self, session_id: &str) -> Result<(), GroundrankError>;

    fn backend_name(&self) -> &'static str;

    /// Release backend resources at shutdown.
    async fn close(&self) {}
}

/// Open the backend selected by `[feedback] backend`.
pub async fn open_store(config: &FeedbackConfig) -> Result<Arc<dyn FeedbackStore>, GroundrankError> {
    let store: Arc<dyn FeedbackStore> = match config.backend.as_str() {
        "memory" => Arc::new(MemoryFeedbackStore::new()),
        "file" => Arc::new(FileFeedbackStore::new(&config.file_dir)),
        "sqlite" => Arc::new(SqliteFeedbackStore::new(&config.db_path).await?),
        other => {
            return Err(GroundrankError::Config(format!(
                "Unknown feedback backend '{}': expected memory, file or sqlite",
                other
            )))
        }
    };
    tracing::info!(backend = store.backend_name(), "Feedback store ready");
    Ok(store)
}
