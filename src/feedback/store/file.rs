/// File-backed feedback store: one pretty-printed JSON document per session.
///
/// Session ids become file names, so they are restricted to `[A-Za-z0-9._-]`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::FeedbackStore;
use crate::errors::GroundrankError;
use crate::feedback::FeedbackState;
use crate::index::persist::write_atomic;

pub struct FileFeedbackStore {
    dir: PathBuf,
}

impl FileFeedbackStore {
    pub fn new(dir: &str) -> Self {
        FileFeedbackStore { dir: PathBuf::from(dir) }
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, GroundrankError> {
        validate_file_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

fn validate_file_session_id(session_id: &str) -> Result<(), GroundrankError> {
    let allowed = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if session_id.is_empty() || !allowed || session_id.starts_with('.') || session_id.len() > 128 {
        return Err(GroundrankError::validation(
            "session_id",
            "session ids for the file backend may only contain letters, digits, '.', '_' and '-' and cannot start with '.'",
        ));
    }
    Ok(())
}

#[async_trait]
impl FeedbackStore for FileFeedbackStore {
    async fn load(&self, session_id: &str) -> Result<Option<FeedbackState>, GroundrankError> {
        let path = self.path_for(session_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            GroundrankError::Storage(format!("Corrupt feedback file {}: {}", path.display(), e))
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &FeedbackState) -> Result<(), GroundrankError> {
        let path = self.path_for(&state.session_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| GroundrankError::Internal(format!("Failed to serialize feedback: {}", e)))?;
        write_atomic(&path, &bytes).await
    }

    async fn delete(&self, session_id: &str) -> Result<(), GroundrankError> {
        let path = self.path_for(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
