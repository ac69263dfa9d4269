/// Session-scoped feedback orchestration over a `FeedbackStore`.
///
/// Every mutation of a session runs under that session's async mutex, so
/// concurrent submissions for one session serialize while different sessions
/// proceed independently. The cached state is only replaced after the backend
/// accepted the new version.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::store::FeedbackStore;
use super::{Feedback, FeedbackEntry, FeedbackState};
use crate::errors::GroundrankError;

type SessionSlot = Arc<AsyncMutex<Option<FeedbackState>>>;

pub struct FeedbackManager {
    store: Arc<dyn FeedbackStore>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl FeedbackManager {
    pub fn new(store: Arc<dyn FeedbackStore>) -> Self {
        FeedbackManager {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    fn slot(&self, session_id: &str) -> Result<SessionSlot, GroundrankError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| GroundrankError::Internal("feedback session map poisoned".to_string()))?;
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone())
    }

    async fn load_or_new(&self, session_id: &str) -> Result<FeedbackState, GroundrankError> {
        Ok(self
            .store
            .load(session_id)
            .await?
            .unwrap_or_else(|| FeedbackState::new(session_id)))
    }

    /// Record one piece of feedback and return the stored entry.
    pub async fn store_feedback(
        &self,
        session_id: &str,
        recommendation_id: Option<String>,
        feedback: Feedback,
        comment: Option<String>,
    ) -> Result<FeedbackEntry, GroundrankError> {
        if session_id.trim().is_empty() {
            return Err(GroundrankError::validation("session_id", "session_id cannot be empty"));
        }
        feedback.validate()?;

        let entry = FeedbackEntry {
            feedback_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            recommendation_id,
            feedback,
            comment,
            timestamp: Utc::now(),
        };

        let slot = self.slot(session_id)?;
        let mut cached = slot.lock().await;

        let mut next = match cached.as_ref() {
            Some(state) => state.clone(),
            None => self.load_or_new(session_id).await?,
        };
        next.record(entry.clone());
        self.store.save(&next).await?;
        *cached = Some(next);

        tracing::info!(
            session_id = %session_id,
            feedback_id = %entry.feedback_id,
            feedback_type = %entry.feedback.feedback_type(),
            backend = self.store.backend_name(),
            "Feedback stored"
        );
        Ok(entry)
    }

    /// Current state for the session; an empty one when nothing was recorded.
    pub async fn get_feedback_state(&self, session_id: &str) -> Result<FeedbackState, GroundrankError> {
        let slot = self.slot(session_id)?;
        let mut cached = slot.lock().await;
        if let Some(state) = cached.as_ref() {
            return Ok(state.clone());
        }
        let state = self.load_or_new(session_id).await?;
        *cached = Some(state.clone());
        Ok(state)
    }

    /// Forget everything recorded for the session.
    pub async fn clear_feedback(&self, session_id: &str) -> Result<(), GroundrankError> {
        let slot = self.slot(session_id)?;
        let mut cached = slot.lock().await;
        self.store.delete(session_id).await?;
        *cached = None;
        drop(cached);
        self.release_slot(session_id, slot)?;
        tracing::info!(session_id = %session_id, "Feedback cleared");
        Ok(())
    }

    /// Drop the session's slot from the map unless another caller still holds it.
    fn release_slot(&self, session_id: &str, slot: SessionSlot) -> Result<(), GroundrankError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| GroundrankError::Internal("feedback session map poisoned".to_string()))?;
        // One reference in the map, one in `slot`
        if Arc::strong_count(&slot) == 2 {
            sessions.remove(session_id);
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::store::{FileFeedbackStore, MemoryFeedbackStore};
    use crate::feedback::BlockTarget;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn manager() -> FeedbackManager {
        FeedbackManager::new(Arc::new(MemoryFeedbackStore::new()))
    }

    /// Memory store whose saves can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryFeedbackStore,
        fail_saves: AtomicBool,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl FeedbackStore for FlakyStore {
        async fn load(&self, session_id: &str) -> Result<Option<FeedbackState>, GroundrankError> {
            self.inner.load(session_id).await
        }

        async fn save(&self, state: &FeedbackState) -> Result<(), GroundrankError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(GroundrankError::Storage("disk full".to_string()));
            }
            self.inner.save(state).await
        }

        async fn delete(&self, session_id: &str) -> Result<(), GroundrankError> {
            self.inner.delete(session_id).await
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_absent_session_materializes_empty_state() {
        let manager = manager();
        let state = manager.get_feedback_state("new").await.unwrap();
        assert_eq!(state.session_id, "new");
        assert!(state.feedback_entries.is_empty());
        assert!(state.is_neutral());
    }

    #[tokio::test]
    async fn test_store_feedback_projects_and_persists() {
        let store = Arc::new(MemoryFeedbackStore::new());
        let manager = FeedbackManager::new(store.clone());

        let entry = manager
            .store_feedback(
                "s1",
                Some("rec-1".to_string()),
                Feedback::Block { blocked_content: BlockTarget::Code("97110".into()) },
                Some("wrong code".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(entry.session_id, "s1");
        assert!(Uuid::parse_str(&entry.feedback_id).is_ok());

        let state = manager.get_feedback_state("s1").await.unwrap();
        assert!(state.blocked_codes.contains("97110"));
        assert_eq!(state.feedback_entries, vec![entry]);

        let persisted = store.load("s1").await.unwrap().unwrap();
        assert_eq!(persisted, state);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let manager = manager();
        let err = manager
            .store_feedback("  ", None, Feedback::Positive { reason: None }, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = manager
            .store_feedback(
                "s1",
                None,
                Feedback::Correction { old_code: "".into(), new_code: "97112".into() },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(manager.get_feedback_state("s1").await.unwrap().feedback_entries.is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_cached_state_untouched() {
        let store = Arc::new(FlakyStore::default());
        let manager = FeedbackManager::new(store.clone());

        manager
            .store_feedback("s1", None, Feedback::Positive { reason: None }, None)
            .await
            .unwrap();

        store.fail_saves.store(true, Ordering::SeqCst);
        let err = manager
            .store_feedback(
                "s1",
                None,
                Feedback::Block { blocked_content: BlockTarget::Item("Planks".into()) },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage");

        let state = manager.get_feedback_state("s1").await.unwrap();
        assert_eq!(state.feedback_entries.len(), 1);
        assert!(state.blocked_items.is_empty());
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_all_recorded() {
        let manager = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let session = if i % 2 == 0 { "even" } else { "odd" };
                manager
                    .store_feedback(
                        session,
                        None,
                        Feedback::Block { blocked_content: BlockTarget::Code(format!("code-{}", i)) },
                        None,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let even = manager.get_feedback_state("even").await.unwrap();
        let odd = manager.get_feedback_state("odd").await.unwrap();
        assert_eq!(even.feedback_entries.len(), 8);
        assert_eq!(odd.feedback_entries.len(), 8);
        assert_eq!(even.blocked_codes.len(), 8);
    }

    #[tokio::test]
    async fn test_clear_feedback_resets_session() {
        let store = Arc::new(MemoryFeedbackStore::new());
        let manager = FeedbackManager::new(store.clone());
        manager
            .store_feedback(
                "s1",
                None,
                Feedback::Negative { reason: Some("too_basic".into()), code: None },
                None,
            )
            .await
            .unwrap();

        manager
            .store_feedback("s2", None, Feedback::Positive { reason: None }, None)
            .await
            .unwrap();
        assert_eq!(manager.sessions.lock().unwrap().len(), 2);

        manager.clear_feedback("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
        assert_eq!(manager.sessions.lock().unwrap().len(), 1);
        assert!(!manager.sessions.lock().unwrap().contains_key("s1"));
        assert_eq!(manager.get_feedback_state("s2").await.unwrap().feedback_entries.len(), 1);

        let state = manager.get_feedback_state("s1").await.unwrap();
        assert!(state.is_neutral());
        assert!(state.feedback_entries.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_a_new_manager() {
        let store = Arc::new(MemoryFeedbackStore::new());
        FeedbackManager::new(store.clone())
            .store_feedback(
                "s1",
                None,
                Feedback::Correction { old_code: "97110".into(), new_code: "97112".into() },
                None,
            )
            .await
            .unwrap();

        let state = FeedbackManager::new(store).get_feedback_state("s1").await.unwrap();
        assert_eq!(state.preferences.corrections["97110"], "97112");
    }

    #[tokio::test]
    async fn test_corrections_preference_reloads_from_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback");
        let file_store = || Arc::new(FileFeedbackStore::new(path.to_str().unwrap()));

        let writer = FeedbackManager::new(file_store());
        let feedback =
            Feedback::from_parts("preference", serde_json::json!({"key": "cpt_corrections", "value": {"97110": "97112"}}))
                .unwrap();
        writer.store_feedback("s1", None, feedback, None).await.unwrap();

        let reader = FeedbackManager::new(file_store());
        let state = reader.get_feedback_state("s1").await.unwrap();
        assert_eq!(state.preferences.corrections["97110"], "97112");
        assert!(state.preferences.other.is_empty());

        reader
            .store_feedback("s1", None, Feedback::Positive { reason: None }, None)
            .await
            .unwrap();
        let state = FeedbackManager::new(file_store()).get_feedback_state("s1").await.unwrap();
        assert_eq!(state.feedback_entries.len(), 2);
    }
}
