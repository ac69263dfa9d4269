/// Process-local feedback store. State is lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::FeedbackStore;
use crate::errors::GroundrankError;
use crate::feedback::FeedbackState;

#[derive(Default)]
pub struct MemoryFeedbackStore {
    states: RwLock<HashMap<String, FeedbackState>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn load(&self, session_id: &str) -> Result<Option<FeedbackState>, GroundrankError> {
        Ok(self.states.read().await.get(session_id).cloned())
    }

    async fn save(&self, state: &FeedbackState) -> Result<(), GroundrankError> {
        self.states
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), GroundrankError> {
        self.states.write().await.remove(session_id);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_delete() {
        let store = MemoryFeedbackStore::new();
        assert!(store.load("s1").await.unwrap().is_none());

        let mut state = FeedbackState::new("s1");
        state.blocked_codes.insert("97110".to_string());
        store.save(&state).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap(), Some(state));

        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
    }
}
