//! Session store abstraction and the in-memory backend

use super::{SessionState, SessionUpdate};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Persistence for conversation sessions.
///
/// `append` is conditioned on the caller's view of the version: it fails
/// with `VersionConflict` when another writer got there first, and nothing
/// is written in that case.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist an empty session
    async fn create(&self) -> Result<SessionState>;

    /// Load a session; `SessionNotFound` if it does not exist
    async fn load(&self, id: Uuid) -> Result<SessionState>;

    /// Append `update` if the stored version equals `expected_version`.
    /// Returns the new state, whose version is one higher.
    async fn append(&self, id: Uuid, expected_version: u64, update: &SessionUpdate) -> Result<SessionState>;

    /// Check backend connectivity
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs and readiness output
    fn backend_name(&self) -> &'static str;
}

/// Process-local store
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self) -> Result<SessionState> {
        let state = SessionState::new(Uuid::new_v4());
        self.sessions.write().await.insert(state.id, state.clone());
        tracing::debug!(session_id = %state.id, "Session created");
        Ok(state)
    }

    async fn load(&self, id: Uuid) -> Result<SessionState> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })
    }

    async fn append(&self, id: Uuid, expected_version: u64, update: &SessionUpdate) -> Result<SessionState> {
        let mut sessions = self.sessions.write().await;
        let state = sessions.get_mut(&id).ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })?;

        if state.version != expected_version {
            return Err(AppError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: state.version,
            });
        }

        state.apply(update);
        state.version += 1;
        Ok(state.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConversationTurn;

    #[tokio::test]
    async fn test_create_load_append() {
        let store = InMemorySessionStore::new();
        let created = store.create().await.unwrap();

        let updated = store
            .append(created.id, 0, &SessionUpdate::user_message("What is policy X?"))
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let loaded = store.load(created.id).await.unwrap();
        assert_eq!(loaded.history, vec![ConversationTurn::user("What is policy X?")]);
        assert_eq!(loaded.message_count, 1);
    }

    #[tokio::test]
    async fn test_stale_append_is_rejected() {
        let store = InMemorySessionStore::new();
        let created = store.create().await.unwrap();
        store.append(created.id, 0, &SessionUpdate::user_message("first")).await.unwrap();

        let err = store
            .append(created.id, 0, &SessionUpdate::user_message("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VersionConflict { expected: 0, actual: 1, .. }));
        assert_eq!(store.load(created.id).await.unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = InMemorySessionStore::new();
        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound { .. }));
    }
}
