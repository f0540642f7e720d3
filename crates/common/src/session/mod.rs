//! Conversation sessions
//!
//! Provides:
//! - The explicit session-state value handed to and returned by the loop
//! - Version-conditioned history stores (in-memory and Redis)
//! - Per-session single-flight guards
//! - The manager that runs one turn end to end

mod locks;
mod manager;
mod redis_store;
mod store;

pub use locks::{SessionGuard, SessionLocks};
pub use manager::{create_session_store, PendingTurn, SessionManager};
pub use redis_store::RedisSessionStore;
pub use store::{InMemorySessionStore, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the append-only history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Persisted state of one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: Uuid,

    pub history: Vec<ConversationTurn>,

    /// Bumped by the store on every successful append
    pub version: u64,

    /// Turns appended so far
    pub message_count: u64,

    /// Searches executed across all turns
    pub search_count: u64,

    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl SessionState {
    /// A fresh, empty session
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            history: Vec::new(),
            version: 0,
            message_count: 0,
            search_count: 0,
            created_at: now,
            last_active_at: now,
        }
    }

    /// Content of the newest turn if it is the user's
    pub fn pending_user_message(&self) -> Option<&str> {
        self.history
            .last()
            .filter(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
    }

    /// Apply an update without touching the version
    pub fn apply(&mut self, update: &SessionUpdate) {
        self.history.extend(update.turns.iter().cloned());
        self.message_count += update.turns.len() as u64;
        self.search_count += update.searches;
        self.last_active_at = Utc::now();
    }
}

/// Changes produced by one step of a turn, appended atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdate {
    pub turns: Vec<ConversationTurn>,
    pub searches: u64,
}

impl SessionUpdate {
    pub fn user_message(content: impl Into<String>) -> Self {
        Self {
            turns: vec![ConversationTurn::user(content)],
            searches: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.searches == 0
    }
}

/// User turns before the newest one, oldest first
pub fn prior_user_turns(history: &[ConversationTurn]) -> Vec<String> {
    let end = match history.last() {
        Some(turn) if turn.role == Role::User => history.len() - 1,
        _ => history.len(),
    };
    history[..end]
        .iter()
        .filter(|turn| turn.role == Role::User)
        .map(|turn| turn.content.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_user_turns_excludes_current() {
        let history = vec![
            ConversationTurn::user("What is policy X?"),
            ConversationTurn::assistant("Policy X is..."),
            ConversationTurn::user("and clause Y?"),
        ];
        assert_eq!(prior_user_turns(&history), vec!["What is policy X?".to_string()]);
        assert!(prior_user_turns(&history[..1]).is_empty());
        assert_eq!(prior_user_turns(&history[..2]).len(), 1);
    }

    #[test]
    fn test_apply_keeps_version() {
        let mut state = SessionState::new(Uuid::new_v4());
        state.apply(&SessionUpdate {
            turns: vec![ConversationTurn::user("hi"), ConversationTurn::assistant("hello")],
            searches: 2,
        });
        assert_eq!(state.version, 0);
        assert_eq!(state.message_count, 2);
        assert_eq!(state.search_count, 2);
        assert_eq!(state.pending_user_message(), None);
    }

    #[test]
    fn test_turn_serialization() {
        let json = serde_json::to_value(ConversationTurn::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "user", "content": "hi" }));
    }
}
