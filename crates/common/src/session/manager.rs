//! Session manager - runs one user turn end to end
//!
//! A turn is: claim the session (single-flight), load it, append the user
//! message, run the agentic loop, append the assistant answer, then emit
//! `sources` and `done`. Appends are version-conditioned. A user message is
//! rebased onto whatever history exists; an answer is rebased only while the
//! stored history still ends at its question, so it never lands after a turn
//! written by another connection.

use super::locks::{SessionGuard, SessionLocks};
use super::redis_store::RedisSessionStore;
use super::store::{InMemorySessionStore, SessionStore};
use super::{SessionState, SessionUpdate};
use crate::config::SessionConfig;
use crate::context::{AgenticLoop, LoopOutcome};
use crate::errors::{AppError, Result};
use crate::events::{EventSink, LoopEvent};
use crate::metrics;
use std::sync::Arc;
use uuid::Uuid;

/// Create a session store based on configuration
pub async fn create_session_store(config: &SessionConfig) -> Result<Arc<dyn SessionStore>> {
    match config.store.as_str() {
        "redis" => Ok(Arc::new(RedisSessionStore::new(config).await?)),
        "memory" => Ok(Arc::new(InMemorySessionStore::new())),
        other => {
            tracing::warn!(store = other, "Unknown session store, using memory");
            Ok(Arc::new(InMemorySessionStore::new()))
        }
    }
}

/// Session manager
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    agent: Arc<AgenticLoop>,
    locks: SessionLocks,
    max_append_retries: usize,
}

/// A turn whose user message is persisted and whose session is claimed.
///
/// Dropping it without calling [`PendingTurn::run`] releases the session.
pub struct PendingTurn {
    manager: SessionManager,
    session: SessionState,
    _guard: SessionGuard,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, agent: Arc<AgenticLoop>, max_append_retries: usize) -> Self {
        Self {
            store,
            agent,
            locks: SessionLocks::new(),
            max_append_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn create_session(&self) -> Result<SessionState> {
        let session = self.store.create().await?;
        tracing::info!(session_id = %session.id, backend = self.store.backend_name(), "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<SessionState> {
        self.store.load(id).await
    }

    /// Claim the session and persist the user message.
    ///
    /// Fails with `SessionBusy` while another turn runs on `id`.
    pub async fn begin_turn(&self, id: Uuid, message: &str) -> Result<PendingTurn> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AppError::Validation {
                message: "message must not be empty".to_string(),
                field: Some("message".to_string()),
            });
        }

        let guard = self.locks.try_acquire(id)?;
        let session = self.store.load(id).await?;
        let session = self
            .append_with_rebase(id, session.version, &SessionUpdate::user_message(message))
            .await?;

        tracing::info!(session_id = %id, version = session.version, "Turn started");
        Ok(PendingTurn {
            manager: self.clone(),
            session,
            _guard: guard,
        })
    }

    /// Run a full turn for `message`
    pub async fn process_message(&self, id: Uuid, message: &str, events: &EventSink) -> Result<LoopOutcome> {
        self.begin_turn(id, message).await?.run(events).await
    }

    /// Append, re-reading the version and retrying on conflict
    async fn append_with_rebase(&self, id: Uuid, expected: u64, update: &SessionUpdate) -> Result<SessionState> {
        let mut expected = expected;
        let mut rebases = 0;
        loop {
            match self.store.append(id, expected, update).await {
                Ok(state) => return Ok(state),
                Err(AppError::VersionConflict { actual, .. }) if rebases < self.max_append_retries => {
                    rebases += 1;
                    tracing::warn!(
                        session_id = %id,
                        expected,
                        actual,
                        rebases,
                        "History changed concurrently, rebasing append"
                    );
                    expected = actual;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append an answer directly after its question.
    ///
    /// `anchor` is the history length when the question was stored. A
    /// conflict is rebased only if the stored history still has that length.
    async fn append_answer(
        &self,
        id: Uuid,
        expected: u64,
        anchor: usize,
        update: &SessionUpdate,
    ) -> Result<SessionState> {
        let mut expected = expected;
        let mut rebases = 0;
        loop {
            match self.store.append(id, expected, update).await {
                Ok(state) => return Ok(state),
                Err(AppError::VersionConflict { actual, .. }) if rebases < self.max_append_retries => {
                    let stored = self.store.load(id).await?;
                    if stored.history.len() != anchor {
                        tracing::warn!(
                            session_id = %id,
                            anchor,
                            stored_turns = stored.history.len(),
                            "Another turn followed the question, answer not appended"
                        );
                        return Err(AppError::VersionConflict {
                            id: id.to_string(),
                            expected,
                            actual: stored.version,
                        });
                    }
                    rebases += 1;
                    tracing::warn!(session_id = %id, expected, actual, rebases, "Rebasing answer append");
                    expected = stored.version;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl PendingTurn {
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Run the loop, persist the answer, then emit `sources` and `done`.
    ///
    /// A loop or persistence failure emits exactly one `error` event and no
    /// `done`; the user message stays in history.
    pub async fn run(self, events: &EventSink) -> Result<LoopOutcome> {
        let id = self.session.id;
        let (expected, anchor) = (self.session.version, self.session.history.len());

        let mut outcome = match self.manager.agent.run(self.session, events).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(abort(id, e, "Turn aborted", events).await),
        };

        if !outcome.update.is_empty() {
            match self.manager.append_answer(id, expected, anchor, &outcome.update).await {
                Ok(session) => outcome.session = session,
                Err(e) => return Err(abort(id, e, "Failed to persist answer", events).await),
            }
        }
        outcome.emit_completion(events).await;

        tracing::info!(
            session_id = %id,
            version = outcome.session.version,
            iterations = outcome.iterations,
            stop_reason = outcome.stop_reason.as_str(),
            "Turn finished"
        );
        Ok(outcome)
    }
}

/// Report a failed turn on the event stream
async fn abort(id: Uuid, error: AppError, context: &'static str, events: &EventSink) -> AppError {
    metrics::record_loop_abort(&error.code().as_code().to_string());
    tracing::error!(session_id = %id, error = %error, "{}", context);
    events.emit(LoopEvent::Error { message: error.to_string() }).await;
    error
}
