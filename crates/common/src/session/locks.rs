//! Single-flight guards: one in-progress turn per session

use crate::errors::{AppError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Registry of sessions with a turn in progress
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`; fails with `SessionBusy` if a turn is already running
    pub fn try_acquire(&self, id: Uuid) -> Result<SessionGuard> {
        if !lock(&self.active).insert(id) {
            return Err(AppError::SessionBusy { id: id.to_string() });
        }
        Ok(SessionGuard {
            id,
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_busy(&self, id: Uuid) -> bool {
        lock(&self.active).contains(&id)
    }
}

/// Releases its session on drop
#[derive(Debug)]
pub struct SessionGuard {
    id: Uuid,
    active: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.id);
    }
}

fn lock(active: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_busy_until_release() {
        let locks = SessionLocks::new();
        let id = Uuid::new_v4();

        let guard = locks.try_acquire(id).unwrap();
        assert!(locks.is_busy(id));
        assert!(matches!(locks.try_acquire(id), Err(AppError::SessionBusy { .. })));

        drop(guard);
        assert!(!locks.is_busy(id));
        assert!(locks.try_acquire(id).is_ok());
    }

    #[test]
    fn test_sessions_are_independent() {
        let locks = SessionLocks::new();
        let _a = locks.try_acquire(Uuid::new_v4()).unwrap();
        assert!(locks.try_acquire(Uuid::new_v4()).is_ok());
    }
}
