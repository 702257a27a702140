//! Session storage

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use super::Session;
use crate::{Error, Result};

/// Keyed storage for live sessions
///
/// Cross-session state lives only here; per-session state is behind each
/// session's own lock.
pub trait SessionStore: Send + Sync {
    /// Look up a session
    fn get(&self, key: &str) -> Option<Arc<Session>>;

    /// Look up a session, inserting a new one if absent
    fn get_or_create(&self, key: &str) -> Arc<Session>;

    /// Run `f` against an existing session
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the key is unknown
    fn update(&self, key: &str, f: &mut dyn FnMut(&Session)) -> Result<()> {
        let session = self
            .get(key)
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;
        f(&session);
        Ok(())
    }

    /// Remove a session
    fn delete(&self, key: &str) -> Option<Arc<Session>>;

    /// Remove and return every session idle longer than `expiry` at `now`
    fn sweep_expired(&self, now: Instant, expiry: Duration) -> Vec<Arc<Session>>;

    /// Number of stored sessions
    fn len(&self) -> usize;

    /// Whether the store holds no sessions
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn get_or_create(&self, key: &str) -> Arc<Session> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sessions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Session::new(key)))
            .clone()
    }

    fn delete(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key)
    }

    fn sweep_expired(&self, now: Instant, expiry: Duration) -> Vec<Arc<Session>> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.is_expired(now, expiry))
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .iter()
            .filter_map(|k| sessions.remove(k))
            .collect()
    }

    fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = MemorySessionStore::new();
        let a = store.get_or_create("k");
        let b = store.get_or_create("k");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_unknown_key_fails() {
        let store = MemorySessionStore::new();
        let result = store.update("missing", &mut |s| s.touch());
        assert!(matches!(result, Err(Error::SessionNotFound(_))));

        store.get_or_create("k");
        let mut seen = String::new();
        store.update("k", &mut |s| seen = s.key().to_string()).unwrap();
        assert_eq!(seen, "k");
    }

    #[test]
    fn delete_removes() {
        let store = MemorySessionStore::new();
        store.get_or_create("k");
        assert!(store.delete("k").is_some());
        assert!(store.get("k").is_none());
        assert!(store.delete("k").is_none());
    }

    #[test]
    fn sweep_keeps_fresh_sessions() {
        let store = MemorySessionStore::new();
        store.get_or_create("fresh");
        let later = Instant::now() + Duration::from_secs(10);

        assert!(store.sweep_expired(later, Duration::from_secs(60)).is_empty());
        let swept = store.sweep_expired(later, Duration::from_secs(1));
        assert_eq!(swept.len(), 1);
        assert_eq!(store.len(), 0);
    }
}
