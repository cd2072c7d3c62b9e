//! Pluggable persistence for stepper state.
//!
//! A [`StateStore`] holds serialized tree snapshots keyed by an
//! experiment-page identifier, so a participant who reloads the page resumes
//! at the trial they left. The stepper treats saving as fire-and-forget:
//! store failures are logged and the session keeps running.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Mutex;

use serde_json::Value;

/// Opaque error reported by store implementations.
pub type StoreError = Box<dyn Error + Send + Sync>;

/// A key-value store for serialized stepper state.
///
/// Implementations wrap whatever the embedding persists to: browser storage
/// bridges, a file per session, a database row. Values are plain JSON as
/// produced by [`TreeSnapshot::to_value`](trialtree_core::TreeSnapshot::to_value).
pub trait StateStore: Send + Sync {
    /// Stores `state` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Whatever the backing medium reports; the caller logs and moves on.
    fn save(&self, key: &str, state: &Value) -> Result<(), StoreError>;

    /// Loads the state stored under `key`, or `None` if nothing was saved.
    ///
    /// # Errors
    ///
    /// Whatever the backing medium reports.
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;
}

/// In-memory [`StateStore`] for tests and single-process embeddings.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops the value stored under `key`, if any.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // A poisoned map is still a valid map; keep serving it.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StateStore for MemoryStore {
    fn save(&self, key: &str, state: &Value) -> Result<(), StoreError> {
        self.lock().insert(key.to_owned(), state.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trips_values() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.save("page-1", &json!({"id": "/", "cursor": 0})).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.load("page-1").unwrap(),
            Some(json!({"id": "/", "cursor": 0}))
        );
        assert_eq!(store.load("page-2").unwrap(), None);
    }

    #[test]
    fn save_replaces_and_remove_clears() {
        let store = MemoryStore::new();
        store.save("k", &json!(1)).unwrap();
        store.save("k", &json!(2)).unwrap();
        assert_eq!(store.load("k").unwrap(), Some(json!(2)));
        assert_eq!(store.remove("k"), Some(json!(2)));
        assert_eq!(store.load("k").unwrap(), None);
    }
}
