//! Session registry: groups run ids under a caller-defined session label.
//!
//! Purely additive. Runs are referenced by id, never embedded, so the run
//! tracker stays the single owner of mutable run state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A session descriptor: the ordered list of run ids created under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub runs: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            runs: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Thread-safe registry of sessions.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh id and return that id.
    #[must_use]
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.ensure(&id);
        id
    }

    /// Create an empty session if absent. Idempotent.
    pub fn ensure(&self, id: &str) {
        let mut guard = self.inner.write().unwrap();
        guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id.to_string()));
    }

    /// Append a run id to the session's ordered list.
    pub fn attach(&self, id: &str, run_id: &str) {
        let mut guard = self.inner.write().unwrap();
        guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id.to_string()))
            .runs
            .push(run_id.to_string());
    }

    /// Get a session snapshot by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        let guard = self.inner.read().unwrap();
        guard.get(id).cloned()
    }

    /// Number of known sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.ensure("s1");
        registry.attach("s1", "r1");
        registry.ensure("s1");

        let session = registry.get("s1").unwrap();
        assert_eq!(session.runs, vec!["r1"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_attach_preserves_order() {
        let registry = SessionRegistry::new();
        registry.attach("s1", "r1");
        registry.attach("s1", "r2");
        registry.attach("s1", "r3");

        let session = registry.get("s1").unwrap();
        assert_eq!(session.runs, vec!["r1", "r2", "r3"]);
    }

    #[test]
    fn test_get_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_generates_fresh_ids() {
        let registry = SessionRegistry::new();
        let a = registry.create();
        let b = registry.create();
        assert_ne!(a, b);
        assert!(registry.get(&a).unwrap().runs.is_empty());
    }
}
