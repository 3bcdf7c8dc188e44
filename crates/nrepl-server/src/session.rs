// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Server-side sessions and the store shared by every connection

use crate::eval::EvalContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// Server-side state addressed by a client-supplied id
///
/// The namespace is the only mutable part. Writes are not serialised beyond
/// the lock: when two connections address the same session concurrently the
/// last writer wins.
#[derive(Debug)]
pub struct Session {
    id: String,
    namespace: RwLock<Option<String>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            namespace: RwLock::new(None),
        }
    }

    /// Get the session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> Option<String> {
        self.namespace
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_namespace(&self, namespace: impl Into<String>) {
        *self
            .namespace
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(namespace.into());
    }

    pub fn context(&self) -> EvalContext {
        EvalContext {
            session_id: Some(self.id.clone()),
            namespace: self.namespace(),
        }
    }
}

/// Thread-safe map of session id to session
///
/// Sessions are never evicted; they live until the process exits.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh random id and no namespace bound
    pub fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.lock()
            .insert(id.clone(), Arc::new(Session::new(id.clone())));
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// All known session ids, in no particular order
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_create_session_is_retrievable() {
        let store = SessionStore::new();
        let id = store.create_session();

        let session = store.get(&id).expect("session should exist");
        assert_eq!(session.id(), id);
        assert_eq!(session.namespace(), None);
        assert!(Uuid::parse_str(&id).is_ok(), "id should be a UUID: {}", id);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = SessionStore::new();
        assert!(store.get("no-such-session").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let store = SessionStore::new();
        let created: HashSet<String> = (0..100).map(|_| store.create_session()).collect();

        assert_eq!(created.len(), 100);
        let listed: HashSet<String> = store.ids().into_iter().collect();
        assert_eq!(listed, created);
    }

    #[test]
    fn test_namespace_is_shared_through_store() {
        let store = SessionStore::new();
        let id = store.create_session();

        store
            .get(&id)
            .expect("session should exist")
            .set_namespace("test.ns");

        let context = store.get(&id).expect("session should exist").context();
        assert_eq!(context.namespace.as_deref(), Some("test.ns"));
        assert_eq!(context.session_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_concurrent_creation() {
        let store = Arc::new(SessionStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.create_session();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(store.len(), 200);
    }
}
