//! Session contexts: per-session transcripts and caller annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::provider::types::ChatMessage;

/// The mutable state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub messages: Vec<ChatMessage>,
    pub annotations: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl SessionContext {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            messages: Vec::new(),
            annotations: HashMap::new(),
            created_at: now,
            last_used: now,
        }
    }

    /// Append one exchange and touch the freshness stamp.
    pub fn record_exchange(&mut self, user: ChatMessage, assistant: ChatMessage) {
        self.messages.push(user);
        self.messages.push(assistant);
        self.last_used = Utc::now();
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: Value) {
        self.annotations.insert(key.into(), value);
        self.last_used = Utc::now();
    }
}

/// Holds all live sessions. Each session has its own tokio mutex; the
/// facade holds it for the duration of a call, which serializes calls
/// within a session while leaving other sessions untouched.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionContext>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the handle for a session, creating it on first use.
    pub fn handle(&self, session_id: &str) -> Arc<Mutex<SessionContext>> {
        if let Some(handle) = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
        {
            return Arc::clone(handle);
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionContext::new()))),
        )
    }

    /// Whether a session currently exists.
    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(session_id)
    }

    /// Snapshot a session's context without creating it.
    pub async fn context(&self, session_id: &str) -> Option<SessionContext> {
        let handle = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()?;
        let ctx = handle.lock().await.clone();
        Some(ctx)
    }

    /// Drop a session immediately. Returns whether one existed.
    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
            .is_some()
    }

    /// Drop sessions idle longer than `max_idle`. Returns how many were
    /// removed. The embedding application decides the cadence.
    pub async fn prune_idle(&self, max_idle: chrono::Duration) -> usize {
        let now = Utc::now();
        let candidates: Vec<(String, Arc<Mutex<SessionContext>>)> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions
                .iter()
                .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
                .collect()
        };

        let mut stale = Vec::new();
        for (id, handle) in candidates {
            let context = handle.lock().await;
            if now - context.last_used > max_idle {
                stale.push(id);
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        for id in &stale {
            sessions.remove(id);
        }
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_created_on_first_use() {
        let store = SessionStore::new();
        assert!(!store.exists("s1"));
        assert!(store.context("s1").await.is_none());

        let handle = store.handle("s1");
        assert!(store.exists("s1"));
        drop(handle);
        assert!(store.context("s1").await.is_some());
    }

    #[tokio::test]
    async fn test_exchange_visible_to_next_call() {
        let store = SessionStore::new();
        {
            let handle = store.handle("s1");
            let mut context = handle.lock().await;
            context.record_exchange(
                ChatMessage::user("what is rust"),
                ChatMessage::assistant("a systems language"),
            );
        }

        let context = store.context("s1").await.unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].content, "what is rust");
    }

    #[tokio::test]
    async fn test_delete_is_synchronous_and_complete() {
        let store = SessionStore::new();
        store.handle("s1");
        {
            let handle = store.handle("s1");
            handle.lock().await.annotate("topic", "rust".into());
        }

        assert!(store.delete("s1"));
        assert!(!store.exists("s1"));
        assert!(store.context("s1").await.is_none());
        // Double-delete reports nothing left to remove.
        assert!(!store.delete("s1"));
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let store = SessionStore::new();
        {
            let handle = store.handle("a");
            handle
                .lock()
                .await
                .record_exchange(ChatMessage::user("1"), ChatMessage::assistant("2"));
        }
        store.handle("b");

        assert_eq!(store.context("a").await.unwrap().messages.len(), 2);
        assert_eq!(store.context("b").await.unwrap().messages.len(), 0);
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let store = SessionStore::new();
        store.handle("fresh");
        {
            let handle = store.handle("stale");
            let mut context = handle.lock().await;
            context.last_used = Utc::now() - chrono::Duration::hours(3);
        }

        let removed = store.prune_idle(chrono::Duration::hours(1)).await;
        assert_eq!(removed, 1);
        assert!(store.exists("fresh"));
        assert!(!store.exists("stale"));
    }
}
