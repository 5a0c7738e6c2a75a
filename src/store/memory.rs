//! In-memory store backend. Single-process, but implements the same
//! subscription and TTL semantics a remote backend must provide, so the
//! pipeline behaves identically against either.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GaleError;
use crate::store::{Store, StoreResult, Subscription};
use crate::time::now_ms;

#[derive(Default)]
struct SessionEntry {
    /// Insertion-ordered `(event_id, value)` pairs. Re-appending an existing
    /// id overwrites in place, keeping the log idempotent under redelivery.
    entries: Vec<(String, Value)>,
    expires_at: u64,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Value>,
    sessions: HashMap<String, SessionEntry>,
    channels: HashSet<String>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
    closed: bool,
}

impl Inner {
    fn live_session(&mut self, session: &str) -> Option<&mut SessionEntry> {
        let expired = self
            .sessions
            .get(session)
            .is_some_and(|entry| entry.expires_at <= now_ms());
        if expired {
            self.sessions.remove(session);
        }
        self.sessions.get_mut(session)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic mid-update; the store's data is
        // append-only values, safe to keep serving.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn value_get(&self, key: &str) -> StoreResult<Option<Value>> {
        let inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageGet("store is closed".into()));
        }
        Ok(inner.values.get(key).cloned())
    }

    async fn value_set(&self, key: &str, value: Value) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageSet("store is closed".into()));
        }
        inner.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn hash_set(
        &self,
        session: &str,
        event_id: &str,
        value: Value,
        ttl: Duration,
        publish: bool,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageSet("store is closed".into()));
        }

        let expires_at = now_ms().saturating_add(ttl.as_millis() as u64);
        let entry = inner.sessions.entry(session.to_string()).or_default();
        entry.expires_at = expires_at;
        match entry.entries.iter_mut().find(|(id, _)| id == event_id) {
            Some((_, existing)) => *existing = value.clone(),
            None => entry.entries.push((event_id.to_string(), value.clone())),
        }

        if publish && let Some(senders) = inner.subscribers.get_mut(session) {
            senders.retain(|tx| tx.send(value.clone()).is_ok());
        }
        Ok(())
    }

    async fn hash_get(&self, session: &str, event_id: &str) -> StoreResult<Option<Value>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageGet("store is closed".into()));
        }
        Ok(inner.live_session(session).and_then(|entry| {
            entry.entries.iter().find(|(id, _)| id == event_id).map(|(_, v)| v.clone())
        }))
    }

    async fn hash_get_all(&self, session: &str) -> StoreResult<Vec<(String, Value)>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageGet("store is closed".into()));
        }
        Ok(inner.live_session(session).map(|entry| entry.entries.clone()).unwrap_or_default())
    }

    async fn create_subscription(&self, session: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageSubscribe("store is closed".into()));
        }
        inner.channels.insert(session.to_string());
        Ok(())
    }

    async fn remove_subscription(&self, session: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.channels.remove(session);
        // Dropping the senders ends every attached receiver.
        inner.subscribers.remove(session);
        Ok(())
    }

    async fn subscribe(&self, session: &str) -> StoreResult<Subscription> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(GaleError::StorageSubscribe("store is closed".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.subscribers.entry(session.to_string()).or_default().push(tx);
        Ok(Subscription::new(session, rx))
    }

    async fn close(&self) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.values.clear();
        inner.sessions.clear();
        inner.channels.clear();
        inner.subscribers.clear();
        Ok(())
    }
}
