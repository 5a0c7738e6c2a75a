//! Storage abstraction shared by every request pipeline.
//!
//! The engine only ever talks to this trait: plain values for model state,
//! per-session hashes for history, and per-session pub/sub channels for live
//! fan-out. The in-memory backend ships with the crate; a remote KV/pub-sub
//! backend implements the same contract and is injected through
//! `StorageOptions::Custom`.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::GaleError;

pub type StoreResult<T> = Result<T, GaleError>;

/// Receiving half of a per-session subscription. Values arrive in append
/// order, at-least-once; consumers dedupe by event id. Dropping the handle
/// detaches it from the session channel.
pub struct Subscription {
    session: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn new(session: impl Into<String>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { session: session.into(), rx }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Next published value, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Already-delivered value, without waiting.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Read a plain value (model state lives here).
    async fn value_get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write a plain value.
    async fn value_set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Append one field to a session hash, refreshing the whole session's
    /// TTL. With `publish` set, the value also goes out to subscribers.
    async fn hash_set(
        &self,
        session: &str,
        event_id: &str,
        value: Value,
        ttl: Duration,
        publish: bool,
    ) -> StoreResult<()>;

    /// Read a single field from a session hash.
    async fn hash_get(&self, session: &str, event_id: &str) -> StoreResult<Option<Value>>;

    /// Read the whole session hash as `(event_id, value)` pairs in append
    /// order. Expired or unknown sessions read as empty.
    async fn hash_get_all(&self, session: &str) -> StoreResult<Vec<(String, Value)>>;

    /// Ensure the session's pub/sub channel exists. Idempotent.
    async fn create_subscription(&self, session: &str) -> StoreResult<()>;

    /// Tear the session's pub/sub channel down, detaching all subscribers.
    /// Idempotent.
    async fn remove_subscription(&self, session: &str) -> StoreResult<()>;

    /// Attach a subscriber to the session's channel.
    async fn subscribe(&self, session: &str) -> StoreResult<Subscription>;

    async fn close(&self) -> StoreResult<()>;
}
