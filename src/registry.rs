//! Per-model state shared through the store: availability status, error
//! reason, and the rate-limit window. Updates are last-writer-wins by
//! operation timestamp, with one override: an error state whose restore
//! window has elapsed may be flipped back to ready by an older-stamped
//! writer. Cross-process races can briefly oscillate a state; they cannot
//! admit more than one extra request per contested window.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ModelSettings;
use crate::error::{ErrorReason, GaleError};
use crate::store::Store;
use crate::time::now_ms;

/// `provider:name` pair identifying one configured model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub provider: String,
    pub name: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self { provider: provider.into(), name: name.into() }
    }

    /// Parse a `provider:name` candidate string. The name may itself contain
    /// colons (vendor-scoped ids); only the first separates the provider.
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, name) = raw.split_once(':')?;
        if provider.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(provider, name))
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub status: ModelStatus,
    /// Operation timestamp (ms epoch) of the write that produced this state.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorReason>,
}

impl ModelState {
    pub fn ready(timestamp: u64) -> Self {
        Self { status: ModelStatus::Ready, timestamp, reason: None }
    }

    pub fn error(reason: ErrorReason, timestamp: u64) -> Self {
        Self { status: ModelStatus::Error, timestamp, reason: Some(reason) }
    }
}

/// Fixed-window rate accounting for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u64,
    pub window_start: u64,
}

/// The full stored record for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub rate_limit: RateWindow,
    pub state: ModelState,
}

pub(crate) struct ModelRegistry {
    store: Arc<dyn Store>,
    settings: HashMap<ModelKey, ModelSettings>,
    order: Vec<ModelKey>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn Store>, models: Vec<(String, String, ModelSettings)>) -> Self {
        let mut settings = HashMap::new();
        let mut order = Vec::with_capacity(models.len());
        for (provider, name, model_settings) in models {
            let key = ModelKey::new(provider, name);
            if settings.insert(key.clone(), model_settings).is_none() {
                order.push(key);
            }
        }
        Self { store, settings, order }
    }

    /// Configured candidates in priority order.
    pub fn candidates(&self) -> &[ModelKey] {
        &self.order
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.settings.contains_key(key)
    }

    pub fn settings(&self, key: &ModelKey) -> Option<&ModelSettings> {
        self.settings.get(key)
    }

    fn store_key(key: &ModelKey) -> String {
        format!("model:{}:{}", key.provider, key.name)
    }

    /// Seed every configured model that has no stored record yet as ready.
    pub async fn init(&self) -> Result<(), GaleError> {
        let now = now_ms();
        for key in &self.order {
            if self.record(key).await?.is_none() {
                let record =
                    ModelRecord { rate_limit: RateWindow::default(), state: ModelState::ready(now) };
                self.write(key, &record).await?;
            }
        }
        Ok(())
    }

    pub async fn record(&self, key: &ModelKey) -> Result<Option<ModelRecord>, GaleError> {
        let value = self.store.value_get(&Self::store_key(key)).await?;
        Ok(value.and_then(|v| match serde_json::from_value(v) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(model = %key, "discarding unreadable model record: {e}");
                None
            }
        }))
    }

    async fn write(&self, key: &ModelKey, record: &ModelRecord) -> Result<(), GaleError> {
        let value = serde_json::to_value(record)
            .map_err(|e| GaleError::StorageSet(format!("model record for {key}: {e}")))?;
        self.store.value_set(&Self::store_key(key), value).await
    }

    /// Apply a state transition under the last-writer-wins rules. The new
    /// state's own timestamp is the operation timestamp.
    pub async fn set_model_state(&self, key: &ModelKey, new_state: ModelState) -> Result<(), GaleError> {
        let stored = self.record(key).await?;

        let (rate_limit, accept) = match &stored {
            None => (RateWindow::default(), true),
            Some(record) if record.state.timestamp < new_state.timestamp => {
                (record.rate_limit, true)
            }
            Some(record) => {
                // Older-stamped write: only valid as an error→ready restore
                // whose window has already elapsed.
                let restorable = new_state.status == ModelStatus::Ready
                    && record.state.status == ModelStatus::Error
                    && self.restore_elapsed(key, &record.state);
                (record.rate_limit, restorable)
            }
        };

        if !accept {
            tracing::debug!(model = %key, "model state transition rejected as stale");
            return Ok(());
        }

        tracing::debug!(
            model = %key,
            status = ?new_state.status,
            reason = new_state.reason.map(|r| r.code()),
            "model state updated"
        );
        self.write(key, &ModelRecord { rate_limit, state: new_state }).await
    }

    /// Overwrite only the rate-limit sub-field. Read-modify-write, not
    /// atomic; the window can drift by at most one admission under races.
    pub async fn update_rate_limit(&self, key: &ModelKey, rate_limit: RateWindow) -> Result<(), GaleError> {
        let state = match self.record(key).await? {
            Some(record) => record.state,
            None => ModelState::ready(now_ms()),
        };
        self.write(key, &ModelRecord { rate_limit, state }).await
    }

    pub async fn mark_error(&self, key: &ModelKey, reason: ErrorReason, op_ts: u64) -> Result<(), GaleError> {
        self.set_model_state(key, ModelState::error(reason, op_ts)).await
    }

    /// True when an errored state's restore window has elapsed and the model
    /// may be optimistically flipped back to ready.
    pub fn restore_elapsed(&self, key: &ModelKey, state: &ModelState) -> bool {
        if state.status != ModelStatus::Error {
            return false;
        }
        let Some(reason) = state.reason else {
            return false;
        };
        let Some(settings) = self.settings.get(key) else {
            return false;
        };
        match settings.restore.window_for(reason) {
            Some(window_ms) => state.timestamp.saturating_add(window_ms) < now_ms(),
            None => false,
        }
    }
}
