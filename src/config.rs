//! Engine options: providers, model candidates, storage, limits, restore
//! windows. Everything time-shaped accepts raw milliseconds or `<n>(ms|s|m|h|d)`
//! strings and is resolved (and validated) once at engine construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorReason, GaleError};
use crate::provider::Provider;
use crate::store::Store;
use crate::time::TimeWindow;

pub struct EngineOptions {
    /// Upstream providers by name. At least one required.
    pub providers: HashMap<String, ProviderOptions>,
    /// Model candidates in priority order. At least one required.
    pub models: Vec<ModelOptions>,
    pub storage: StorageOptions,
    pub limits: LimitOptions,
    pub restore: RestoreOptions,
}

pub struct ProviderOptions {
    pub api_key: String,
    /// Chat-completions endpoint for the built-in HTTP adapter. Known
    /// provider names (`openai`, `deepseek`) get a default endpoint.
    pub base_url: Option<String>,
    /// Injected adapter. Overrides the built-in HTTP adapter entirely;
    /// this is how tests and custom upstreams plug in.
    pub client: Option<Arc<dyn Provider>>,
}

impl ProviderOptions {
    pub fn with_client(client: Arc<dyn Provider>) -> Self {
        Self { api_key: String::new(), base_url: None, client: Some(client) }
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), base_url: None, client: None }
    }
}

#[derive(Clone)]
pub struct ModelOptions {
    pub provider: String,
    pub model: String,
    pub limits: Option<ModelLimits>,
    pub restore: Option<RestoreOptions>,
}

impl ModelOptions {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into(), limits: None, restore: None }
    }
}

#[derive(Clone, Default)]
pub struct ModelLimits {
    pub max_tokens: Option<u64>,
    pub rate: Option<RateOptions>,
}

#[derive(Clone)]
pub struct RateOptions {
    pub max: u64,
    pub time_window: TimeWindow,
}

#[derive(Clone, Default)]
pub enum StorageOptions {
    #[default]
    Memory,
    /// Remote or otherwise external backend implementing the store contract.
    Custom(Arc<dyn Store>),
}

#[derive(Clone)]
pub struct LimitOptions {
    pub max_tokens: Option<u64>,
    pub rate: RateOptions,
    pub request_timeout: TimeWindow,
    pub retry: RetryOptions,
    pub history_expiration: TimeWindow,
}

#[derive(Clone)]
pub struct RetryOptions {
    pub max: u32,
    pub interval: TimeWindow,
}

#[derive(Clone)]
pub struct RestoreOptions {
    pub rate_limit: TimeWindow,
    pub retry: TimeWindow,
    pub timeout: TimeWindow,
    pub provider_communication_error: TimeWindow,
    pub provider_exceeded_error: TimeWindow,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            rate: RateOptions { max: 200, time_window: TimeWindow::from("30s") },
            request_timeout: TimeWindow::from("30s"),
            retry: RetryOptions { max: 1, interval: TimeWindow::from("1s") },
            history_expiration: TimeWindow::from("1d"),
        }
    }
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            rate_limit: TimeWindow::from("1m"),
            retry: TimeWindow::from("1m"),
            timeout: TimeWindow::from("1m"),
            provider_communication_error: TimeWindow::from("1m"),
            provider_exceeded_error: TimeWindow::from("10m"),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            models: Vec::new(),
            storage: StorageOptions::default(),
            limits: LimitOptions::default(),
            restore: RestoreOptions::default(),
        }
    }
}

/// Engine-wide limits with every window resolved to milliseconds.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedLimits {
    pub max_tokens: Option<u64>,
    pub request_timeout_ms: u64,
    pub retry_max: u32,
    pub retry_interval_ms: u64,
    pub history_expiration_ms: u64,
}

/// Restore windows in milliseconds, indexed by error reason.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedRestore {
    pub rate_limit_ms: u64,
    pub retry_ms: u64,
    pub timeout_ms: u64,
    pub provider_comm_error_ms: u64,
    pub provider_exceeded_error_ms: u64,
}

impl ResolvedRestore {
    /// Minimum time an errored model stays out of rotation. `None` means the
    /// reason is not auto-restorable.
    pub fn window_for(&self, reason: ErrorReason) -> Option<u64> {
        match reason {
            ErrorReason::RateLimit => Some(self.rate_limit_ms),
            ErrorReason::RequestTimeout | ErrorReason::StreamTimeout => Some(self.timeout_ms),
            ErrorReason::Response | ErrorReason::NoContent => Some(self.provider_comm_error_ms),
            ErrorReason::ExceededQuota => Some(self.provider_exceeded_error_ms),
            ErrorReason::MaxTokens => None,
        }
    }
}

/// Per-model settings after merging model overrides over engine defaults.
#[derive(Clone, Debug)]
pub(crate) struct ModelSettings {
    pub max_tokens: Option<u64>,
    pub rate_max: u64,
    pub rate_window_ms: u64,
    pub restore: ResolvedRestore,
}

#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub limits: ResolvedLimits,
    /// `(provider, model, settings)` in candidate priority order.
    pub models: Vec<(String, String, ModelSettings)>,
}

fn resolve_restore(options: &RestoreOptions) -> Result<ResolvedRestore, GaleError> {
    Ok(ResolvedRestore {
        rate_limit_ms: options.rate_limit.to_millis()?,
        retry_ms: options.retry.to_millis()?,
        timeout_ms: options.timeout.to_millis()?,
        provider_comm_error_ms: options.provider_communication_error.to_millis()?,
        provider_exceeded_error_ms: options.provider_exceeded_error.to_millis()?,
    })
}

impl EngineOptions {
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig, GaleError> {
        if self.providers.is_empty() {
            return Err(GaleError::Option("at least one provider is required".into()));
        }
        if self.models.is_empty() {
            return Err(GaleError::Option("at least one model is required".into()));
        }

        let default_rate_max = self.limits.rate.max;
        let default_rate_window = self.limits.rate.time_window.to_millis()?;
        if default_rate_max == 0 {
            return Err(GaleError::Option("limits.rate.max must be greater than zero".into()));
        }

        let limits = ResolvedLimits {
            max_tokens: self.limits.max_tokens,
            request_timeout_ms: self.limits.request_timeout.to_millis()?,
            retry_max: self.limits.retry.max,
            retry_interval_ms: self.limits.retry.interval.to_millis()?,
            history_expiration_ms: self.limits.history_expiration.to_millis()?,
        };
        let restore = resolve_restore(&self.restore)?;

        let mut models = Vec::with_capacity(self.models.len());
        for entry in &self.models {
            if !self.providers.contains_key(&entry.provider) {
                return Err(GaleError::Option(format!(
                    "model {}:{} references unconfigured provider {}",
                    entry.provider, entry.model, entry.provider
                )));
            }

            let model_limits = entry.limits.clone().unwrap_or_default();
            let (rate_max, rate_window_ms) = match &model_limits.rate {
                Some(rate) => {
                    if rate.max == 0 {
                        return Err(GaleError::Option(format!(
                            "model {}:{} rate.max must be greater than zero",
                            entry.provider, entry.model
                        )));
                    }
                    (rate.max, rate.time_window.to_millis()?)
                }
                None => (default_rate_max, default_rate_window),
            };

            let model_restore = match &entry.restore {
                Some(r) => resolve_restore(r)?,
                None => restore.clone(),
            };

            models.push((
                entry.provider.clone(),
                entry.model.clone(),
                ModelSettings {
                    // Model-level cap only; the pipeline resolves the final
                    // cap as model setting, else request, else engine default.
                    max_tokens: model_limits.max_tokens,
                    rate_max,
                    rate_window_ms,
                    restore: model_restore,
                },
            ));
        }

        // Informational only: generation runs uncapped when nothing sets a
        // token limit.
        if limits.max_tokens.is_none() && models.iter().all(|(_, _, s)| s.max_tokens.is_none()) {
            tracing::warn!("no max_tokens configured at any level; responses are uncapped");
        }

        Ok(ResolvedConfig { limits, models })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> EngineOptions {
        let mut providers = HashMap::new();
        providers.insert("openai".to_string(), ProviderOptions::with_api_key("sk-test"));
        EngineOptions {
            providers,
            models: vec![ModelOptions::new("openai", "gpt-4o-mini")],
            ..EngineOptions::default()
        }
    }

    #[test]
    fn defaults_resolve() {
        let resolved = minimal().resolve().unwrap();
        assert_eq!(resolved.limits.request_timeout_ms, 30_000);
        assert_eq!(resolved.limits.retry_max, 1);
        assert_eq!(resolved.limits.retry_interval_ms, 1_000);
        assert_eq!(resolved.limits.history_expiration_ms, 86_400_000);

        let (_, _, settings) = &resolved.models[0];
        assert_eq!(settings.rate_max, 200);
        assert_eq!(settings.rate_window_ms, 30_000);
        assert_eq!(settings.restore.provider_exceeded_error_ms, 600_000);
        assert_eq!(settings.restore.rate_limit_ms, 60_000);
    }

    #[test]
    fn requires_providers_and_models() {
        let empty = EngineOptions::default();
        assert_eq!(empty.resolve().unwrap_err().code(), "OPTION_ERROR");

        let mut no_models = minimal();
        no_models.models.clear();
        assert_eq!(no_models.resolve().unwrap_err().code(), "OPTION_ERROR");
    }

    #[test]
    fn rejects_model_with_unknown_provider() {
        let mut options = minimal();
        options.models.push(ModelOptions::new("mystery", "m1"));
        assert_eq!(options.resolve().unwrap_err().code(), "OPTION_ERROR");
    }

    #[test]
    fn model_overrides_win_over_defaults() {
        let mut options = minimal();
        options.limits.max_tokens = Some(1_000);
        options.models[0].limits = Some(ModelLimits {
            max_tokens: Some(64),
            rate: Some(RateOptions { max: 5, time_window: TimeWindow::from("10s") }),
        });
        options.models[0].restore = Some(RestoreOptions {
            rate_limit: TimeWindow::from("2s"),
            ..RestoreOptions::default()
        });

        let resolved = options.resolve().unwrap();
        let (_, _, settings) = &resolved.models[0];
        assert_eq!(settings.max_tokens, Some(64));
        assert_eq!(settings.rate_max, 5);
        assert_eq!(settings.rate_window_ms, 10_000);
        assert_eq!(settings.restore.rate_limit_ms, 2_000);
    }

    #[test]
    fn bad_time_window_surfaces() {
        let mut options = minimal();
        options.limits.request_timeout = TimeWindow::from("thirty seconds");
        assert_eq!(options.resolve().unwrap_err().code(), "INVALID_TIME_WINDOW_FORMAT_ERROR");
    }

    #[test]
    fn zero_rate_max_is_rejected() {
        let mut options = minimal();
        options.limits.rate.max = 0;
        assert_eq!(options.resolve().unwrap_err().code(), "OPTION_ERROR");
    }
}
