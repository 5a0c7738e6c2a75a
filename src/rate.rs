//! Fixed-window admission, evaluated per model at the top of every attempt.
//! The updated window is persisted before the upstream call begins.

use crate::error::GaleError;
use crate::registry::{ModelKey, ModelRegistry, RateWindow};
use crate::time::now_ms;

/// Admit one request against the model's window, or refuse with the number
/// of whole seconds until the window rolls over.
pub(crate) async fn admit(registry: &ModelRegistry, key: &ModelKey) -> Result<(), GaleError> {
    let Some(settings) = registry.settings(key) else {
        return Err(GaleError::NoModelsAvailable);
    };

    let current = registry.record(key).await?.map(|r| r.rate_limit).unwrap_or_default();
    let now = now_ms();

    let next = if now.saturating_sub(current.window_start) >= settings.rate_window_ms {
        RateWindow { count: 1, window_start: now }
    } else if current.count >= settings.rate_max {
        let remaining_ms = current
            .window_start
            .saturating_add(settings.rate_window_ms)
            .saturating_sub(now);
        return Err(GaleError::RateLimit {
            model: key.to_string(),
            wait_seconds: remaining_ms.div_ceil(1_000),
        });
    } else {
        RateWindow { count: current.count + 1, window_start: current.window_start }
    };

    registry.update_rate_limit(key, next).await
}
