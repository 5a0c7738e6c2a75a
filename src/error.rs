use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason attached to a model's error state. Drives the restore window that
/// gates when the model may be selected again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    #[serde(rename = "PROVIDER_RATE_LIMIT_ERROR")]
    RateLimit,
    #[serde(rename = "PROVIDER_REQUEST_TIMEOUT_ERROR")]
    RequestTimeout,
    #[serde(rename = "PROVIDER_REQUEST_STREAM_TIMEOUT_ERROR")]
    StreamTimeout,
    #[serde(rename = "PROVIDER_RESPONSE_ERROR")]
    Response,
    #[serde(rename = "PROVIDER_RESPONSE_NO_CONTENT")]
    NoContent,
    #[serde(rename = "PROVIDER_EXCEEDED_QUOTA_ERROR")]
    ExceededQuota,
    #[serde(rename = "PROVIDER_RESPONSE_MAX_TOKENS_ERROR")]
    MaxTokens,
}

impl ErrorReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimit => "PROVIDER_RATE_LIMIT_ERROR",
            Self::RequestTimeout => "PROVIDER_REQUEST_TIMEOUT_ERROR",
            Self::StreamTimeout => "PROVIDER_REQUEST_STREAM_TIMEOUT_ERROR",
            Self::Response => "PROVIDER_RESPONSE_ERROR",
            Self::NoContent => "PROVIDER_RESPONSE_NO_CONTENT",
            Self::ExceededQuota => "PROVIDER_EXCEEDED_QUOTA_ERROR",
            Self::MaxTokens => "PROVIDER_RESPONSE_MAX_TOKENS_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("invalid option: {0}")]
    Option(String),

    #[error("failed to load history for session {session}: {message}")]
    HistoryGet { session: String, message: String },

    #[error("no models available to serve the request")]
    NoModelsAvailable,

    #[error("rate limit exceeded for {model}, retry in {wait_seconds}s")]
    RateLimit { model: String, wait_seconds: u64 },

    #[error("provider request timed out after {0}ms")]
    RequestTimeout(u64),

    #[error("provider stream stalled for {0}ms")]
    StreamTimeout(u64),

    #[error("provider response error: {message}")]
    ProviderResponse { message: String },

    #[error("provider returned a completed response with no content")]
    NoContent,

    #[error("provider hit the token limit before producing content")]
    MaxTokens,

    #[error("provider quota exceeded: {message}")]
    ExceededQuota { message: String },

    #[error("provider stream error {code}: {message}")]
    StreamError { code: String, message: String },

    #[error("provider stream ended before the response completed")]
    RequestEnd,

    #[error("storage read failed: {0}")]
    StorageGet(String),

    #[error("storage write failed: {0}")]
    StorageSet(String),

    #[error("storage subscription failed: {0}")]
    StorageSubscribe(String),

    #[error("storage close failed: {0}")]
    StorageClose(String),

    #[error("unparseable time window: {0}")]
    InvalidTimeWindowFormat(String),
}

impl GaleError {
    /// Stable string constant for this error, suitable for wire payloads
    /// and for matching on the consumer side.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Option(_) => "OPTION_ERROR",
            Self::HistoryGet { .. } => "HISTORY_GET_ERROR",
            Self::NoModelsAvailable => "PROVIDER_NO_MODELS_AVAILABLE_ERROR",
            Self::RateLimit { .. } => "PROVIDER_RATE_LIMIT_ERROR",
            Self::RequestTimeout(_) => "PROVIDER_REQUEST_TIMEOUT_ERROR",
            Self::StreamTimeout(_) => "PROVIDER_REQUEST_STREAM_TIMEOUT_ERROR",
            Self::ProviderResponse { .. } => "PROVIDER_RESPONSE_ERROR",
            Self::NoContent => "PROVIDER_RESPONSE_NO_CONTENT",
            Self::MaxTokens => "PROVIDER_RESPONSE_MAX_TOKENS_ERROR",
            Self::ExceededQuota { .. } => "PROVIDER_EXCEEDED_QUOTA_ERROR",
            Self::StreamError { .. } => "PROVIDER_STREAM_ERROR",
            Self::RequestEnd => "PROVIDER_REQUEST_END_ERROR",
            Self::StorageGet(_) => "STORAGE_GET_ERROR",
            Self::StorageSet(_) => "STORAGE_SET_ERROR",
            Self::StorageSubscribe(_) => "STORAGE_SUBSCRIBE_ERROR",
            Self::StorageClose(_) => "STORAGE_CLOSE_ERROR",
            Self::InvalidTimeWindowFormat(_) => "INVALID_TIME_WINDOW_FORMAT_ERROR",
        }
    }

    /// True for errors that are retried in place on the same model before
    /// any fallback happens.
    pub fn retryable_same_model(&self) -> bool {
        matches!(self, Self::ProviderResponse { .. } | Self::StreamError { .. })
    }

    /// The model-state reason this error maps to, when it is one of the
    /// state-updating errors. Errors with no reason never mark a model.
    pub fn reason(&self) -> Option<ErrorReason> {
        match self {
            Self::RateLimit { .. } => Some(ErrorReason::RateLimit),
            Self::RequestTimeout(_) => Some(ErrorReason::RequestTimeout),
            Self::StreamTimeout(_) => Some(ErrorReason::StreamTimeout),
            Self::ProviderResponse { .. } => Some(ErrorReason::Response),
            Self::NoContent => Some(ErrorReason::NoContent),
            Self::ExceededQuota { .. } => Some(ErrorReason::ExceededQuota),
            Self::MaxTokens => Some(ErrorReason::MaxTokens),
            _ => None,
        }
    }
}
