use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a generated response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "INCOMPLETE_MAX_TOKENS")]
    IncompleteMaxTokens,
    #[serde(rename = "INCOMPLETE_UNKNOWN")]
    IncompleteUnknown,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::IncompleteMaxTokens => "INCOMPLETE_MAX_TOKENS",
            Self::IncompleteUnknown => "INCOMPLETE_UNKNOWN",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "COMPLETE" => Self::Complete,
            "INCOMPLETE_MAX_TOKENS" => Self::IncompleteMaxTokens,
            _ => Self::IncompleteUnknown,
        }
    }
}

/// Which side of the conversation a content event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSource {
    Prompt,
    Response,
}

/// Payload of a session event. The variant decides the wire event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum EventData {
    Content { source: ContentSource, text: String },
    End { result: ResultCode },
    Error { code: String, message: String },
}

impl EventData {
    /// Wire event name: `content`, `end`, or `error`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::End { .. } => "end",
            Self::Error { .. } => "error",
        }
    }
}

/// A single immutable record in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Milliseconds since the Unix epoch, assigned at append time.
    pub timestamp: u64,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn new(timestamp: u64, data: EventData) -> Self {
        Self { id: Uuid::new_v4(), timestamp, data }
    }

    pub fn with_id(id: Uuid, timestamp: u64, data: EventData) -> Self {
        Self { id, timestamp, data }
    }

    pub fn prompt(timestamp: u64, text: impl Into<String>) -> Self {
        Self::new(timestamp, EventData::Content { source: ContentSource::Prompt, text: text.into() })
    }

    pub fn response(timestamp: u64, text: impl Into<String>) -> Self {
        Self::new(
            timestamp,
            EventData::Content { source: ContentSource::Response, text: text.into() },
        )
    }

    pub fn end(timestamp: u64, result: ResultCode) -> Self {
        Self::new(timestamp, EventData::End { result })
    }

    pub fn error(timestamp: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(timestamp, EventData::Error { code: code.into(), message: message.into() })
    }

    pub fn is_prompt(&self) -> bool {
        matches!(self.data, EventData::Content { source: ContentSource::Prompt, .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.data, EventData::Content { source: ContentSource::Response, .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.data, EventData::End { .. } | EventData::Error { .. })
    }
}

/// Fresh UUIDv4 for a new event.
pub fn event_id() -> Uuid {
    Uuid::new_v4()
}
