//! Uniform contract over heterogeneous upstreams. The pipeline only sees
//! this trait: a unary call returns finished text with a result code, a
//! streaming call returns a finite, non-restartable sequence of SSE frames
//! carrying `content` events and exactly one `end` or `error` terminator.

pub mod openai;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::GaleError;
use crate::event::ResultCode;
use crate::history::ChatExchange;

/// SSE frames produced by a streaming provider call.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes, GaleError>> + Send>>;

/// Hook applied to each streamed text chunk before it is framed.
pub type ChunkTransform = Arc<dyn Fn(String) -> String + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProviderRequestOptions {
    /// System instruction text.
    pub context: Option<String>,
    /// Prior completed exchanges, oldest first.
    pub history: Vec<ChatExchange>,
    pub temperature: Option<f64>,
    pub stream: bool,
    pub max_tokens: Option<u64>,
    pub on_stream_chunk: Option<ChunkTransform>,
}

impl fmt::Debug for ProviderRequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRequestOptions")
            .field("context", &self.context)
            .field("history_len", &self.history.len())
            .field("temperature", &self.temperature)
            .field("stream", &self.stream)
            .field("max_tokens", &self.max_tokens)
            .field("on_stream_chunk", &self.on_stream_chunk.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentResponse {
    pub text: String,
    pub result: ResultCode,
}

pub enum ProviderReply {
    Content(ContentResponse),
    Stream(FrameStream),
}

impl std::fmt::Debug for ProviderReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderReply::Content(c) => f.debug_tuple("Content").field(c).finish(),
            ProviderReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn init(&self) -> Result<(), GaleError> {
        Ok(())
    }

    async fn request(
        &self,
        model: &str,
        prompt: &str,
        options: &ProviderRequestOptions,
    ) -> Result<ProviderReply, GaleError>;

    async fn close(&self) -> Result<(), GaleError> {
        Ok(())
    }
}

/// Map an upstream finish reason onto a result code.
pub fn result_from_finish_reason(reason: Option<&str>) -> ResultCode {
    match reason {
        Some("stop") => ResultCode::Complete,
        Some("length" | "max_tokens" | "MAX_TOKENS") => ResultCode::IncompleteMaxTokens,
        _ => ResultCode::IncompleteUnknown,
    }
}

/// Empty-content rules for unary responses: a completed reply with no text
/// is a provider fault, and an empty max-tokens reply means the cap left no
/// room for content at all.
pub fn check_content(text: &str, result: ResultCode) -> Result<(), GaleError> {
    if !text.is_empty() {
        return Ok(());
    }
    match result {
        ResultCode::Complete => Err(GaleError::NoContent),
        ResultCode::IncompleteMaxTokens => Err(GaleError::MaxTokens),
        ResultCode::IncompleteUnknown => Ok(()),
    }
}
