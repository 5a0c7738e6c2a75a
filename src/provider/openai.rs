//! Reference adapter for OpenAI-compatible chat-completion endpoints
//! (OpenAI, DeepSeek, and most gateway proxies speak this shape). Upstream
//! SSE frames are translated into the engine's canonical `content`/`end`/
//! `error` frames; the pipeline never sees provider-specific JSON.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::codec;
use crate::error::GaleError;
use crate::event::Event;
use crate::provider::{
    ChunkTransform, ContentResponse, Provider, ProviderReply, ProviderRequestOptions,
    check_content, result_from_finish_reason,
};

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_DEEPSEEK_URL: &str = "https://api.deepseek.com/chat/completions";

/// Default endpoint for a configured provider name, when one is known.
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some(DEFAULT_OPENAI_URL),
        "deepseek" => Some(DEFAULT_DEEPSEEK_URL),
        _ => None,
    }
}

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

/// Streaming chunk from a chat-completions SSE stream.
#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Unary chat-completions response body.
#[derive(Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Upstream error body, `{"error": {"message", "type", "code"}}`.
#[derive(Deserialize, Default)]
struct UpstreamError {
    #[serde(default)]
    error: UpstreamErrorBody,
}

#[derive(Deserialize, Default)]
struct UpstreamErrorBody {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self { client, base_url: base_url.into(), api_key: api_key.into() }
    }

    fn build_body(
        &self,
        model: &str,
        prompt: &str,
        options: &ProviderRequestOptions,
    ) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(context) = &options.context {
            messages.push(serde_json::json!({"role": "system", "content": context}));
        }
        for exchange in &options.history {
            messages.push(serde_json::json!({"role": "user", "content": exchange.prompt}));
            messages.push(serde_json::json!({"role": "assistant", "content": exchange.response}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": options.stream,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn classify_failure(&self, model: &str, response: reqwest::Response) -> GaleError {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let wait_seconds = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return GaleError::RateLimit { model: model.to_string(), wait_seconds };
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: UpstreamError = serde_json::from_str(&body).unwrap_or_default();
        let detail = parsed
            .error
            .message
            .unwrap_or_else(|| body.chars().take(200).collect());

        let quota = [parsed.error.kind.as_deref(), parsed.error.code.as_deref()]
            .into_iter()
            .flatten()
            .any(|v| v.contains("insufficient_quota") || v.contains("quota"));
        if quota {
            return GaleError::ExceededQuota { message: detail };
        }

        GaleError::ProviderResponse { message: format!("{status}: {detail}") }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn request(
        &self,
        model: &str,
        prompt: &str,
        options: &ProviderRequestOptions,
    ) -> Result<ProviderReply, GaleError> {
        let body = self.build_body(model, prompt, options);

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GaleError::ProviderResponse { message: e.to_string() })?;

        if !response.status().is_success() {
            return Err(self.classify_failure(model, response).await);
        }

        if options.stream {
            return Ok(ProviderReply::Stream(translate_stream(
                response,
                options.on_stream_chunk.clone(),
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| GaleError::ProviderResponse { message: format!("bad body: {e}") })?;
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(GaleError::ProviderResponse { message: "no choices in response".into() });
        };

        let text = choice.message.content.unwrap_or_default();
        let result = result_from_finish_reason(choice.finish_reason.as_deref());
        check_content(&text, result)?;
        Ok(ProviderReply::Content(ContentResponse { text, result }))
    }
}

type UpstreamEvents = futures_util::stream::BoxStream<
    'static,
    Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>,
>;

struct TranslateState {
    upstream: UpstreamEvents,
    on_chunk: Option<ChunkTransform>,
    pending: VecDeque<Bytes>,
    finished: bool,
}

/// Translate an upstream chat-completions SSE stream into canonical frames:
/// every text delta becomes a `content` frame, the finish reason becomes the
/// `end` frame, and a transport failure becomes an `error` frame.
fn translate_stream(
    response: reqwest::Response,
    on_chunk: Option<ChunkTransform>,
) -> crate::provider::FrameStream {
    let state = TranslateState {
        upstream: response.bytes_stream().eventsource().boxed(),
        on_chunk,
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(upstream_event)) => {
                    if upstream_event.data.trim() == "[DONE]" {
                        state.finished = true;
                        continue;
                    }
                    let Ok(chunk) = serde_json::from_str::<StreamChunk>(&upstream_event.data)
                    else {
                        // Keepalives and metadata events carry no delta.
                        continue;
                    };
                    let Some(choice) = chunk.choices.first() else {
                        continue;
                    };

                    if let Some(text) = choice.delta.content.as_ref().filter(|t| !t.is_empty()) {
                        let text = match &state.on_chunk {
                            Some(transform) => transform(text.clone()),
                            None => text.clone(),
                        };
                        state.pending.push_back(codec::encode(&Event::response(0, text)));
                    }
                    if let Some(reason) = choice.finish_reason.as_deref() {
                        let result = result_from_finish_reason(Some(reason));
                        state.pending.push_back(codec::encode(&Event::end(0, result)));
                        state.finished = true;
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(codec::encode(&Event::error(
                        0,
                        "PROVIDER_STREAM_ERROR",
                        e.to_string(),
                    )));
                }
                None => {
                    // Upstream closed without [DONE]; the pipeline synthesizes
                    // the terminator.
                    state.finished = true;
                }
            }
        }
    }))
}
