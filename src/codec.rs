//! SSE-style event framing between the engine, providers, and clients.
//!
//! Wire form: `id: <uuid>\nevent: <name>\n[type: prompt\n]data: <json>\n\n`.
//! The decoder is tolerant: it accepts comment lines, multi-line `data:`,
//! CRLF endings, field lines without a colon, and a trailing event that is
//! missing its terminating blank line. Malformed JSON payloads are logged
//! and skipped without halting the stream.

use bytes::Bytes;
use uuid::Uuid;

use crate::event::{ContentSource, Event, EventData, ResultCode, event_id};

/// Encode an event into its SSE wire form.
pub fn encode(event: &Event) -> Bytes {
    let data = match &event.data {
        EventData::Content { source: ContentSource::Prompt, text } => {
            serde_json::json!({ "prompt": text })
        }
        EventData::Content { source: ContentSource::Response, text } => {
            serde_json::json!({ "response": text })
        }
        EventData::End { result } => serde_json::json!({ "response": result.as_str() }),
        EventData::Error { code, message } => {
            serde_json::json!({ "code": code, "message": message })
        }
    };

    let mut out = String::with_capacity(96);
    out.push_str("id: ");
    out.push_str(&event.id.to_string());
    out.push_str("\nevent: ");
    out.push_str(event.data.name());
    if event.is_prompt() {
        out.push_str("\ntype: prompt");
    }
    out.push_str("\ndata: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
    Bytes::from(out)
}

/// One partially-assembled SSE frame.
#[derive(Default)]
struct RawFrame {
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    ty: Option<String>,
    seen_field: bool,
}

impl RawFrame {
    fn apply(&mut self, name: &str, value: &str) {
        match name {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "type" => self.ty = Some(value.to_string()),
            // Recognized reconnection hint; the engine has no use for it.
            "retry" => {}
            _ => {} // unknown field, ignored
        }
        self.seen_field = true;
    }
}

/// Incremental SSE decoder. Feed arbitrary byte chunks; complete events come
/// out as they are terminated. `finish` flushes a trailing unterminated event.
#[derive(Default)]
pub struct SseDecoder {
    pending: String,
    frame: RawFrame,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut out = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.take_line(line) {
                out.push(event);
            }
        }
        out
    }

    /// Flush a trailing event that was never terminated by a blank line.
    pub fn finish(&mut self) -> Option<Event> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            if let Some(event) = self.take_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        if self.frame.seen_field {
            return assemble(std::mem::take(&mut self.frame));
        }
        None
    }

    fn take_line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            if self.frame.seen_field {
                return assemble(std::mem::take(&mut self.frame));
            }
            return None;
        }
        if line.starts_with(':') {
            return None; // comment
        }

        match line.split_once(':') {
            Some((name, value)) => {
                self.frame.apply(name, value.strip_prefix(' ').unwrap_or(value));
            }
            // A line without a colon is a field name with an empty value.
            None => self.frame.apply(line, ""),
        }
        None
    }
}

/// One-shot decode of a whole buffer, including any trailing event.
pub fn decode(bytes: &[u8]) -> Vec<Event> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(bytes);
    events.extend(decoder.finish());
    events
}

/// Turn a completed frame into a typed event. Returns `None` (after logging)
/// when the payload is malformed; the surrounding stream keeps going.
fn assemble(frame: RawFrame) -> Option<Event> {
    let id = frame
        .id
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .unwrap_or_else(event_id);
    let data = frame.data.join("\n");
    let name = frame.event.as_deref().unwrap_or("message");

    let payload = match name {
        "content" => {
            let json: serde_json::Value = match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(event = name, "skipping content event with bad payload: {e}");
                    return None;
                }
            };
            let prompt_typed = frame.ty.as_deref() == Some("prompt");
            if prompt_typed || json.get("prompt").is_some() {
                let Some(text) = json.get("prompt").or_else(|| json.get("response")) else {
                    tracing::warn!("skipping prompt content event with no text");
                    return None;
                };
                EventData::Content {
                    source: ContentSource::Prompt,
                    text: text.as_str().unwrap_or_default().to_string(),
                }
            } else if let Some(text) = json.get("response").and_then(|v| v.as_str()) {
                EventData::Content { source: ContentSource::Response, text: text.to_string() }
            } else {
                tracing::warn!("skipping content event with no prompt or response field");
                return None;
            }
        }
        "end" => {
            if data.is_empty() {
                EventData::End { result: ResultCode::IncompleteUnknown }
            } else {
                match serde_json::from_str::<serde_json::Value>(&data) {
                    Ok(json) => EventData::End {
                        result: json
                            .get("response")
                            .and_then(|v| v.as_str())
                            .map(ResultCode::from_str_lossy)
                            .unwrap_or(ResultCode::IncompleteUnknown),
                    },
                    Err(e) => {
                        tracing::warn!("skipping end event with bad payload: {e}");
                        return None;
                    }
                }
            }
        }
        "error" => match serde_json::from_str::<serde_json::Value>(&data) {
            Ok(json) => EventData::Error {
                code: json
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or("PROVIDER_STREAM_ERROR")
                    .to_string(),
                message: json
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            Err(e) => {
                tracing::warn!("skipping error event with bad payload: {e}");
                return None;
            }
        },
        other => {
            tracing::debug!(event = other, "ignoring unrecognized event");
            return None;
        }
    };

    // Decoded events are re-stamped when they are appended to a session.
    Some(Event::with_id(id, 0, payload))
}
