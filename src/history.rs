//! Append-only session history over the store, plus the compaction that
//! turns a raw event log (including partial, errored, and resumed streams)
//! into a deterministic chat transcript for providers.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::GaleError;
use crate::event::{ContentSource, Event, EventData};
use crate::store::{Store, Subscription};

/// One completed prompt/response turn handed to a provider as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatExchange {
    pub prompt: String,
    pub response: String,
}

/// Session history bound to a store and a TTL. Every append refreshes the
/// whole session's expiration.
pub struct History {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl History {
    pub fn new(store: Arc<dyn Store>, ttl_ms: u64) -> Self {
        Self { store, ttl: Duration::from_millis(ttl_ms) }
    }

    /// Append one event, refreshing the session TTL and optionally fanning
    /// out to subscribers.
    pub async fn push(&self, session: &str, event: &Event, publish: bool) -> Result<(), GaleError> {
        let value = serde_json::to_value(event)
            .map_err(|e| GaleError::StorageSet(format!("event {}: {e}", event.id)))?;
        self.store.hash_set(session, &event.id.to_string(), value, self.ttl, publish).await
    }

    /// All events of a session, sorted by timestamp. The sort is stable, so
    /// equal timestamps keep their append order.
    pub async fn range(&self, session: &str) -> Result<Vec<Event>, GaleError> {
        let raw = self.store.hash_get_all(session).await?;
        let mut events: Vec<Event> = raw
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(session, event_id = %id, "skipping unreadable event: {e}");
                    None
                }
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    /// The suffix of a session starting at `from_id` inclusive; empty when
    /// the anchor is not present.
    pub async fn range_from_id(&self, session: &str, from_id: Uuid) -> Result<Vec<Event>, GaleError> {
        let events = self.range(session).await?;
        Ok(suffix_from(events, from_id))
    }

    pub async fn subscribe(&self, session: &str) -> Result<EventSubscription, GaleError> {
        Ok(EventSubscription { inner: self.store.subscribe(session).await? })
    }

    pub async fn create_subscription(&self, session: &str) -> Result<(), GaleError> {
        self.store.create_subscription(session).await
    }

    pub async fn remove_subscription(&self, session: &str) -> Result<(), GaleError> {
        self.store.remove_subscription(session).await
    }
}

/// Store subscription surfaced as typed events; values that fail to decode
/// are logged and skipped.
pub struct EventSubscription {
    inner: Subscription,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let value = self.inner.recv().await?;
            match serde_json::from_value(value) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(
                        session = self.inner.session(),
                        "skipping unreadable published event: {e}"
                    );
                }
            }
        }
    }

    /// Already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            let value = self.inner.try_recv()?;
            match serde_json::from_value(value) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(
                        session = self.inner.session(),
                        "skipping unreadable published event: {e}"
                    );
                }
            }
        }
    }
}

pub(crate) fn suffix_from(events: Vec<Event>, from_id: Uuid) -> Vec<Event> {
    match events.iter().position(|e| e.id == from_id) {
        Some(idx) => events.into_iter().skip(idx).collect(),
        None => Vec::new(),
    }
}

/// Compact a raw event log: responses buffer until their exchange terminates;
/// an `end` merges the buffered chunks into one response event and keeps the
/// terminator, an `error` discards them. Prompts always survive. The result
/// is a fixed point: compacting a compacted log changes nothing.
pub fn compact(events: &[Event]) -> Vec<Event> {
    let mut out = Vec::with_capacity(events.len());
    let mut buffer: Vec<&Event> = Vec::new();

    for event in events {
        match &event.data {
            EventData::Content { source: ContentSource::Prompt, .. } => out.push(event.clone()),
            EventData::Content { source: ContentSource::Response, .. } => buffer.push(event),
            EventData::Error { .. } => buffer.clear(),
            EventData::End { .. } => {
                if let Some(first) = buffer.first() {
                    let text: String = buffer
                        .iter()
                        .filter_map(|e| match &e.data {
                            EventData::Content { text, .. } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    out.push(Event::with_id(
                        first.id,
                        first.timestamp,
                        EventData::Content { source: ContentSource::Response, text },
                    ));
                    buffer.clear();
                }
                out.push(event.clone());
            }
        }
    }
    // A trailing unterminated buffer belongs to an exchange still in flight;
    // it never enters the transcript.
    out
}

/// Pair a compacted log into prompt/response exchanges for provider context.
pub fn pair(events: &[Event]) -> Vec<ChatExchange> {
    let mut out = Vec::new();
    let mut last_prompt: Option<&str> = None;
    let mut last_response: Option<&str> = None;

    for event in events {
        match &event.data {
            EventData::Content { source: ContentSource::Prompt, text } => {
                last_prompt = Some(text);
            }
            EventData::Content { source: ContentSource::Response, text } => {
                last_response = Some(text);
            }
            _ => {}
        }
        if let (Some(prompt), Some(response)) = (last_prompt, last_response) {
            out.push(ChatExchange { prompt: prompt.to_string(), response: response.to_string() });
            last_prompt = None;
            last_response = None;
        }
    }
    out
}

/// Chat transcript of a raw log: compaction followed by pairing.
pub fn transcript(events: &[Event]) -> Vec<ChatExchange> {
    pair(&compact(events))
}

/// The prompt event of the last incomplete exchange, if the log ends
/// mid-exchange. This is the anchor a resumed stream continues from.
pub fn prompt_event(events: &[Event]) -> Option<&Event> {
    let mut open_prompt: Option<&Event> = None;
    for event in events {
        match &event.data {
            EventData::Content { source: ContentSource::Prompt, .. } => {
                open_prompt = Some(event);
            }
            EventData::End { .. } | EventData::Error { .. } => open_prompt = None,
            _ => {}
        }
    }
    open_prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResultCode;

    fn log_complete() -> Vec<Event> {
        vec![
            Event::prompt(1, "P1"),
            Event::response(2, "Hello "),
            Event::response(3, "world"),
            Event::end(4, ResultCode::Complete),
        ]
    }

    #[test]
    fn compact_merges_chunks_and_keeps_terminator() {
        let compacted = compact(&log_complete());
        assert_eq!(compacted.len(), 3);
        assert!(compacted[0].is_prompt());
        assert_eq!(
            compacted[1].data,
            EventData::Content { source: ContentSource::Response, text: "Hello world".into() }
        );
        assert_eq!(compacted[2].data, EventData::End { result: ResultCode::Complete });
    }

    #[test]
    fn compact_discards_errored_exchange_responses() {
        let events = vec![
            Event::prompt(1, "P1"),
            Event::response(2, "partial"),
            Event::error(3, "PROVIDER_STREAM_ERROR", "boom"),
            Event::prompt(4, "P2"),
            Event::response(5, "ok"),
            Event::end(6, ResultCode::Complete),
        ];
        let transcript = transcript(&events);
        assert_eq!(
            transcript,
            vec![ChatExchange { prompt: "P2".into(), response: "ok".into() }]
        );
    }

    #[test]
    fn compact_drops_trailing_unterminated_responses() {
        let events =
            vec![Event::prompt(1, "P1"), Event::response(2, "still "), Event::response(3, "going")];
        let compacted = compact(&events);
        assert_eq!(compacted.len(), 1);
        assert!(compacted[0].is_prompt());
    }

    #[test]
    fn compact_is_idempotent() {
        let logs = vec![
            log_complete(),
            vec![
                Event::prompt(1, "P1"),
                Event::response(2, "a"),
                Event::error(3, "X", "y"),
                Event::prompt(4, "P2"),
                Event::response(5, "b"),
                Event::end(6, ResultCode::IncompleteMaxTokens),
                Event::prompt(7, "P3"),
                Event::response(8, "dangling"),
            ],
            Vec::new(),
        ];
        for log in logs {
            let once = compact(&log);
            let twice = compact(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn pairing_builds_exchanges() {
        let events = vec![
            Event::prompt(1, "P1"),
            Event::response(2, "R1"),
            Event::end(3, ResultCode::Complete),
            Event::prompt(4, "P2"),
            Event::response(5, "R2"),
            Event::end(6, ResultCode::Complete),
        ];
        assert_eq!(
            transcript(&events),
            vec![
                ChatExchange { prompt: "P1".into(), response: "R1".into() },
                ChatExchange { prompt: "P2".into(), response: "R2".into() },
            ]
        );
    }

    #[test]
    fn prompt_event_finds_last_incomplete_exchange() {
        let mut events = log_complete();
        assert!(prompt_event(&events).is_none());

        let open = Event::prompt(9, "P2");
        let open_id = open.id;
        events.push(open);
        events.push(Event::response(10, "part"));
        assert_eq!(prompt_event(&events).unwrap().id, open_id);
    }

    #[tokio::test]
    async fn push_range_and_suffix_through_the_store() {
        use crate::store::memory::MemoryStore;

        let store = std::sync::Arc::new(MemoryStore::new());
        let history = History::new(store, 60_000);

        let events = log_complete();
        for event in &events {
            history.push("s", event, false).await.unwrap();
        }

        let read = history.range("s").await.unwrap();
        assert_eq!(read, events);

        let suffix = history.range_from_id("s", events[1].id).await.unwrap();
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix[0].id, events[1].id);

        assert!(history.range_from_id("s", Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn suffix_from_anchors_inclusively() {
        let events = log_complete();
        let anchor = events[1].id;
        let suffix = suffix_from(events.clone(), anchor);
        assert_eq!(suffix.len(), 3);
        assert_eq!(suffix[0].id, anchor);

        assert!(suffix_from(events, Uuid::new_v4()).is_empty());
    }
}
