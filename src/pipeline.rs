//! The request pipeline: model selection, rate-limit admission, provider
//! calls with retry and fallback, stream piping into history and out to the
//! caller, and session resume. One pipeline instance is shared by every
//! request an engine serves; per-request state lives on the stack of `run`
//! and, for streams, in a spawned driver task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::codec::SseDecoder;
use crate::config::ResolvedLimits;
use crate::error::GaleError;
use crate::event::{ContentSource, Event, EventData, ResultCode};
use crate::history::{self, ChatExchange, EventSubscription, History};
use crate::provider::{
    ChunkTransform, FrameStream, Provider, ProviderReply, ProviderRequestOptions,
};
use crate::rate;
use crate::registry::{ModelKey, ModelRegistry, ModelState, ModelStatus};
use crate::stream::{self, ResponseStream, StreamSender};
use crate::time::now_ms;
use crate::timeout::{TimeoutStream, with_timeout};

/// What a resumed stream replays: just the anchored exchange's responses, or
/// every completed exchange from the anchor forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamResponseType {
    #[default]
    Content,
    Session,
}

#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Continue an existing session. Mutually exclusive with `history`.
    pub session_id: Option<String>,
    /// Inline chat history passed verbatim to the provider. Mutually
    /// exclusive with `session_id`.
    pub history: Option<Vec<ChatExchange>>,
    /// Resume anchor; requires `session_id` and `stream`.
    pub resume_event_id: Option<String>,
    /// System instruction text.
    pub context: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Return a live event stream instead of a completed response.
    pub stream: bool,
    pub stream_response_type: StreamResponseType,
    /// Per-chunk transform applied by the adapter as text arrives.
    pub on_stream_chunk: Option<ChunkTransform>,
}

#[derive(Clone, Default)]
pub struct Request {
    pub prompt: Option<String>,
    /// Candidate models in priority order as `provider:name`. Empty means
    /// every configured model, in configuration order.
    pub models: Vec<String>,
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentResult {
    pub text: String,
    pub result: ResultCode,
    pub session_id: String,
}

#[derive(Debug)]
pub enum EngineResponse {
    Content(ContentResult),
    Stream(ResponseStream),
}

pub(crate) struct Pipeline {
    pub(crate) providers: HashMap<String, Arc<dyn Provider>>,
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) history: Arc<History>,
    pub(crate) limits: ResolvedLimits,
}

impl Pipeline {
    pub async fn run(self: &Arc<Self>, request: Request) -> Result<EngineResponse, GaleError> {
        self.validate(&request)?;

        let (session_id, stored) = match &request.options.session_id {
            Some(sid) => {
                let events = self.history.range(sid).await.map_err(|e| GaleError::HistoryGet {
                    session: sid.clone(),
                    message: e.to_string(),
                })?;
                if events.is_empty() {
                    return Err(GaleError::Option(format!("session {sid} has no history")));
                }
                (sid.clone(), events)
            }
            None => (Uuid::new_v4().to_string(), Vec::new()),
        };

        let candidates = self.candidates(&request);

        if request.options.stream {
            self.run_streaming(request, session_id, stored, candidates)
        } else {
            self.run_unary(request, session_id, stored, candidates).await
        }
    }

    fn validate(&self, request: &Request) -> Result<(), GaleError> {
        let options = &request.options;
        if options.history.is_some() && options.session_id.is_some() {
            return Err(GaleError::Option(
                "history and session_id are mutually exclusive".into(),
            ));
        }
        if options.resume_event_id.is_some() {
            if options.session_id.is_none() {
                return Err(GaleError::Option("resume_event_id requires session_id".into()));
            }
            if !options.stream {
                return Err(GaleError::Option("resume_event_id requires stream".into()));
            }
        }
        if request.prompt.is_none() && options.resume_event_id.is_none() {
            return Err(GaleError::Option("prompt is required".into()));
        }
        for raw in &request.models {
            let key = ModelKey::parse(raw)
                .ok_or_else(|| GaleError::Option(format!("malformed model name: {raw}")))?;
            if !self.registry.contains(&key) {
                return Err(GaleError::Option(format!("model {raw} is not configured")));
            }
        }
        Ok(())
    }

    fn candidates(&self, request: &Request) -> Vec<ModelKey> {
        if request.models.is_empty() {
            self.registry.candidates().to_vec()
        } else {
            // Validation already proved every entry parses.
            request.models.iter().filter_map(|raw| ModelKey::parse(raw)).collect()
        }
    }

    /// Walk the candidates in order and pick the first usable model. An
    /// errored model whose restore window has elapsed is optimistically
    /// flipped back to ready and selected.
    async fn select_model(
        &self,
        candidates: &[ModelKey],
        skip: &HashSet<ModelKey>,
    ) -> Result<Option<ModelKey>, GaleError> {
        for key in candidates {
            if skip.contains(key) || !self.providers.contains_key(&key.provider) {
                continue;
            }
            let Some(record) = self.registry.record(key).await? else {
                continue;
            };
            match record.state.status {
                ModelStatus::Ready => return Ok(Some(key.clone())),
                ModelStatus::Error => {
                    if self.registry.restore_elapsed(key, &record.state) {
                        self.registry.set_model_state(key, ModelState::ready(now_ms())).await?;
                        tracing::info!(model = %key, "restoring errored model to ready");
                        return Ok(Some(key.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// One model attempt: admission, provider call under the request timer,
    /// and in-place retries for transient errors.
    async fn attempt_model(
        &self,
        key: &ModelKey,
        prompt: &str,
        options: &ProviderRequestOptions,
    ) -> Result<ProviderReply, GaleError> {
        let provider = self.providers.get(&key.provider).ok_or(GaleError::NoModelsAvailable)?;
        let settings = self.registry.settings(key).ok_or(GaleError::NoModelsAvailable)?;

        let mut options = options.clone();
        options.max_tokens =
            settings.max_tokens.or(options.max_tokens).or(self.limits.max_tokens);

        let mut attempt = 0u32;
        loop {
            rate::admit(&self.registry, key).await?;

            match with_timeout(
                provider.request(&key.name, prompt, &options),
                self.limits.request_timeout_ms,
            )
            .await
            {
                Ok(reply) => return Ok(reply),
                Err(err) if err.retryable_same_model() && attempt < self.limits.retry_max => {
                    attempt += 1;
                    tracing::warn!(
                        model = %key,
                        attempt,
                        "retrying after transient provider error: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(self.limits.retry_interval_ms)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Attempt the current selection; on a state-updating failure, mark the
    /// model, extend the skip set, and move to the next candidate. The last
    /// error propagates once no candidate remains.
    async fn call_with_failover(
        &self,
        candidates: &[ModelKey],
        skip: &mut HashSet<ModelKey>,
        prompt: &str,
        options: &ProviderRequestOptions,
    ) -> Result<(ModelKey, ProviderReply), GaleError> {
        let mut current = self
            .select_model(candidates, skip)
            .await?
            .ok_or(GaleError::NoModelsAvailable)?;

        loop {
            match self.attempt_model(&current, prompt, options).await {
                Ok(reply) => return Ok((current, reply)),
                Err(err) => {
                    let Some(reason) = err.reason() else {
                        return Err(err);
                    };
                    if let Err(e) = self.registry.mark_error(&current, reason, now_ms()).await {
                        tracing::warn!(model = %current, "failed to mark model state: {e}");
                    }
                    skip.insert(current.clone());
                    match self.select_model(candidates, skip).await? {
                        Some(next) => {
                            tracing::info!(
                                from = %current,
                                to = %next,
                                code = err.code(),
                                "falling back to next model"
                            );
                            current = next;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    async fn run_unary(
        &self,
        request: Request,
        session_id: String,
        stored: Vec<Event>,
        candidates: Vec<ModelKey>,
    ) -> Result<EngineResponse, GaleError> {
        let prompt = request.prompt.clone().unwrap_or_default();
        let chat_history = match &request.options.history {
            Some(inline) => inline.clone(),
            None => history::transcript(&stored),
        };
        let options = ProviderRequestOptions {
            context: request.options.context.clone(),
            history: chat_history,
            temperature: request.options.temperature,
            stream: false,
            max_tokens: request.options.max_tokens,
            on_stream_chunk: None,
        };

        let mut skip = HashSet::new();
        let (model, reply) =
            self.call_with_failover(&candidates, &mut skip, &prompt, &options).await?;
        let content = match reply {
            ProviderReply::Content(content) => content,
            ProviderReply::Stream(_) => {
                return Err(GaleError::ProviderResponse {
                    message: format!("{model} returned a stream for a unary request"),
                });
            }
        };

        // History writes are best-effort; the response is already in hand.
        let now = now_ms();
        let events = [
            Event::prompt(now, prompt),
            Event::response(now, content.text.clone()),
            Event::end(now, content.result),
        ];
        for event in &events {
            if let Err(e) = self.history.push(&session_id, event, true).await {
                tracing::warn!(session = %session_id, "failed to append history event: {e}");
                break;
            }
        }

        Ok(EngineResponse::Content(ContentResult {
            text: content.text,
            result: content.result,
            session_id,
        }))
    }

    fn run_streaming(
        self: &Arc<Self>,
        request: Request,
        session_id: String,
        stored: Vec<Event>,
        candidates: Vec<ModelKey>,
    ) -> Result<EngineResponse, GaleError> {
        let resume = match &request.options.resume_event_id {
            Some(raw) => {
                let anchor = Uuid::parse_str(raw)
                    .map_err(|_| GaleError::Option(format!("malformed resume event id: {raw}")))?;
                let suffix = history::suffix_from(stored, anchor);
                if suffix.is_empty() {
                    return Err(GaleError::Option(format!(
                        "resume event {raw} not found in session"
                    )));
                }
                Some(suffix)
            }
            None => None,
        };

        let (sender, response) = stream::channel(session_id.clone());
        let driver = Driver {
            pipeline: self.clone(),
            session_id,
            sender,
            candidates,
            inline_history: request.options.history.clone(),
            context: request.options.context.clone(),
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
            on_stream_chunk: request.options.on_stream_chunk.clone(),
            response_type: request.options.stream_response_type,
        };
        tokio::spawn(driver.run(request.prompt, resume));

        Ok(EngineResponse::Stream(response))
    }
}

/// Replayed events plus what the walk learned about the anchored exchange.
#[derive(Debug)]
struct ReplayPlan {
    events: Vec<Event>,
    /// The unterminated exchange's prompt text, when one exists; issuing it
    /// again continues that exchange.
    prompt: Option<String>,
}

/// Content-mode replay: only the anchored exchange's responses. An `end`
/// stops the walk; an `error` drops everything buffered and stops, leaving
/// nothing to continue.
fn replay_content(suffix: &[Event]) -> ReplayPlan {
    let mut events = Vec::new();
    let mut last_prompt: Option<String> = None;

    for event in suffix {
        match &event.data {
            EventData::Content { source: ContentSource::Prompt, text } => {
                last_prompt = Some(text.clone());
            }
            EventData::Content { source: ContentSource::Response, .. } => {
                events.push(event.clone());
            }
            EventData::End { .. } => {
                events.push(event.clone());
                last_prompt = None;
                break;
            }
            EventData::Error { .. } => {
                events.clear();
                last_prompt = None;
                break;
            }
        }
    }

    ReplayPlan { events, prompt: last_prompt }
}

/// Session-mode replay: every well-formed prompt-through-end tuple in the
/// suffix. Error-terminated runs are discarded; a trailing incomplete run is
/// dropped from the replay but its prompt is recovered for continuation.
fn replay_session(suffix: &[Event]) -> ReplayPlan {
    let mut events = Vec::new();
    let mut run: Vec<Event> = Vec::new();
    let mut run_prompt: Option<String> = None;

    for event in suffix {
        match &event.data {
            EventData::Content { source: ContentSource::Prompt, text } => {
                run.clear();
                run.push(event.clone());
                run_prompt = Some(text.clone());
            }
            EventData::Content { source: ContentSource::Response, .. } => {
                if run_prompt.is_some() {
                    run.push(event.clone());
                }
            }
            EventData::End { .. } => {
                if run_prompt.is_some() {
                    run.push(event.clone());
                    events.append(&mut run);
                    run_prompt = None;
                }
            }
            EventData::Error { .. } => {
                run.clear();
                run_prompt = None;
            }
        }
    }

    ReplayPlan { events, prompt: run_prompt }
}

enum PipeOutcome {
    /// The exchange terminated and its terminator reached the caller.
    Done,
    /// The caller dropped the response stream; all work stops.
    ConsumerGone,
    Failed(GaleError),
}

/// Background task that owns one response stream: replays resume events,
/// issues provider requests, pipes upstream frames into history, forwards
/// published events to the caller, and closes or destroys the stream.
struct Driver {
    pipeline: Arc<Pipeline>,
    session_id: String,
    sender: StreamSender,
    candidates: Vec<ModelKey>,
    inline_history: Option<Vec<ChatExchange>>,
    context: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
    on_stream_chunk: Option<ChunkTransform>,
    response_type: StreamResponseType,
}

impl Driver {
    async fn run(self, new_prompt: Option<String>, resume: Option<Vec<Event>>) {
        if let Err(err) = self.run_inner(new_prompt, resume).await {
            tracing::warn!(session = %self.session_id, code = err.code(), "stream failed: {err}");
            let event = Event::error(now_ms(), err.code(), err.to_string());
            if let Err(e) = self.pipeline.history.push(&self.session_id, &event, true).await {
                tracing::warn!(session = %self.session_id, "failed to append error event: {e}");
            }
            self.sender.send_event(&event);
            self.sender.fail(err);
        }
        if let Err(e) = self.pipeline.history.remove_subscription(&self.session_id).await {
            tracing::warn!(session = %self.session_id, "failed to remove subscription: {e}");
        }
        // Dropping self (and with it the last sender) closes the stream.
    }

    async fn run_inner(
        &self,
        new_prompt: Option<String>,
        resume: Option<Vec<Event>>,
    ) -> Result<(), GaleError> {
        self.pipeline.history.create_subscription(&self.session_id).await?;
        let mut sub = self.pipeline.history.subscribe(&self.session_id).await?;

        let mut recovered: Option<String> = None;
        if let Some(suffix) = resume {
            let plan = match self.response_type {
                StreamResponseType::Content => replay_content(&suffix),
                StreamResponseType::Session => replay_session(&suffix),
            };
            for event in &plan.events {
                if !self.sender.send_event(event) {
                    return Ok(());
                }
            }
            recovered = plan.prompt;
        }

        match (recovered, new_prompt) {
            (None, None) => Ok(()),
            (Some(prompt), None) => self.exchange(&mut sub, prompt, false).await,
            (None, Some(prompt)) => self.exchange(&mut sub, prompt, true).await,
            (Some(recovered), Some(prompt)) => {
                self.exchange(&mut sub, recovered, false).await?;
                if self.sender.is_closed() {
                    return Ok(());
                }
                self.exchange(&mut sub, prompt, true).await
            }
        }
    }

    /// One prompt-to-terminator exchange, including mid-stream fallback: a
    /// failed pipe marks the model, waits out the retry interval, and
    /// restarts against the next candidate on the same response stream.
    async fn exchange(
        &self,
        sub: &mut EventSubscription,
        prompt: String,
        append_prompt: bool,
    ) -> Result<(), GaleError> {
        if append_prompt {
            let event = Event::prompt(now_ms(), prompt.clone());
            if let Err(e) = self.pipeline.history.push(&self.session_id, &event, false).await {
                tracing::warn!(session = %self.session_id, "failed to append prompt event: {e}");
            }
        }

        let chat_history = match &self.inline_history {
            Some(inline) => inline.clone(),
            None => match self.pipeline.history.range(&self.session_id).await {
                Ok(stored) => history::transcript(&stored),
                Err(e) => {
                    tracing::warn!(session = %self.session_id, "history read degraded: {e}");
                    Vec::new()
                }
            },
        };
        let options = ProviderRequestOptions {
            context: self.context.clone(),
            history: chat_history,
            temperature: self.temperature,
            stream: true,
            max_tokens: self.max_tokens,
            on_stream_chunk: self.on_stream_chunk.clone(),
        };

        let mut skip = HashSet::new();
        let mut stream_attempts = 0u32;
        loop {
            let (model, reply) = self
                .pipeline
                .call_with_failover(&self.candidates, &mut skip, &prompt, &options)
                .await?;

            let frames = match reply {
                ProviderReply::Stream(frames) => frames,
                ProviderReply::Content(content) => {
                    return self.finish_with_content(content).await;
                }
            };
            let mut frames =
                TimeoutStream::new(frames, self.pipeline.limits.request_timeout_ms);

            match self.pipe(&mut frames, sub).await {
                PipeOutcome::Done | PipeOutcome::ConsumerGone => return Ok(()),
                PipeOutcome::Failed(err) => {
                    // Content that was appended but not yet forwarded must
                    // reach the caller before any restart or teardown.
                    self.forward_pending(sub);
                    stream_attempts += 1;
                    if stream_attempts > self.pipeline.limits.retry_max {
                        return Err(err);
                    }
                    if let Some(reason) = err.reason()
                        && let Err(e) =
                            self.pipeline.registry.mark_error(&model, reason, now_ms()).await
                    {
                        tracing::warn!(model = %model, "failed to mark model state: {e}");
                    }
                    skip.insert(model.clone());
                    if self.pipeline.select_model(&self.candidates, &skip).await?.is_none() {
                        return Err(err);
                    }
                    tracing::warn!(
                        session = %self.session_id,
                        model = %model,
                        attempt = stream_attempts,
                        "restarting stream on next candidate: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(
                        self.pipeline.limits.retry_interval_ms,
                    ))
                    .await;
                }
            }
        }
    }

    fn forward_pending(&self, sub: &mut EventSubscription) {
        while let Some(event) = sub.try_recv() {
            if !self.sender.send_event(&event) {
                break;
            }
        }
    }

    /// A provider answered a streaming request with a finished body; frame
    /// it as one content event plus terminator.
    async fn finish_with_content(
        &self,
        content: crate::provider::ContentResponse,
    ) -> Result<(), GaleError> {
        let now = now_ms();
        let events =
            [Event::response(now, content.text), Event::end(now, content.result)];
        for event in &events {
            if let Err(e) = self.pipeline.history.push(&self.session_id, event, false).await {
                tracing::warn!(session = %self.session_id, "failed to append history event: {e}");
            }
            if !self.sender.send_event(event) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Pump one upstream stream to completion: decode frames, append history
    /// events (published to subscribers), and forward published events to
    /// the caller. Returns once this exchange's terminator has reached the
    /// caller, the caller goes away, or the stream fails.
    async fn pipe(
        &self,
        frames: &mut TimeoutStream<FrameStream>,
        sub: &mut EventSubscription,
    ) -> PipeOutcome {
        use futures_util::StreamExt;

        let mut decoder = SseDecoder::new();
        let mut sub_alive = true;
        let mut upstream_done = false;
        let mut appended_any = false;
        let mut finishing: Option<Event> = None;

        loop {
            // Terminator appended: only drain the subscription until it has
            // been forwarded.
            if let Some(terminal) = &finishing {
                if !sub_alive {
                    return PipeOutcome::Done;
                }
                match sub.recv().await {
                    Some(event) => {
                        let id = event.id;
                        if !self.sender.send_event(&event) {
                            return PipeOutcome::ConsumerGone;
                        }
                        if id == terminal.id {
                            return PipeOutcome::Done;
                        }
                    }
                    None => {
                        // Subscription torn down before delivering the
                        // terminator; hand it to the caller directly.
                        self.sender.send_event(terminal);
                        return PipeOutcome::Done;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = self.sender.closed() => return PipeOutcome::ConsumerGone,
                published = sub.recv(), if sub_alive => {
                    match published {
                        Some(event) => {
                            if !self.sender.send_event(&event) {
                                return PipeOutcome::ConsumerGone;
                            }
                        }
                        None => sub_alive = false,
                    }
                }
                frame = frames.next(), if !upstream_done => {
                    match frame {
                        Some(Ok(bytes)) => {
                            for decoded in decoder.feed(&bytes) {
                                match self.append_decoded(decoded, sub_alive).await {
                                    Ok(Some(terminal)) => finishing = Some(terminal),
                                    Ok(None) => appended_any = true,
                                    Err(outcome) => return outcome,
                                }
                            }
                        }
                        Some(Err(err)) => return PipeOutcome::Failed(err),
                        None => {
                            upstream_done = true;
                            if let Some(decoded) = decoder.finish() {
                                match self.append_decoded(decoded, sub_alive).await {
                                    Ok(Some(terminal)) => finishing = Some(terminal),
                                    Ok(None) => appended_any = true,
                                    Err(outcome) => return outcome,
                                }
                            }
                            if finishing.is_none() {
                                if !appended_any {
                                    // Nothing at all arrived before the
                                    // upstream closed.
                                    return PipeOutcome::Failed(GaleError::RequestEnd);
                                }
                                // Content arrived but no terminator did.
                                let end = Event::end(now_ms(), ResultCode::Complete);
                                match self.append_event(end, sub_alive).await {
                                    Ok(terminal) => finishing = Some(terminal),
                                    Err(outcome) => return outcome,
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Append one decoded upstream event to history. Returns the appended
    /// event when it terminates the exchange.
    async fn append_decoded(
        &self,
        decoded: Event,
        sub_alive: bool,
    ) -> Result<Option<Event>, PipeOutcome> {
        match decoded.data {
            EventData::Error { code, message } => {
                Err(PipeOutcome::Failed(GaleError::StreamError { code, message }))
            }
            EventData::Content { source: ContentSource::Prompt, .. } => {
                tracing::warn!(session = %self.session_id, "ignoring prompt frame from provider");
                Ok(None)
            }
            data => {
                let terminal = matches!(data, EventData::End { .. });
                // Carried id, fresh insertion timestamp.
                let event = Event::with_id(decoded.id, now_ms(), data);
                match self.append_event(event, sub_alive).await {
                    Ok(event) => Ok(terminal.then_some(event)),
                    Err(outcome) => Err(outcome),
                }
            }
        }
    }

    /// Push an event, publishing to subscribers; when the subscription path
    /// cannot deliver it to our own caller, send directly.
    async fn append_event(&self, event: Event, sub_alive: bool) -> Result<Event, PipeOutcome> {
        let published = match self.pipeline.history.push(&self.session_id, &event, true).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session = %self.session_id, "failed to append history event: {e}");
                false
            }
        };
        if !(published && sub_alive) && !self.sender.send_event(&event) {
            return Err(PipeOutcome::ConsumerGone);
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResultCode;

    fn complete_exchange(prompt: &str, response: &str) -> Vec<Event> {
        vec![
            Event::prompt(1, prompt),
            Event::response(2, response),
            Event::end(3, ResultCode::Complete),
        ]
    }

    #[test]
    fn content_replay_of_complete_exchange() {
        let suffix = complete_exchange("P1", "R1");
        let plan = replay_content(&suffix);
        assert_eq!(plan.events.len(), 2);
        assert!(plan.events[0].is_response());
        assert!(matches!(plan.events[1].data, EventData::End { result: ResultCode::Complete }));
        assert!(plan.prompt.is_none());
    }

    #[test]
    fn content_replay_recovers_prompt_of_incomplete_exchange() {
        let suffix = vec![Event::prompt(1, "P1"), Event::response(2, "part")];
        let plan = replay_content(&suffix);
        assert_eq!(plan.events.len(), 1);
        assert_eq!(plan.prompt.as_deref(), Some("P1"));
    }

    #[test]
    fn content_replay_drops_buffer_on_error() {
        let suffix = vec![
            Event::prompt(1, "P1"),
            Event::response(2, "part"),
            Event::error(3, "PROVIDER_STREAM_ERROR", "boom"),
        ];
        let plan = replay_content(&suffix);
        assert!(plan.events.is_empty());
        assert!(plan.prompt.is_none());
    }

    #[test]
    fn content_replay_stops_at_first_end() {
        let mut suffix = complete_exchange("P1", "R1");
        suffix.extend(complete_exchange("P2", "R2"));
        let plan = replay_content(&suffix);
        // Only the first exchange's response and terminator.
        assert_eq!(plan.events.len(), 2);
    }

    #[test]
    fn session_replay_forwards_tuples_and_drops_errored_runs() {
        let mut suffix = complete_exchange("P1", "R1");
        suffix.push(Event::prompt(4, "P2"));
        suffix.push(Event::response(5, "bad"));
        suffix.push(Event::error(6, "X", "y"));
        suffix.extend(complete_exchange("P3", "R3"));

        let plan = replay_session(&suffix);
        let prompts: Vec<_> = plan.events.iter().filter(|e| e.is_prompt()).collect();
        assert_eq!(prompts.len(), 2);
        assert_eq!(plan.events.len(), 6);
        assert!(plan.prompt.is_none());
    }

    #[test]
    fn session_replay_recovers_trailing_incomplete_prompt() {
        let mut suffix = complete_exchange("P1", "R1");
        suffix.push(Event::prompt(4, "P2"));
        suffix.push(Event::response(5, "dangling"));

        let plan = replay_session(&suffix);
        assert_eq!(plan.events.len(), 3);
        assert_eq!(plan.prompt.as_deref(), Some("P2"));
    }
}
