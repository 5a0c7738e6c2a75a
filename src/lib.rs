//! AI dispatch and session engine.
//!
//! A request carries a prompt and a prioritized list of model candidates;
//! the engine answers with either a completed text response or a live SSE
//! stream, enforcing per-model rate limits, request and inter-chunk
//! timeouts, in-place retries, provider fallback, persistent session
//! history with pub/sub fan-out, and resumable streams.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use gale::{Engine, EngineOptions, ModelOptions, ProviderOptions, Request};
//!
//! # async fn demo() -> Result<(), gale::GaleError> {
//! let mut providers = HashMap::new();
//! providers.insert("openai".to_string(), ProviderOptions::with_api_key("sk-..."));
//!
//! let engine = Engine::new(EngineOptions {
//!     providers,
//!     models: vec![ModelOptions::new("openai", "gpt-4o-mini")],
//!     ..EngineOptions::default()
//! })?;
//! engine.init().await?;
//!
//! let response = engine
//!     .request(Request { prompt: Some("Hello".into()), ..Request::default() })
//!     .await?;
//! # let _ = response;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod history;
mod pipeline;
pub mod provider;
mod rate;
pub mod registry;
pub mod store;
mod stream;
pub mod time;
mod timeout;

use std::collections::HashMap;
use std::sync::Arc;

pub use config::{
    EngineOptions, LimitOptions, ModelLimits, ModelOptions, ProviderOptions, RateOptions,
    RestoreOptions, RetryOptions, StorageOptions,
};
pub use error::{ErrorReason, GaleError};
pub use event::{ContentSource, Event, EventData, ResultCode};
pub use history::ChatExchange;
pub use pipeline::{
    ContentResult, EngineResponse, Request, RequestOptions, StreamResponseType,
};
pub use stream::ResponseStream;
pub use time::TimeWindow;

use pipeline::Pipeline;
use provider::Provider;
use provider::openai::{OpenAiProvider, default_base_url};
use registry::ModelRegistry;
use store::Store;
use store::memory::MemoryStore;

/// One dispatch engine instance. Engines are self-contained: every piece of
/// mutable state lives in the engine's store, so multiple engines run side
/// by side in one process.
pub struct Engine {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Validate options and assemble an engine. No I/O happens here; call
    /// [`Engine::init`] before the first request.
    pub fn new(options: EngineOptions) -> Result<Self, GaleError> {
        let resolved = options.resolve()?;

        let store: Arc<dyn Store> = match &options.storage {
            StorageOptions::Memory => Arc::new(MemoryStore::new()),
            StorageOptions::Custom(store) => store.clone(),
        };

        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, provider_options) in &options.providers {
            let client: Arc<dyn Provider> = match &provider_options.client {
                Some(client) => client.clone(),
                None => {
                    let base_url = provider_options
                        .base_url
                        .clone()
                        .or_else(|| default_base_url(name).map(str::to_string))
                        .ok_or_else(|| {
                            GaleError::Option(format!(
                                "provider {name} needs a base_url or an injected client"
                            ))
                        })?;
                    Arc::new(OpenAiProvider::new(provider_options.api_key.clone(), base_url))
                }
            };
            providers.insert(name.clone(), client);
        }

        let registry = Arc::new(ModelRegistry::new(store.clone(), resolved.models));
        let history = Arc::new(history::History::new(
            store.clone(),
            resolved.limits.history_expiration_ms,
        ));

        let pipeline = Arc::new(Pipeline { providers, registry, history, limits: resolved.limits });
        Ok(Self { pipeline, store })
    }

    /// Initialize providers and seed model state.
    pub async fn init(&self) -> Result<(), GaleError> {
        for provider in self.pipeline.providers.values() {
            provider.init().await?;
        }
        self.pipeline.registry.init().await
    }

    /// Dispatch one request: a completed response, or a live stream when
    /// `options.stream` is set.
    pub async fn request(&self, request: Request) -> Result<EngineResponse, GaleError> {
        self.pipeline.run(request).await
    }

    /// Close providers and the store. In-flight streams are destroyed as
    /// their storage operations start failing.
    pub async fn close(&self) -> Result<(), GaleError> {
        for provider in self.pipeline.providers.values() {
            provider.close().await?;
        }
        self.store.close().await
    }
}
