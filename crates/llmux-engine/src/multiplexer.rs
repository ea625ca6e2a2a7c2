//! Provider multiplexer.
//!
//! Routes each request to a backend chosen by the prompt's provider key, or
//! the configured default when the prompt names none.  Backends are built by
//! registered factories the first time they are needed and cached for the
//! lifetime of the multiplexer.
//!
//! ```text
//!   prompt.provider ──► canonical key ──► cache hit? ──► Gen
//!        (alias)             │                 │ no
//!                            │                 ▼
//!                            │          factory() (once)
//!                            ▼
//!              UnsupportedProvider (nothing built)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use llmux_kernel::EventBus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{DEFAULT_PROVIDER, EngineConfig};
use crate::error::{EngineError, Result};
use crate::llm::providers::{self, PROVIDERS};
use crate::llm::types::{Prompt, Status, TokenUsage};
use crate::retry::Retrying;
use crate::runtime::{Engine, EngineOptions, Gen};
use crate::streaming::ChunkStream;

/// Builds the [`Gen`] behind one provider key.
pub type Factory = Box<dyn Fn() -> Result<Arc<dyn Gen>> + Send + Sync>;

/// Aliases registered by [`Multiplexer::from_config`].
pub const BUILTIN_ALIASES: [(&str, &str); 7] = [
    ("gemini", "genai"),
    ("google", "genai"),
    ("vertex", "genai"),
    ("vertexai", "genai"),
    ("claude", "anthropic"),
    ("lm-studio", "lmstudio"),
    ("lm_studio", "lmstudio"),
];

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MultiplexerBuilder {
    factories: HashMap<String, Factory>,
    aliases: HashMap<String, String>,
    default_provider: String,
}

impl MultiplexerBuilder {
    /// Register `factory` under `name` (case-insensitive).
    pub fn factory<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Gen>> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.trim().to_lowercase(), Box::new(factory));
        self
    }

    pub fn alias(mut self, alias: &str, target: &str) -> Self {
        let (alias, target) = (alias.trim(), target.trim());
        if !alias.is_empty() && !target.is_empty() {
            self.aliases.insert(alias.to_lowercase(), target.to_lowercase());
        }
        self
    }

    pub fn default_provider(mut self, name: &str) -> Self {
        self.default_provider = name.to_owned();
        self
    }

    /// Validate the registrations.
    ///
    /// # Errors
    ///
    /// Fails when no factory is registered or the default provider resolves
    /// to none of them.
    pub fn build(self) -> Result<Multiplexer> {
        if self.factories.is_empty() {
            return Err(EngineError::Internal(
                "multiplexer: no LLM factories registered".into(),
            ));
        }
        let mut mux = Multiplexer {
            factories: self.factories,
            aliases: self.aliases,
            default_provider: String::new(),
            cache: RwLock::new(HashMap::new()),
            last: RwLock::new(None),
        };
        let requested = if self.default_provider.trim().is_empty() {
            DEFAULT_PROVIDER
        } else {
            self.default_provider.as_str()
        };
        mux.default_provider = mux.canonicalize(requested)?;
        Ok(mux)
    }
}

// ---------------------------------------------------------------------------
// Multiplexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LastUse {
    provider: String,
    model_override: Option<String>,
}

/// A [`Gen`] that dispatches to one of several backends.
pub struct Multiplexer {
    factories: HashMap<String, Factory>,
    aliases: HashMap<String, String>,
    default_provider: String,
    cache: RwLock<HashMap<String, Arc<dyn Gen>>>,
    last: RwLock<Option<LastUse>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<&String> = self.factories.keys().collect();
        providers.sort();
        f.debug_struct("Multiplexer")
            .field("providers", &providers)
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

impl Multiplexer {
    pub fn builder() -> MultiplexerBuilder {
        MultiplexerBuilder::default()
    }

    /// A multiplexer over every built-in backend, each wrapped in retry
    /// middleware and sharing `bus`.
    ///
    /// # Errors
    ///
    /// Fails when `config.default_provider` names no built-in backend.
    pub fn from_config(config: &EngineConfig, bus: EventBus) -> Result<Self> {
        let mut builder = Self::builder().default_provider(&config.default_provider);
        for name in PROVIDERS {
            let config = config.clone();
            let bus = bus.clone();
            builder = builder.factory(name, move || {
                let adapter = providers::adapter_for(name, &config).ok_or_else(|| {
                    EngineError::UnsupportedProvider {
                        provider: name.to_owned(),
                    }
                })?;
                let options = EngineOptions {
                    show_thoughts: config.debug.show_thoughts
                        || (name == "anthropic" && config.anthropic.show_thinking),
                    debug: config.debug.debug,
                    token_debug: config.debug.token_debug,
                };
                let engine = Engine::new(adapter, bus.clone(), config.defaults.clone())
                    .with_options(options);
                Ok(Arc::new(Retrying::new(engine, config.retry)) as Arc<dyn Gen>)
            });
        }
        for (alias, target) in BUILTIN_ALIASES {
            builder = builder.alias(alias, target);
        }
        builder.build()
    }

    /// Canonical name of the default provider.
    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Registered provider keys, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the backend for `provider` ahead of its first request.
    pub fn warm_up(&self, provider: &str) -> Result<()> {
        self.resolve(provider).map(|_| ())
    }

    /// Map a provider key or alias to a registered factory name.  An empty
    /// key means the default provider.
    pub fn canonicalize(&self, provider: &str) -> Result<String> {
        let trimmed = provider.trim();
        let name = if trimmed.is_empty() {
            self.default_provider.as_str()
        } else {
            trimmed
        };
        let key = name.to_lowercase();

        if self.factories.contains_key(&key) {
            return Ok(key);
        }
        if let Some(target) = self.aliases.get(&key) {
            if self.factories.contains_key(target) {
                return Ok(target.clone());
            }
        }
        Err(EngineError::UnsupportedProvider {
            provider: provider.to_owned(),
        })
    }

    /// The backend for `provider`, built on first use.
    pub fn resolve(&self, provider: &str) -> Result<(String, Arc<dyn Gen>)> {
        let key = self.canonicalize(provider)?;

        if let Some(existing) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok((key, Arc::clone(existing)));
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = cache.get(&key) {
            return Ok((key, Arc::clone(existing)));
        }
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| EngineError::UnsupportedProvider {
                provider: provider.to_owned(),
            })?;
        let built = factory()?;
        info!(provider = %key, "initialized provider");
        cache.insert(key.clone(), Arc::clone(&built));
        Ok((key, built))
    }

    fn route(&self, prompt: &Prompt) -> Result<Arc<dyn Gen>> {
        let (provider, backend) = self.resolve(&prompt.provider)?;
        let model = prompt.model_name.trim();
        debug!(provider = %provider, model, "routing request");
        *self.last.write().unwrap_or_else(PoisonError::into_inner) = Some(LastUse {
            provider,
            model_override: (!model.is_empty()).then(|| model.to_owned()),
        });
        Ok(backend)
    }
}

#[async_trait]
impl Gen for Multiplexer {
    async fn generate(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String> {
        let backend = self.route(prompt)?;
        backend.generate(prompt, cancel).await
    }

    async fn generate_stream(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        let backend = self.route(prompt)?;
        backend.generate_stream(prompt, cancel).await
    }

    async fn count_tokens(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let backend = self.route(prompt)?;
        backend.count_tokens(prompt, cancel).await
    }

    /// Status of the provider that served the most recent request, or of the
    /// default provider before any request.
    fn status(&self) -> Status {
        let last = self
            .last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (provider, model_override) = match last {
            Some(last) => (last.provider, last.model_override),
            None => (self.default_provider.clone(), None),
        };

        match self.resolve(&provider) {
            Ok((_, backend)) => {
                let mut status = backend.status();
                if let Some(model) = model_override {
                    status.model = format!("{model} (requested)");
                }
                status
            }
            Err(e) => Status {
                configured: false,
                backend: provider,
                model: String::new(),
                message: e.to_string(),
            },
        }
    }
}
