//! LLMAO - Lightweight LLM API Orchestrator
//!
//! A multi-provider LLM gateway: one `completion` call addressed by
//! `"provider/model"`, resolved against layered configuration, with API key
//! rotation and normalized streaming. Python bindings are available behind the
//! `python` feature.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;

#[cfg(feature = "python")]
mod python;

pub use api::{
    ChunkStream, CompletionRequest, CompletionResponse, Message, MessageContent, StreamChunk, Tool,
};
pub use client::{HttpOptions, HttpTransport, OutboundRequest, Transport};
pub use config::{ConfigLoader, ConfigResolver, EffectiveConfig, ModelConfig, ProvidersConfig};
pub use error::{LlmaoError, ProviderErrorKind, RequestTarget, Result};
pub use logging::init_logging;
pub use router::{KeyPoolStats, RequestRouter};

use config::ProviderRegistry;

/// Client-wide streaming settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bounded wait of one queue poll in a chunk stream. Not a request timeout.
    pub poll_interval: Duration,
    /// Chunks buffered between producer and consumer
    pub queue_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            queue_capacity: 256,
        }
    }
}

/// Outcome of [`LlmClient::completion`]
#[derive(Debug)]
pub enum Completion {
    Response(CompletionResponse),
    Stream(ChunkStream),
}

impl Completion {
    pub fn into_response(self) -> Option<CompletionResponse> {
        match self {
            Completion::Response(response) => Some(response),
            Completion::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChunkStream> {
        match self {
            Completion::Stream(stream) => Some(stream),
            Completion::Response(_) => None,
        }
    }
}

/// The main LLM client
#[derive(Debug)]
pub struct LlmClient {
    /// Configuration layers and the route cache
    resolver: ConfigResolver,

    /// Request construction and transport
    router: RequestRouter,
}

impl LlmClient {
    /// Create a new client from `.env`, the first config file found in the
    /// default locations and the built-in registry
    pub fn new() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::builder().default_paths().build()
    }

    /// Create a client with a custom config path
    pub fn with_config_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().config_path(path).build()
    }

    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::default()
    }

    /// Make a completion request.
    ///
    /// Returns a stream when `request.stream` is set, a response otherwise.
    pub async fn completion(&self, model: &str, request: CompletionRequest) -> Result<Completion> {
        if request.is_stream() {
            Ok(Completion::Stream(self.completion_stream(model, request).await?))
        } else {
            Ok(Completion::Response(
                self.completion_response(model, request).await?,
            ))
        }
    }

    /// Make a non-streaming completion request
    pub async fn completion_response(
        &self,
        model: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse> {
        let route = self.resolver.route(model)?;
        self.router.send(&route, &request).await
    }

    /// Start a streaming completion request
    pub async fn completion_stream(&self, model: &str, request: CompletionRequest) -> Result<ChunkStream> {
        let route = self.resolver.route(model)?;
        self.router.stream(&route, &request)
    }

    /// Resolve the effective configuration for `"provider/model"`
    pub fn resolve(&self, model: &str) -> Result<Arc<EffectiveConfig>> {
        self.resolver.resolve(model)
    }

    /// List available providers: configured ones and built-in ones
    pub fn providers(&self) -> Vec<String> {
        let sources = self.resolver.sources();
        let mut names = sources.configured_providers();
        names.extend(sources.registry().keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    /// Get provider info. Credentials are reported only as present or not.
    pub fn provider_info(&self, name: &str) -> Option<ProviderInfo> {
        let sources = self.resolver.sources();
        let registry = sources.registry().get(name);
        let prefix = format!("{}/", name);

        let user_entries: Vec<&ModelConfig> = sources
            .explicit()
            .iter()
            .chain(sources.file().iter())
            .filter(|(key, _)| key.as_str() == name || key.starts_with(&prefix))
            .map(|(_, entry)| entry)
            .collect();

        if user_entries.is_empty() && registry.is_none() {
            return None;
        }

        let base_url = sources
            .entries(name)
            .find_map(|entry| entry.base_url.clone())
            .or_else(|| registry.map(|r| r.base_url.clone()))
            .or_else(|| user_entries.iter().find_map(|entry| entry.base_url.clone()));

        let mut models = sources.configured_models(name);
        if models.is_empty() {
            models = registry.map(|r| r.models.clone()).unwrap_or_default();
        }

        let has_keys = user_entries
            .iter()
            .any(|entry| entry.keys.iter().any(|key| !key.trim().is_empty()))
            || registry.and_then(|r| r.env_api_key()).is_some();

        Some(ProviderInfo {
            name: name.to_string(),
            base_url,
            models,
            has_keys,
        })
    }

    /// Per-key usage counts for a route, by key index
    pub fn key_stats(&self, model: &str) -> Result<KeyPoolStats> {
        Ok(self.resolver.route(model)?.key_pool().stats())
    }
}

/// Provider information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    /// Provider-level or registry URL, else one set on a model entry
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub has_keys: bool,
}

/// Builder for [`LlmClient`]
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<ProvidersConfig>,
    config_path: Option<PathBuf>,
    default_paths: bool,
    registry: Option<Arc<ProviderRegistry>>,
    transport: Option<Arc<dyn Transport>>,
    http_options: Option<HttpOptions>,
    options: ClientOptions,
}

impl LlmClientBuilder {
    /// Explicit configuration, highest precedence
    pub fn config(mut self, config: ProvidersConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Configuration document to load
    pub fn config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Search the default locations when no config path is given
    pub fn default_paths(mut self) -> Self {
        self.default_paths = true;
        self
    }

    /// Replace the built-in provider registry
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom transport instead of [`HttpTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn http_options(mut self, options: HttpOptions) -> Self {
        self.http_options = Some(options);
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<LlmClient> {
        let mut loader = match self.registry {
            Some(registry) => ConfigLoader::with_registry(registry),
            None => ConfigLoader::builtin()?,
        };

        match &self.config_path {
            Some(path) => loader.load_from_file(path)?,
            None if self.default_paths => loader.load_from_default_paths()?,
            None => {}
        }

        if let Some(config) = self.config {
            config::loader::validate(&config, "explicit configuration")?;
            loader = loader.with_explicit(config);
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_options(
                self.http_options.unwrap_or_default(),
            )?),
        };

        Ok(LlmClient {
            resolver: ConfigResolver::new(loader),
            router: RequestRouter::new(transport, self.options),
        })
    }
}
