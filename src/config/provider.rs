//! Provider Configuration
//!
//! Defines the configuration schema: user entries keyed by `"provider"` or
//! `"provider/model"`, and the built-in provider registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// User configuration: entries keyed by bare provider name or exact `"provider/model"`
pub type ProvidersConfig = HashMap<String, ModelConfig>;

/// Built-in provider defaults keyed by provider name
pub type ProviderRegistry = HashMap<String, ProviderConfig>;

/// A provider-level or model-level configuration entry.
///
/// `models` is only meaningful on provider-level entries. Every other field is
/// optional so entries from different sources can be merged field by field.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model names this entry's keys and settings apply to (provider-level only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Credentials, in rotation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_strategy: Option<RotationStrategy>,

    /// Base URL for the API; required unless the provider is in the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Additional headers to send with requests
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Wire field name -> generic field name it is filled from
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub param_mappings: HashMap<String, String>,

    /// Authentication header convention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,

    /// Wire protocol spoken by the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_param_mapping(mut self, wire: impl Into<String>, generic: impl Into<String>) -> Self {
        self.param_mappings.insert(wire.into(), generic.into());
        self
    }

    pub fn with_rotation_strategy(mut self, strategy: RotationStrategy) -> Self {
        self.rotation_strategy = Some(strategy);
        self
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Whether this provider-level entry covers the given model name
    pub fn covers(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

// Keys are secrets; only their count is printed.
impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("models", &self.models)
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("rotation_strategy", &self.rotation_strategy)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("param_mappings", &self.param_mappings)
            .field("auth", &self.auth)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Built-in defaults for a known provider (from `providers.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL for the API
    pub base_url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub param_mappings: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,

    /// Environment variable holding a fallback API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Well-known models (informational only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

impl ProviderConfig {
    /// Read the fallback API key from the environment, if configured and set
    pub fn env_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// Strategy for rotating API keys
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Rotate through keys sequentially
    #[default]
    RoundRobin,

    /// Use the least recently used key
    #[serde(alias = "lru")]
    LeastRecentlyUsed,

    /// Random selection
    Random,
}

/// How a credential is placed on the outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthScheme {
    /// Header name, e.g. `Authorization` or `x-api-key`
    pub header: String,

    /// Prefix before the key, e.g. `Bearer`; `null` sends the bare key
    #[serde(default = "default_auth_scheme")]
    pub scheme: Option<String>,
}

fn default_auth_scheme() -> Option<String> {
    Some("Bearer".to_string())
}

impl Default for AuthScheme {
    fn default() -> Self {
        Self::bearer()
    }
}

impl AuthScheme {
    /// `Authorization: Bearer <key>`
    pub fn bearer() -> Self {
        Self {
            header: "Authorization".to_string(),
            scheme: default_auth_scheme(),
        }
    }

    /// A custom header carrying the bare key
    pub fn header(name: impl Into<String>) -> Self {
        Self {
            header: name.into(),
            scheme: None,
        }
    }

    /// Render the header value for a credential
    pub fn header_value(&self, key: &str) -> String {
        match &self.scheme {
            Some(scheme) if !scheme.is_empty() => format!("{} {}", scheme, key),
            _ => key.to_string(),
        }
    }
}

/// Wire protocol of a provider endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// OpenAI-compatible chat completions
    #[default]
    #[serde(rename = "openai")]
    OpenAi,

    /// Anthropic messages API
    Anthropic,
}

impl Protocol {
    /// Endpoint path appended to the base URL
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "chat/completions",
            Protocol::Anthropic => "messages",
        }
    }
}
