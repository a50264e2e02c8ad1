//! LLMAO Error Types
//!
//! Error handling for the gateway. Transport and provider failures carry a
//! [`RequestTarget`] naming the provider, model and key index that were in use,
//! never the key itself.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Where a request was headed when it failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub provider: String,
    pub model: String,
    /// Position of the credential in the route's key pool
    pub key_index: usize,
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (key #{})", self.provider, self.model, self.key_index)
    }
}

/// Classification of a well-formed error response from a vendor endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403, bad or revoked credential
    Authentication,
    /// 429 or an explicit rate-limit / quota message
    RateLimited,
    /// Any other 4xx
    InvalidRequest,
    /// 5xx
    Server,
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Authentication => "authentication failed",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::InvalidRequest => "invalid request",
            ProviderErrorKind::Server => "server error",
            ProviderErrorKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// Main error type for LLMAO operations
#[derive(Debug, Error)]
pub enum LlmaoError {
    /// Missing keys, missing `base_url`, malformed document, bad model string
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network/connection failure or transport-level timeout
    #[error("Transport error{}: {message}", target_suffix(.target))]
    Transport {
        message: String,
        target: Option<RequestTarget>,
    },

    /// Well-formed error response from the vendor endpoint
    #[error("Provider {kind} (HTTP {status}){}: {message}", target_suffix(.target))]
    Provider {
        kind: ProviderErrorKind,
        status: u16,
        message: String,
        retry_after: Option<Duration>,
        target: Option<RequestTarget>,
    },

    /// Vendor payload could not be turned into a canonical record
    #[error("Response error: {0}")]
    Response(String),

    /// Failure inside the producer path of a streaming request
    #[error("Streaming error: {0}")]
    Stream(String),

    /// The consumer abandoned a stream
    #[error("Request cancelled")]
    Cancelled,
}

fn target_suffix(target: &Option<RequestTarget>) -> String {
    target
        .as_ref()
        .map(|t| format!(" for {}", t))
        .unwrap_or_default()
}

impl LlmaoError {
    /// Build a transport error without a target
    pub fn transport(message: impl Into<String>) -> Self {
        LlmaoError::Transport {
            message: message.into(),
            target: None,
        }
    }

    /// Attach the request target to transport and provider errors.
    ///
    /// Other variants pass through untouched, as does an error that already
    /// carries a target.
    pub fn with_target(self, new_target: RequestTarget) -> Self {
        match self {
            LlmaoError::Transport {
                message,
                target: None,
            } => LlmaoError::Transport {
                message,
                target: Some(new_target),
            },
            LlmaoError::Provider {
                kind,
                status,
                message,
                retry_after,
                target: None,
            } => LlmaoError::Provider {
                kind,
                status,
                message,
                retry_after,
                target: Some(new_target),
            },
            other => other,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, LlmaoError::Config(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, LlmaoError::Transport { .. })
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, LlmaoError::Provider { .. })
    }

    /// Provider error classification, if this is a provider error
    pub fn provider_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            LlmaoError::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Target of a transport or provider error
    pub fn target(&self) -> Option<&RequestTarget> {
        match self {
            LlmaoError::Transport { target, .. } | LlmaoError::Provider { target, .. } => {
                target.as_ref()
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmaoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmaoError::transport(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            LlmaoError::transport(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            LlmaoError::Response(format!("Failed to decode response: {}", err))
        } else {
            LlmaoError::transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmaoError {
    fn from(err: serde_json::Error) -> Self {
        LlmaoError::Response(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for LlmaoError {
    fn from(err: std::io::Error) -> Self {
        LlmaoError::Config(format!("IO error: {}", err))
    }
}

/// Result type alias for LLMAO operations
pub type Result<T> = std::result::Result<T, LlmaoError>;
