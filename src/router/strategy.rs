//! Model Routing
//!
//! Handles parsing of `"provider/model"` identifiers.

use crate::error::{LlmaoError, Result};

/// Parsed model identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRoute {
    /// Provider name (e.g., "openai", "groq")
    pub provider: String,

    /// Model name as sent to the provider (e.g., "gpt-4", "anthropic/claude-3.5-sonnet")
    pub model: String,
}

impl ModelRoute {
    /// Parse a model string in the format "provider/model".
    ///
    /// Only the first `/` separates the provider; the model name may contain
    /// further slashes, as aggregator providers use them.
    pub fn parse(model_string: &str) -> Result<Self> {
        match model_string.trim().split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
            }),
            _ => Err(LlmaoError::Config(format!(
                "Invalid model format '{}'. Expected 'provider/model'",
                model_string
            ))),
        }
    }

    /// The model name sent on the wire
    pub fn model_id(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Display for ModelRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}
