//! Configuration Loader
//!
//! Collects the configuration layers a client resolves against, in descending
//! precedence: an explicit in-process mapping, a document loaded from disk, and
//! the built-in provider registry.

use crate::config::provider::{ProviderRegistry, ProvidersConfig};
use crate::error::{LlmaoError, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

static BUILTIN_REGISTRY: LazyLock<std::result::Result<Arc<ProviderRegistry>, String>> =
    LazyLock::new(|| {
        serde_json::from_str::<ProviderRegistry>(include_str!("../../providers.json"))
            .map(Arc::new)
            .map_err(|e| format!("Failed to parse built-in providers.json: {}", e))
    });

/// The built-in provider registry, parsed once per process
pub fn builtin_registry() -> Result<Arc<ProviderRegistry>> {
    BUILTIN_REGISTRY
        .as_ref()
        .map(Arc::clone)
        .map_err(|e| LlmaoError::Config(e.clone()))
}

/// Configuration layers with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// In-process mapping supplied at construction
    explicit: ProvidersConfig,
    /// Document loaded from a path
    file: ProvidersConfig,
    /// Read-only provider defaults
    registry: Arc<ProviderRegistry>,
}

impl ConfigLoader {
    /// Create a loader from the built-in registry and the first config file
    /// found in the default locations
    pub fn new() -> Result<Self> {
        let mut loader = Self::builtin()?;
        loader.load_from_default_paths()?;
        Ok(loader)
    }

    /// Create a loader with a specific config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self::builtin()?;
        loader.load_from_file(path)?;
        Ok(loader)
    }

    /// Create a loader holding only the built-in registry
    pub fn builtin() -> Result<Self> {
        Ok(Self::with_registry(builtin_registry()?))
    }

    /// Create a loader over a caller-supplied registry and no user config
    pub fn with_registry(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            explicit: ProvidersConfig::new(),
            file: ProvidersConfig::new(),
            registry,
        }
    }

    /// Set the explicit (highest precedence) layer
    pub fn with_explicit(mut self, config: ProvidersConfig) -> Self {
        self.explicit = config;
        self
    }

    /// Load configuration from default paths; the first existing file is used
    pub fn load_from_default_paths(&mut self) -> Result<()> {
        match Self::get_config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => self.load_from_file(&path),
            None => {
                debug!("no configuration document found in default locations");
                Ok(())
            }
        }
    }

    /// Get list of config paths to check, in priority order
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // 1. Environment variable
        if let Ok(custom_path) = std::env::var("LLMAO_CONFIG_PATH") {
            paths.push(PathBuf::from(custom_path));
        }

        // 2. Current directory
        paths.push(PathBuf::from("llmao.json"));
        paths.push(PathBuf::from("config.json"));

        // 3. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("llmao").join("config.json"));
        }

        // 4. Home directory
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".llmao").join("config.json"));
        }

        paths
    }

    /// Load a configuration document into the file layer.
    ///
    /// Entries from this document replace same-keyed entries from any
    /// document loaded earlier.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LlmaoError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let config = parse_document(&content, &path.display().to_string())?;
        debug!(path = %path.display(), entries = config.len(), "loaded configuration document");

        self.file.extend(config);
        Ok(())
    }

    /// The explicit layer
    pub fn explicit(&self) -> &ProvidersConfig {
        &self.explicit
    }

    /// The file layer
    pub fn file(&self) -> &ProvidersConfig {
        &self.file
    }

    /// The provider registry
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// User entries (explicit, then file) stored under `key`
    pub fn entries<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a crate::config::ModelConfig> {
        self.explicit.get(key).into_iter().chain(self.file.get(key))
    }

    /// Provider names configured by the user, sorted and deduplicated
    pub fn configured_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .explicit
            .keys()
            .chain(self.file.keys())
            .map(|key| key.split('/').next().unwrap_or(key).to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Model names configured for a provider: provider-level `models` lists
    /// plus the suffixes of `"provider/model"` entries
    pub fn configured_models(&self, provider: &str) -> Vec<String> {
        let prefix = format!("{}/", provider);
        let mut models: Vec<String> = Vec::new();

        for entry in self.entries(provider) {
            for model in &entry.models {
                if !models.contains(model) {
                    models.push(model.clone());
                }
            }
        }

        let mut suffixes: Vec<&String> = self
            .explicit
            .keys()
            .chain(self.file.keys())
            .filter(|key| key.starts_with(&prefix))
            .collect();
        suffixes.sort();
        for key in suffixes {
            let model = key[prefix.len()..].to_string();
            if !models.contains(&model) {
                models.push(model);
            }
        }

        models
    }
}

/// Parse and validate a configuration document
pub fn parse_document(content: &str, origin: &str) -> Result<ProvidersConfig> {
    let config: ProvidersConfig = serde_json::from_str(content)
        .map_err(|e| LlmaoError::Config(format!("Failed to parse {}: {}", origin, e)))?;

    validate(&config, origin)?;
    Ok(config)
}

/// Check entry keys and warn about fields that have no effect
pub fn validate(config: &ProvidersConfig, origin: &str) -> Result<()> {
    for (key, entry) in config {
        match key.split_once('/') {
            None if key.trim().is_empty() => {
                return Err(LlmaoError::Config(format!(
                    "{}: empty provider name in configuration",
                    origin
                )));
            }
            None => {}
            Some((provider, model)) => {
                if provider.is_empty() || model.is_empty() {
                    return Err(LlmaoError::Config(format!(
                        "{}: invalid entry '{}', expected 'provider' or 'provider/model'",
                        origin, key
                    )));
                }
                if !entry.models.is_empty() {
                    warn!(entry = %key, "`models` is ignored on model-level entries");
                }
            }
        }
    }
    Ok(())
}
