//! Configuration Resolution
//!
//! Merges the configuration layers into one immutable [`EffectiveConfig`] per
//! `"provider/model"`, computed at most once and cached for the lifetime of the
//! resolver together with the route's key pool.
//!
//! Field precedence for `p/m`, highest first:
//!
//! 1. explicit `"p/m"` entry
//! 2. file `"p/m"` entry
//! 3. explicit `"p"` entry, if it lists `m` in `models`
//! 4. file `"p"` entry, if it lists `m` in `models`
//! 5. registry entry for `p`
//! 6. the registry's `api_key_env` variable (keys only)
//!
//! Scalar fields take the first source that defines them. `headers` and
//! `param_mappings` merge key by key, higher precedence winning.

use crate::config::loader::ConfigLoader;
use crate::config::provider::{AuthScheme, ModelConfig, Protocol, RotationStrategy};
use crate::error::{LlmaoError, Result};
use crate::router::{KeyPool, ModelRoute};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Fully resolved settings for one `"provider/model"`
#[derive(Clone)]
pub struct EffectiveConfig {
    pub provider: String,
    pub model: String,
    /// Base URL without a trailing slash
    pub base_url: String,
    pub headers: HashMap<String, String>,
    /// Never empty
    pub keys: Vec<String>,
    pub rotation_strategy: RotationStrategy,
    /// Wire field name -> generic field name
    pub param_mappings: HashMap<String, String>,
    pub auth: AuthScheme,
    pub protocol: Protocol,
}

impl EffectiveConfig {
    /// Full endpoint URL for this route's protocol
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.base_url, self.protocol.endpoint_path())
    }

    /// Rename generic body fields to their wire names.
    ///
    /// Every value is extracted before any is inserted, so a mapping that
    /// swaps two names does not cascade.
    pub fn apply_param_mappings(&self, params: &mut serde_json::Value) {
        let Some(obj) = params.as_object_mut() else {
            return;
        };

        let mut mappings: Vec<(&String, &String)> = self.param_mappings.iter().collect();
        mappings.sort();

        let moved: Vec<(String, serde_json::Value)> = mappings
            .into_iter()
            .filter(|(wire, generic)| wire != generic)
            .filter_map(|(wire, generic)| obj.remove(generic).map(|v| (wire.clone(), v)))
            .collect();

        for (wire, value) in moved {
            obj.insert(wire, value);
        }
    }
}

impl fmt::Debug for EffectiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("headers", &self.headers)
            .field("keys", &format_args!("[{} redacted]", self.keys.len()))
            .field("rotation_strategy", &self.rotation_strategy)
            .field("param_mappings", &self.param_mappings)
            .field("auth", &self.auth)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// A resolved configuration and the key pool that rotates its credentials
#[derive(Debug)]
pub struct Route {
    config: Arc<EffectiveConfig>,
    key_pool: KeyPool,
}

impl Route {
    pub fn new(config: EffectiveConfig) -> Self {
        let key_pool = KeyPool::new(config.keys.clone(), config.rotation_strategy);
        Self {
            config: Arc::new(config),
            key_pool,
        }
    }

    pub fn config(&self) -> &Arc<EffectiveConfig> {
        &self.config
    }

    pub fn key_pool(&self) -> &KeyPool {
        &self.key_pool
    }
}

/// Resolves and caches routes
#[derive(Debug)]
pub struct ConfigResolver {
    sources: ConfigLoader,
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl ConfigResolver {
    pub fn new(sources: ConfigLoader) -> Self {
        Self {
            sources,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration layers this resolver reads
    pub fn sources(&self) -> &ConfigLoader {
        &self.sources
    }

    /// Resolve the effective configuration for `"provider/model"`
    pub fn resolve(&self, provider_model: &str) -> Result<Arc<EffectiveConfig>> {
        Ok(Arc::clone(self.route(provider_model)?.config()))
    }

    /// Resolve the route (configuration plus key pool) for `"provider/model"`.
    ///
    /// Failures are not cached; a later call re-runs resolution.
    pub fn route(&self, provider_model: &str) -> Result<Arc<Route>> {
        if let Some(route) = self.routes.read().get(provider_model) {
            return Ok(Arc::clone(route));
        }

        let parsed = ModelRoute::parse(provider_model)?;

        let mut routes = self.routes.write();
        if let Some(route) = routes.get(provider_model) {
            return Ok(Arc::clone(route));
        }

        let config = self.compute(&parsed)?;
        debug!(
            route = %parsed,
            base_url = %config.base_url,
            keys = config.keys.len(),
            strategy = ?config.rotation_strategy,
            "resolved effective configuration"
        );

        let route = Arc::new(Route::new(config));
        routes.insert(provider_model.to_string(), Arc::clone(&route));
        Ok(route)
    }

    /// Whether a route has already been resolved and cached
    pub fn is_cached(&self, provider_model: &str) -> bool {
        self.routes.read().contains_key(provider_model)
    }

    /// Merge all layers for one route
    fn compute(&self, route: &ModelRoute) -> Result<EffectiveConfig> {
        let full_name = route.to_string();
        let registry = self.sources.registry().get(&route.provider);

        let model_entries = self.sources.entries(&full_name);
        let provider_entries = self
            .sources
            .entries(&route.provider)
            .filter(|entry| entry.covers(&route.model));
        let chain: Vec<&ModelConfig> = model_entries.chain(provider_entries).collect();

        if chain.is_empty() && registry.is_none() {
            return Err(LlmaoError::Config(format!(
                "'{}' is not configured. Add a \"{}\" entry, list \"{}\" in the models of a \"{}\" entry, or use a registered provider",
                full_name, full_name, route.model, route.provider
            )));
        }

        let base_url = chain
            .iter()
            .find_map(|e| e.base_url.clone())
            .or_else(|| registry.map(|r| r.base_url.clone()))
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                LlmaoError::Config(format!(
                    "No base_url for '{}': provider '{}' is not in the built-in registry, so the configuration must set `base_url`",
                    full_name, route.provider
                ))
            })?;

        let mut keys: Vec<String> = chain
            .iter()
            .map(|e| non_blank(&e.keys))
            .find(|keys| !keys.is_empty())
            .unwrap_or_default();
        if keys.is_empty() {
            if let Some(key) = registry.and_then(|r| r.env_api_key()) {
                debug!(route = %full_name, "using API key from environment");
                keys.push(key);
            }
        }
        if keys.is_empty() {
            let env_hint = registry
                .and_then(|r| r.api_key_env.clone())
                .map(|var| format!(" or set {}", var))
                .unwrap_or_default();
            return Err(LlmaoError::Config(format!(
                "No API keys for '{}'. Add `keys` to its configuration{}",
                full_name, env_hint
            )));
        }

        let rotation_strategy = chain
            .iter()
            .find_map(|e| e.rotation_strategy)
            .unwrap_or_default();

        let auth = chain
            .iter()
            .find_map(|e| e.auth.clone())
            .or_else(|| registry.and_then(|r| r.auth.clone()))
            .unwrap_or_default();

        let protocol = chain
            .iter()
            .find_map(|e| e.protocol)
            .or_else(|| registry.and_then(|r| r.protocol))
            .unwrap_or_default();

        // Lowest precedence first so higher layers overwrite per key
        let mut headers = registry.map(|r| r.headers.clone()).unwrap_or_default();
        let mut param_mappings = registry
            .map(|r| r.param_mappings.clone())
            .unwrap_or_default();
        for entry in chain.iter().rev() {
            headers.extend(entry.headers.clone());
            param_mappings.extend(entry.param_mappings.clone());
        }

        Ok(EffectiveConfig {
            provider: route.provider.clone(),
            model: route.model.clone(),
            base_url,
            headers,
            keys,
            rotation_strategy,
            param_mappings,
            auth,
            protocol,
        })
    }
}

fn non_blank(keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter(|k| !k.trim().is_empty())
        .cloned()
        .collect()
}
