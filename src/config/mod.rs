//! Configuration Module
//!
//! Handles configuration loading, layering and resolution.

pub mod loader;
pub mod provider;
pub mod resolver;

pub use loader::{builtin_registry, ConfigLoader};
pub use provider::{
    AuthScheme, ModelConfig, Protocol, ProviderConfig, ProviderRegistry, ProvidersConfig,
    RotationStrategy,
};
pub use resolver::{ConfigResolver, EffectiveConfig, Route};
