//! Router Module
//!
//! Handles model routing, API key rotation and outbound request dispatch.

pub mod dispatch;
pub mod key_pool;
pub mod strategy;

pub use dispatch::RequestRouter;
pub use key_pool::{
    ApiKey, KeyPool, KeyPoolStats, LeastRecentlyUsed, Random, RotationPolicy, RoundRobin,
    SelectedKey,
};
pub use strategy::ModelRoute;
