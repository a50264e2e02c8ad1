//! API Key Pool Management
//!
//! Holds the credentials of one resolved route and hands them out under a
//! pluggable rotation policy. The round-robin cursor is the only mutable state
//! shared between concurrent requests.

use crate::config::RotationStrategy;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A single API key with usage tracking
pub struct ApiKey {
    /// The actual API key value
    value: String,

    /// Total number of times this key was handed out
    request_count: AtomicU64,
}

impl ApiKey {
    /// Create a new API key
    pub fn new(value: String) -> Self {
        Self {
            value,
            request_count: AtomicU64::new(0),
        }
    }

    /// Get the key value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Record usage of this key
    pub fn record_usage(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the request count
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("value", &"<redacted>")
            .field("request_count", &self.request_count())
            .finish()
    }
}

/// Chooses which key of a pool serves the next request.
///
/// Implementations must tolerate arbitrary concurrent calls.
pub trait RotationPolicy: Send + Sync + fmt::Debug {
    /// Index of the next key in a pool of `len` keys; `len` is never zero
    fn next_index(&self, len: usize) -> usize;
}

/// Cycles through keys in order, wrapping after the last
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the cycle at a given index
    pub fn starting_at(index: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(index),
        }
    }
}

impl RotationPolicy for RoundRobin {
    fn next_index(&self, len: usize) -> usize {
        // Read, compute and advance in one atomic step so no two callers see
        // the same pre-advance cursor. The cursor stays in [0, len).
        let previous = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c % len + 1) % len))
        {
            Ok(c) | Err(c) => c,
        };
        previous % len
    }
}

/// Uniform random selection
#[derive(Debug, Default)]
pub struct Random;

impl RotationPolicy for Random {
    fn next_index(&self, len: usize) -> usize {
        use std::collections::hash_map::RandomState;
        use std::hash::{BuildHasher, Hasher};

        // Each RandomState is freshly seeded, which is enough for spreading load
        let hasher = RandomState::new().build_hasher();
        hasher.finish() as usize % len
    }
}

/// Picks the key that has gone longest without use
#[derive(Debug, Default)]
pub struct LeastRecentlyUsed {
    state: Mutex<LruState>,
}

#[derive(Debug, Default)]
struct LruState {
    clock: u64,
    last_used: Vec<u64>,
}

impl LeastRecentlyUsed {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RotationPolicy for LeastRecentlyUsed {
    fn next_index(&self, len: usize) -> usize {
        let mut state = self.state.lock();
        if state.last_used.len() != len {
            state.last_used.resize(len, 0);
        }

        let idx = state
            .last_used
            .iter()
            .enumerate()
            .min_by_key(|(i, tick)| (**tick, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);

        state.clock += 1;
        let tick = state.clock;
        state.last_used[idx] = tick;
        idx
    }
}

/// Build the policy object for a configured strategy
pub fn policy_for(strategy: RotationStrategy) -> Box<dyn RotationPolicy> {
    match strategy {
        RotationStrategy::RoundRobin => Box::new(RoundRobin::new()),
        RotationStrategy::LeastRecentlyUsed => Box::new(LeastRecentlyUsed::new()),
        RotationStrategy::Random => Box::new(Random),
    }
}

/// A key handed out by the pool
#[derive(Clone, Copy)]
pub struct SelectedKey<'a> {
    /// Position in the pool; safe to log
    pub index: usize,
    value: &'a str,
}

impl<'a> SelectedKey<'a> {
    /// The credential itself
    pub fn value(&self) -> &'a str {
        self.value
    }
}

impl fmt::Debug for SelectedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedKey")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Pool of API keys with rotation support
#[derive(Debug)]
pub struct KeyPool {
    /// Available keys, in configured order
    keys: Vec<ApiKey>,

    /// Rotation policy
    policy: Box<dyn RotationPolicy>,
}

impl KeyPool {
    /// Create a key pool for a configured strategy
    pub fn new(keys: Vec<String>, strategy: RotationStrategy) -> Self {
        Self::with_policy(keys, policy_for(strategy))
    }

    /// Create a key pool with a custom policy
    pub fn with_policy(keys: Vec<String>, policy: Box<dyn RotationPolicy>) -> Self {
        Self {
            keys: keys.into_iter().map(ApiKey::new).collect(),
            policy,
        }
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of keys in the pool
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Hand out the next key under the pool's policy
    pub fn pick_next(&self) -> Option<SelectedKey<'_>> {
        if self.keys.is_empty() {
            return None;
        }

        let index = self.policy.next_index(self.keys.len()) % self.keys.len();
        let key = &self.keys[index];
        key.record_usage();

        Some(SelectedKey {
            index,
            value: key.value(),
        })
    }

    /// Get statistics about the pool
    pub fn stats(&self) -> KeyPoolStats {
        let requests_per_key: Vec<u64> = self.keys.iter().map(|k| k.request_count()).collect();

        KeyPoolStats {
            total_keys: self.keys.len(),
            total_requests: requests_per_key.iter().sum(),
            requests_per_key,
        }
    }
}

/// Statistics about a key pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPoolStats {
    pub total_keys: usize,
    pub total_requests: u64,
    /// Hand-out counts indexed like the pool
    pub requests_per_key: Vec<u64>,
}
