//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::policy::Policy;

/// Which counter store a deployment runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local fixed window counters
    #[default]
    Local,
    /// Shared sliding window log
    Distributed,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => f.write_str("local"),
            BackendKind::Distributed => f.write_str("distributed"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "distributed" => Ok(BackendKind::Distributed),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

/// Outcome of one rate limit check. Computed per call, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The policy limit
    pub limit: u64,
    /// Requests left in the window, clamped to `0..=limit`
    pub remaining: u64,
    /// When the window resets, epoch milliseconds
    pub reset_ms: u64,
}

impl RateLimitResult {
    /// An allow that consumes nothing, used when the check itself could not run.
    pub fn open(limit: u64, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_ms,
        }
    }

    /// Reset time in whole epoch seconds, rounded up so it never falls
    /// before the window actually ends.
    pub fn reset_secs(&self) -> u64 {
        self.reset_ms.div_ceil(1000)
    }

    /// Seconds until reset, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the local `LocalRateLimiter` and the
/// `DistributedRateLimiter` so the HTTP gate can work with either. A
/// deployment picks one at start-up; they are never mixed per call.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Count one request for `key` against `policy`.
    async fn check(&self, key: &str, policy: &Policy) -> RateLimitResult;

    /// Which store this is.
    fn kind(&self) -> BackendKind;

    /// Whether the backing store is reachable.
    async fn health_check(&self) -> bool {
        true
    }
}
