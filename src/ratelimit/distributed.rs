//! Distributed rate limiter using a shared sliding window log.
//!
//! Every instance talks to the same sorted-set store, so a client sees the
//! same limit no matter which instance serves it. The store's atomic batch is
//! the only synchronisation; this module adds no locking of its own.
//!
//! Any store failure (disabled, unreachable, timed out) fails open. The
//! mapping from error to "allow, full remaining" lives in
//! [`DistributedRateLimiter::fail_open`] and nowhere else.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{BackendKind, RateLimitBackend, RateLimitResult};
use super::policy::Policy;
use super::redis_store::RedisSortedSetStore;
use crate::clock::Clock;
use crate::config::RedisSettings;
use crate::error::StoreError;

/// Default bound on a single shared-store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(1000);

/// The operations the sliding window log needs from a shared store.
///
/// Implementations must run [`SharedStore::record`] as one atomic batch
/// across every process that uses the store.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically: drop entries scored at or below `window_start_ms`, count
    /// what is left, add `member` scored `now_ms`, and set the key to expire
    /// after `ttl_ms`. Returns the count taken before the insert.
    ///
    /// `window_start_ms` is negative while the window still reaches back
    /// before the epoch; nothing is dropped then.
    async fn record(
        &self,
        key: &str,
        window_start_ms: i64,
        now_ms: u64,
        member: &str,
        ttl_ms: u64,
    ) -> Result<u64, StoreError>;

    /// Remove one member from a key's log.
    async fn withdraw(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Delete a key's whole log.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Number of entries currently stored for a key.
    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A sliding window rate limiter backed by a [`SharedStore`].
///
/// Unlike the local limiter there is no read-only check: every call to
/// [`check_rate_limit`](Self::check_rate_limit) prunes the log, refreshes its
/// expiry and, when allowed, leaves a new entry behind. A denied attempt has
/// its entry withdrawn again so that retrying while blocked does not extend
/// the block.
pub struct DistributedRateLimiter {
    /// `None` when distributed mode is disabled
    store: Option<Arc<dyn SharedStore>>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl DistributedRateLimiter {
    /// Create a limiter over an existing store.
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            clock,
            timeout,
        }
    }

    /// Create a limiter that always fails open.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: None,
            clock,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Build from configuration.
    ///
    /// Missing credentials or a malformed URL leave the limiter disabled
    /// rather than failing start-up.
    pub fn from_settings(settings: &RedisSettings, clock: Arc<dyn Clock>) -> Self {
        let url = match (settings.enabled, settings.url.as_deref()) {
            (true, Some(url)) if !url.trim().is_empty() => url,
            (false, _) => {
                warn!("Distributed rate limiting is disabled; all checks will fail open");
                return Self::disabled(clock);
            }
            _ => {
                warn!("Distributed rate limiting enabled without a store URL; all checks will fail open");
                return Self::disabled(clock);
            }
        };

        match RedisSortedSetStore::new(url, settings.key_prefix.clone()) {
            Ok(store) => Self::new(Arc::new(store), clock, settings.timeout()),
            Err(err) => {
                warn!(error = %err, "Invalid shared store configuration; all checks will fail open");
                Self::disabled(clock)
            }
        }
    }

    /// Whether a shared store is configured.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Count a request for `id` against `limit` per `window_ms`.
    ///
    /// Never returns an error: store failures produce an allow.
    pub async fn check_rate_limit(&self, id: &str, limit: u64, window_ms: u64) -> RateLimitResult {
        let now = self.clock.now_ms();

        match self.try_check(id, limit, window_ms, now).await {
            Ok(result) => result,
            Err(err) => self.fail_open(id, limit, window_ms, now, &err),
        }
    }

    /// Delete all history for `id`.
    pub async fn reset(&self, id: &str) {
        let outcome = match self.store.as_ref() {
            Some(store) => self.bounded(store.remove(id)).await,
            None => Err(StoreError::Disabled),
        };

        if let Err(err) = outcome {
            warn!(id = %id, error = %err, "Failed to reset distributed rate limit");
        }
    }

    /// Number of log entries stored for `id`, or 0 if the store is unreachable.
    ///
    /// The log is only pruned by `check_rate_limit`, so this can include
    /// entries that have aged out since the last check.
    pub async fn get_count(&self, id: &str) -> u64 {
        let outcome = match self.store.as_ref() {
            Some(store) => self.bounded(store.cardinality(id)).await,
            None => Err(StoreError::Disabled),
        };

        outcome.unwrap_or_else(|err| {
            debug!(id = %id, error = %err, "Could not read distributed rate limit count");
            0
        })
    }

    /// Whether the shared store answers a liveness probe in time.
    pub async fn health_check(&self) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };

        match self.bounded(store.ping()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Shared rate limit store health check failed");
                false
            }
        }
    }

    async fn try_check(
        &self,
        id: &str,
        limit: u64,
        window_ms: u64,
        now: u64,
    ) -> Result<RateLimitResult, StoreError> {
        let store = self.store.as_ref().ok_or(StoreError::Disabled)?;

        let window_start = now as i64 - window_ms as i64;
        let member = format!("{}-{:016x}", now, rand::random::<u64>());

        let count = self
            .bounded(store.record(id, window_start, now, &member, window_ms))
            .await?;

        let allowed = count < limit;

        trace!(
            id = %id,
            count = count,
            limit = limit,
            allowed = allowed,
            "Distributed rate limit check"
        );

        if !allowed {
            debug!(id = %id, count = count, limit = limit, "Distributed rate limit exceeded");
            if let Err(err) = self.bounded(store.withdraw(id, &member)).await {
                warn!(id = %id, error = %err, "Failed to withdraw denied log entry");
            }
        }

        Ok(RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(count.saturating_add(1)),
            reset_ms: now.saturating_add(window_ms),
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    fn fail_open(
        &self,
        id: &str,
        limit: u64,
        window_ms: u64,
        now: u64,
        err: &StoreError,
    ) -> RateLimitResult {
        match err {
            StoreError::Disabled => {
                debug!(id = %id, "Distributed rate limiting disabled, allowing request");
            }
            _ => {
                warn!(id = %id, error = %err, "Shared rate limit store failed, allowing request");
            }
        }

        RateLimitResult::open(limit, now.saturating_add(window_ms))
    }
}

#[async_trait]
impl RateLimitBackend for DistributedRateLimiter {
    async fn check(&self, key: &str, policy: &Policy) -> RateLimitResult {
        self.check_rate_limit(key, policy.limit(), policy.window_ms())
            .await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    async fn health_check(&self) -> bool {
        DistributedRateLimiter::health_check(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Sorted-set store held in process memory, with an outage switch.
    #[derive(Default)]
    struct MemorySortedSets {
        sets: parking_lot::Mutex<HashMap<String, Vec<(u64, String)>>>,
        down: AtomicBool,
    }

    impl MemorySortedSets {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check_up(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SharedStore for MemorySortedSets {
        async fn record(
            &self,
            key: &str,
            window_start_ms: i64,
            now_ms: u64,
            member: &str,
            _ttl_ms: u64,
        ) -> Result<u64, StoreError> {
            self.check_up()?;
            let mut sets = self.sets.lock();
            let log = sets.entry(key.to_string()).or_default();
            log.retain(|(score, _)| *score as i64 > window_start_ms);
            let count = log.len() as u64;
            log.push((now_ms, member.to_string()));
            Ok(count)
        }

        async fn withdraw(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.check_up()?;
            if let Some(log) = self.sets.lock().get_mut(key) {
                log.retain(|(_, m)| m != member);
            }
            Ok(())
        }

        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.check_up()?;
            self.sets.lock().remove(key);
            Ok(())
        }

        async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
            self.check_up()?;
            Ok(self.sets.lock().get(key).map_or(0, |log| log.len() as u64))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.check_up()
        }
    }

    /// A store whose calls never complete.
    struct HangingStore;

    #[async_trait]
    impl SharedStore for HangingStore {
        async fn record(&self, _: &str, _: i64, _: u64, _: &str, _: u64) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        async fn withdraw(&self, _: &str, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn remove(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn cardinality(&self, _: &str) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn limiter_at(start_ms: u64) -> (Arc<ManualClock>, Arc<MemorySortedSets>, DistributedRateLimiter) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = Arc::new(MemorySortedSets::default());
        let limiter = DistributedRateLimiter::new(store.clone(), clock.clone(), DEFAULT_STORE_TIMEOUT);
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_sliding_window_precision() {
        let (clock, _store, limiter) = limiter_at(0);

        let first = limiter.check_rate_limit("client", 2, 1_000).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        clock.set(400);
        let second = limiter.check_rate_limit("client", 2, 1_000).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        clock.set(700);
        let third = limiter.check_rate_limit("client", 2, 1_000).await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(limiter.get_count("client").await, 2);

        clock.set(1_050);
        let fourth = limiter.check_rate_limit("client", 2, 1_000).await;
        assert!(fourth.allowed);
        assert_eq!(fourth.reset_ms, 2_050);
    }

    #[tokio::test]
    async fn test_window_reaching_before_epoch_keeps_entries() {
        let (clock, store, limiter) = limiter_at(0);

        assert!(limiter.check_rate_limit("early", 2, 1_000).await.allowed);
        clock.set(400);
        assert!(limiter.check_rate_limit("early", 2, 1_000).await.allowed);
        assert_eq!(store.cardinality("early").await.unwrap(), 2);

        // The entry stamped at 0 is still inside (-300, 700]
        clock.set(700);
        assert!(!limiter.check_rate_limit("early", 2, 1_000).await.allowed);

        // and drops out once the window start reaches it
        clock.set(1_000);
        assert!(limiter.check_rate_limit("early", 2, 1_000).await.allowed);
    }

    #[tokio::test]
    async fn test_precision_is_independent_of_base_time() {
        for base in [0, 1_700_000_000_000] {
            let (clock, _store, limiter) = limiter_at(base);
            let mut allowed = Vec::new();
            for offset in [0, 400, 700, 1_050] {
                clock.set(base + offset);
                allowed.push(limiter.check_rate_limit("client", 2, 1_000).await.allowed);
            }
            assert_eq!(allowed, [true, true, false, true], "base {}", base);
        }
    }

    #[tokio::test]
    async fn test_no_boundary_burst() {
        let (clock, _store, limiter) = limiter_at(0);

        clock.set(990);
        for _ in 0..3 {
            assert!(limiter.check_rate_limit("burst", 3, 1_000).await.allowed);
        }
        // A fixed window would have reset at 1000
        clock.set(1_010);
        assert!(!limiter.check_rate_limit("burst", 3, 1_000).await.allowed);
    }

    #[tokio::test]
    async fn test_check_mutates_the_log() {
        let (_clock, _store, limiter) = limiter_at(5_000);

        assert_eq!(limiter.get_count("writer").await, 0);
        limiter.check_rate_limit("writer", 10, 1_000).await;
        limiter.check_rate_limit("writer", 10, 1_000).await;
        assert_eq!(limiter.get_count("writer").await, 2);
    }

    #[tokio::test]
    async fn test_fail_open_during_outage() {
        let (_clock, store, limiter) = limiter_at(0);

        limiter.check_rate_limit("client", 1, 60_000).await;
        assert!(!limiter.check_rate_limit("client", 1, 60_000).await.allowed);

        store.set_down(true);
        assert!(!limiter.health_check().await);
        for _ in 0..5 {
            let result = limiter.check_rate_limit("client", 1, 60_000).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, 1);
        }

        store.set_down(false);
        assert!(limiter.health_check().await);
        assert!(!limiter.check_rate_limit("client", 1, 60_000).await.allowed);
    }

    #[tokio::test]
    async fn test_timeout_fails_open() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = DistributedRateLimiter::new(
            Arc::new(HangingStore),
            clock,
            Duration::from_millis(20),
        );

        let result = limiter.check_rate_limit("slow", 4, 1_000).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
        assert!(!limiter.health_check().await);
        assert_eq!(limiter.get_count("slow").await, 0);
    }

    #[tokio::test]
    async fn test_disabled_always_allows() {
        let limiter = DistributedRateLimiter::disabled(Arc::new(ManualClock::new(0)));
        assert!(!limiter.is_enabled());

        for _ in 0..10 {
            let result = limiter.check_rate_limit("anyone", 1, 1_000).await;
            assert!(result.allowed);
            assert_eq!(result.remaining, 1);
        }
        assert!(!limiter.health_check().await);
    }

    #[tokio::test]
    async fn test_settings_without_url_are_disabled() {
        let settings = RedisSettings {
            enabled: true,
            url: None,
            ..RedisSettings::default()
        };
        let limiter = DistributedRateLimiter::from_settings(&settings, Arc::new(ManualClock::new(0)));
        assert!(!limiter.is_enabled());
        assert!(limiter.check_rate_limit("x", 1, 1_000).await.allowed);
    }

    #[tokio::test]
    async fn test_settings_with_url_are_enabled() {
        let settings = RedisSettings {
            enabled: true,
            url: Some("redis://127.0.0.1:6379".to_string()),
            ..RedisSettings::default()
        };
        let limiter = DistributedRateLimiter::from_settings(&settings, Arc::new(ManualClock::new(0)));
        assert!(limiter.is_enabled());
    }

    #[tokio::test]
    async fn test_reset_semantics() {
        let (_clock, _store, limiter) = limiter_at(0);

        limiter.check_rate_limit("blocked", 1, 60_000).await;
        assert!(!limiter.check_rate_limit("blocked", 1, 60_000).await.allowed);

        limiter.reset("blocked").await;
        assert_eq!(limiter.get_count("blocked").await, 0);

        let result = limiter.check_rate_limit("blocked", 1, 60_000).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_remaining_bounded_by_limit() {
        let (clock, _store, limiter) = limiter_at(0);

        for step in 0..30u64 {
            clock.advance(step * 13);
            let result = limiter.check_rate_limit("bounded", 5, 200).await;
            assert!(result.remaining <= result.limit);
        }
    }

    #[tokio::test]
    async fn test_identifiers_do_not_interact() {
        let (_clock, _store, limiter) = limiter_at(0);

        limiter.check_rate_limit("a", 1, 1_000).await;
        assert!(!limiter.check_rate_limit("a", 1, 1_000).await.allowed);
        assert!(limiter.check_rate_limit("b", 1, 1_000).await.allowed);
    }
}
