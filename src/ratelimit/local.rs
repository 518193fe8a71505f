//! Process-local fixed window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};

use super::backend::{BackendKind, RateLimitBackend, RateLimitResult};
use super::counter::WindowCounter;
use super::policy::Policy;
use crate::clock::Clock;

/// Default cadence for dropping expired windows.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory fixed window rate limiter.
///
/// Counters are keyed by the identifier string only. Callers that apply more
/// than one policy to the same client must scope the key themselves (see
/// `ClientIdentifier::scoped`).
///
/// Each check runs under the map's shard lock for that key, so the
/// check-then-increment for one identifier never interleaves with another
/// request for the same identifier, even on a multi-threaded runtime. State
/// is per process; use the distributed limiter to share limits across
/// instances.
pub struct LocalRateLimiter {
    /// Fixed window counters indexed by identifier
    entries: Arc<DashMap<String, WindowCounter>>,
    clock: Arc<dyn Clock>,
    /// Background sweep, if running
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRateLimiter {
    /// Create a limiter with no background sweep.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// Create a limiter and start its background sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_sweeper(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let limiter = Self::new(clock);
        limiter.start_sweeper(interval);
        limiter
    }

    /// Start (or restart) the periodic sweep of expired windows.
    pub fn start_sweeper(&self, interval: Duration) {
        let entries = Arc::clone(&self.entries);
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, interval));

            while ticks.next().await.is_some() {
                let removed = sweep_expired(&entries, clock.now_ms());
                if removed > 0 {
                    debug!(removed = removed, remaining = entries.len(), "Swept expired rate limit windows");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Local rate limit sweeper started");
    }

    /// Count a request and report whether it is over the limit.
    pub fn is_rate_limited(&self, id: &str, limit: u64, window_ms: u64) -> bool {
        self.hit(id, limit, window_ms).0
    }

    /// Remaining quota for `id`. Never modifies the counter.
    pub fn get_remaining(&self, id: &str, limit: u64) -> u64 {
        let now = self.clock.now_ms();
        self.entries
            .get(id)
            .map(|counter| counter.remaining(now, limit))
            .unwrap_or(limit)
    }

    /// End of the current window for `id`, epoch milliseconds.
    pub fn get_reset_time(&self, id: &str) -> Option<u64> {
        self.entries.get(id).map(|counter| counter.reset_time_ms)
    }

    /// Forget one identifier.
    pub fn reset(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Forget every identifier.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop windows that have already ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, self.clock.now_ms())
    }

    /// Stop the background sweep. Safe to call more than once.
    pub fn destroy(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            debug!("Local rate limit sweeper stopped");
        }
    }

    /// Whether the background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Get the number of tracked identifiers.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Count a request, returning `(limited, counter after the hit)`.
    fn hit(&self, id: &str, limit: u64, window_ms: u64) -> (bool, WindowCounter) {
        let now = self.clock.now_ms();

        let (limited, counter) = match self.entries.entry(id.to_string()) {
            Entry::Vacant(vacant) => {
                let counter = WindowCounter::start(now, window_ms);
                vacant.insert(counter);
                (false, counter)
            }
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                let limited = counter.hit(now, limit, window_ms);
                (limited, *counter)
            }
        };

        trace!(
            id = %id,
            count = counter.count,
            limit = limit,
            limited = limited,
            "Local rate limit check"
        );

        (limited, counter)
    }
}

impl Drop for LocalRateLimiter {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn sweep_expired(entries: &DashMap<String, WindowCounter>, now_ms: u64) -> usize {
    let before = entries.len();
    entries.retain(|_, counter| !counter.is_expired(now_ms));
    before.saturating_sub(entries.len())
}

#[async_trait]
impl RateLimitBackend for LocalRateLimiter {
    async fn check(&self, key: &str, policy: &Policy) -> RateLimitResult {
        let (limited, counter) = self.hit(key, policy.limit(), policy.window_ms());

        if limited {
            debug!(key = %key, policy = policy.name(), "Local rate limit exceeded");
        }

        RateLimitResult {
            allowed: !limited,
            limit: policy.limit(),
            remaining: policy.limit().saturating_sub(counter.count),
            reset_ms: counter.reset_time_ms,
        }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}
