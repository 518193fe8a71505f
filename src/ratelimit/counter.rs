//! Fixed window counter entry.

/// Request count for one identifier inside a fixed window.
///
/// The window is hard-edged: once `now` passes `reset_time_ms` the next hit
/// starts a fresh window at count 1. A client can therefore burst up to
/// twice the limit across two adjacent windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    /// Requests counted in this window
    pub count: u64,
    /// When this window ends, epoch milliseconds
    pub reset_time_ms: u64,
}

impl WindowCounter {
    /// Open a new window containing one request.
    pub fn start(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            reset_time_ms: now_ms.saturating_add(window_ms),
        }
    }

    /// Whether the window has passed.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.reset_time_ms
    }

    /// Count a request.
    ///
    /// Returns `true` if the request is limited. A limited request does not
    /// increment the counter.
    pub fn hit(&mut self, now_ms: u64, limit: u64, window_ms: u64) -> bool {
        if self.is_expired(now_ms) {
            *self = Self::start(now_ms, window_ms);
            return false;
        }

        if self.count >= limit {
            return true;
        }

        self.count += 1;
        false
    }

    /// Remaining quota, without touching the counter.
    pub fn remaining(&self, now_ms: u64, limit: u64) -> u64 {
        if self.is_expired(now_ms) {
            limit
        } else {
            limit.saturating_sub(self.count)
        }
    }
}
