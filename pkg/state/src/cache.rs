//! TTL-gated read-through cache.
//!
//! Bounds store read volume: a cached document may be re-fetched at most
//! once per TTL. The gate is an explicit `next_allowed_read_at` timestamp
//! checked against the injected clock, so no timer has to run to re-arm it.

/// A cached value plus the earliest time it may be re-fetched.
#[derive(Debug, Clone)]
pub struct ReadThroughCache<T> {
    value: T,
    next_allowed_read_at: i64,
    ttl_ms: u64,
}

impl<T> ReadThroughCache<T> {
    /// Cache a value fetched at `fetched_at`.
    pub fn new(value: T, fetched_at: i64, ttl_ms: u64) -> Self {
        Self {
            value,
            next_allowed_read_at: fetched_at.saturating_add(ttl_ms as i64),
            ttl_ms,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn next_allowed_read_at(&self) -> i64 {
        self.next_allowed_read_at
    }

    /// Whether a store read is allowed at `now`.
    ///
    /// A clock that jumped backwards by more than one TTL also re-opens the
    /// gate, otherwise the cache could be pinned until wall time catches up.
    pub fn is_due(&self, now: i64) -> bool {
        now >= self.next_allowed_read_at
            || self.next_allowed_read_at - now > self.ttl_ms as i64
    }

    /// Store a value freshly read from the store and close the gate for one TTL.
    pub fn refresh(&mut self, value: T, now: i64) {
        self.value = value;
        self.defer(now);
    }

    /// Replace the value with the result of a local write. The gate is left
    /// alone: a self-write needs no confirming read.
    pub fn replace(&mut self, value: T) {
        self.value = value;
    }

    /// Close the gate for one TTL without changing the value, e.g. after a
    /// failed fetch.
    pub fn defer(&mut self, now: i64) {
        self.next_allowed_read_at = now.saturating_add(self.ttl_ms as i64);
    }
}
