use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live counters for a single cache instance
///
/// Counters are updated with relaxed atomics on the hot path and read out as a
/// consistent-enough [`StatsSnapshot`] for logging and inspection. Exact
/// cross-counter consistency is not required; each counter is individually
/// accurate.
#[derive(Debug, Default)]
pub struct FlightStats {
    /// Calls answered from the cached value
    hits: AtomicU64,
    /// Calls that started a new flight
    misses: AtomicU64,
    /// Calls that joined an already in-flight load
    coalesced: AtomicU64,
    /// Flights that settled with a non-cancellation error
    failures: AtomicU64,
    /// Calls answered by the fallback producer
    fallbacks: AtomicU64,
}

impl FlightStats {
    /// Create a zeroed counter set
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            collected_at: Utc::now(),
        }
    }
}

/// Point-in-time view of cache activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Calls answered from the cached value
    pub hits: u64,
    /// Calls that started a new flight
    pub misses: u64,
    /// Calls that joined an already in-flight load
    pub coalesced: u64,
    /// Flights that settled with a non-cancellation error
    pub failures: u64,
    /// Calls answered by the fallback producer
    pub fallbacks: u64,
    /// Timestamp when the snapshot was taken
    pub collected_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Total calls observed by the cache
    pub fn total_calls(&self) -> u64 {
        self.hits + self.misses + self.coalesced
    }

    /// Fraction of calls served without starting a load (cached value or
    /// joining an existing flight). Returns 0.0 when no calls were observed.
    pub fn serve_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        (self.hits + self.coalesced) as f64 / total as f64
    }

    /// Render the snapshot as a JSON value for structured log lines
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
