//! Prefetch effectiveness counters
//!
//! Tracked per pool:
//! - wait requests, prefetch hits, misses (synchronous fallback taken)
//! - evictions performed and copy failures observed
//! - deferrals (prefetch skipped because every slot was pinned)
//!
//! Counters are atomics so metric reads never contend with the compute
//! timeline; `hits + misses == requests` holds at every point.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe prefetch counters
#[derive(Debug, Default)]
pub struct PrefetchMetrics {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
    deferrals: AtomicU64,
}

impl PrefetchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferral(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent point-in-time snapshot for reporting
    pub fn snapshot(&self) -> PrefetchStats {
        PrefetchStats {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the prefetch counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub failures: u64,
    pub deferrals: u64,
}

impl PrefetchStats {
    /// Fraction of wait requests served without a synchronous load
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

impl std::fmt::Display for PrefetchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prefetch: {} requests, {} hits ({:.1}%), {} misses, {} evictions, {} failures, {} deferrals",
            self.requests,
            self.hits,
            self.hit_rate() * 100.0,
            self.misses,
            self.evictions,
            self.failures,
            self.deferrals,
        )
    }
}
