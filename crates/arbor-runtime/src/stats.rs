//! Daemon-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters exported for diagnostics.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Containers created since daemon start.
    pub containers_created: AtomicU64,
    /// Successful starts.
    pub containers_started: AtomicU64,
    /// Failed starts.
    pub containers_failed_start: AtomicU64,
    /// OOM events observed.
    pub containers_oom: AtomicU64,
    /// Dead containers removed by aging.
    pub removed_dead: AtomicU64,
    /// Containers currently registered.
    pub containers_count: AtomicU64,
}

impl Statistics {
    /// Bumps a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Drops a counter by one.
    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Reads a counter.
    #[must_use]
    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
