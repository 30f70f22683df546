//! Atomic counters for storage observability.
//!
//! All counters use relaxed ordering. They are diagnostic only and never
//! used for synchronization. Only cold events are counted; the
//! per-call get/set/remove path never touches a shared counter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global storage event counters.
pub struct LocalMetrics {
    /// Variables constructed (slot indices handed out).
    pub variables_registered: AtomicU64,
    /// Per-thread slot tables created (carried, fallback, or detached).
    pub tables_created: AtomicU64,
    /// Slot table growth events.
    pub table_expansions: AtomicU64,
    /// Lazy `initial` evaluations triggered by `get`.
    pub initializations: AtomicU64,
    /// `remove_all` passes that found a table to clear.
    pub remove_all_passes: AtomicU64,
    /// Process-wide fallback `destroy` calls.
    pub fallback_destroys: AtomicU64,
    /// Threads registered with the death watcher.
    pub threads_watched: AtomicU64,
    /// Death-watcher cleanup jobs that ran.
    pub death_jobs_run: AtomicU64,
}

impl LocalMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            variables_registered: AtomicU64::new(0),
            tables_created: AtomicU64::new(0),
            table_expansions: AtomicU64::new(0),
            initializations: AtomicU64::new(0),
            remove_all_passes: AtomicU64::new(0),
            fallback_destroys: AtomicU64::new(0),
            threads_watched: AtomicU64::new(0),
            death_jobs_run: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            variables_registered: Self::get(&self.variables_registered),
            tables_created: Self::get(&self.tables_created),
            table_expansions: Self::get(&self.table_expansions),
            initializations: Self::get(&self.initializations),
            remove_all_passes: Self::get(&self.remove_all_passes),
            fallback_destroys: Self::get(&self.fallback_destroys),
            threads_watched: Self::get(&self.threads_watched),
            death_jobs_run: Self::get(&self.death_jobs_run),
        }
    }
}

impl Default for LocalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub variables_registered: u64,
    pub tables_created: u64,
    pub table_expansions: u64,
    pub initializations: u64,
    pub remove_all_passes: u64,
    pub fallback_destroys: u64,
    pub threads_watched: u64,
    pub death_jobs_run: u64,
}

/// Global metrics instance.
static GLOBAL_METRICS: LocalMetrics = LocalMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static LocalMetrics {
    &GLOBAL_METRICS
}
