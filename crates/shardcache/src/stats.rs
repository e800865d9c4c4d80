//! Stats blocks.
//!
//! Each worker owns one [`StatsBlock`] guarded by its own mutex; only that
//! worker mutates it, so the mutex is uncontended except when an aggregation
//! pass reads all blocks in turn. Process-wide counters that multiple threads
//! bump live in [`GlobalStats`] as true atomics; in particular the dirty
//! counter is reset with a single atomic exchange so mutations submitted
//! between read and reset are never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Per-worker command counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct WorkerStats {
    pub conns_handled: u64,
    pub get_cmds: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub set_cmds: u64,
    pub delete_cmds: u64,
    pub delete_misses: u64,
    pub touch_cmds: u64,
    pub touch_misses: u64,
    pub incr_misses: u64,
    pub decr_misses: u64,
    pub cas_misses: u64,
    pub cas_badval: u64,
}

/// One worker's stats behind its own mutex.
#[derive(Default)]
pub struct StatsBlock {
    inner: Mutex<WorkerStats>,
}

impl StatsBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access for the owning worker.
    pub fn lock(&self) -> MutexGuard<'_, WorkerStats> {
        self.inner.lock().expect("stats block mutex poisoned")
    }

    /// Copy for an aggregation pass.
    pub fn snapshot(&self) -> WorkerStats {
        self.lock().clone()
    }
}

/// Process-wide counters.
#[derive(Default)]
pub struct GlobalStats {
    /// Operations dropped because a record pool could not grow.
    pub malloc_fails: AtomicU64,
    /// Mutations submitted to the log writers since the last snapshot began.
    pub changes_after_last_snapshot: AtomicU64,
    /// Snapshots successfully captured.
    pub snapshots_taken: AtomicU64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_malloc_fail(&self) {
        self.malloc_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_change(&self) {
        self.changes_after_last_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the dirty counter in one exchange.
    pub fn take_changes(&self) -> u64 {
        self.changes_after_last_snapshot.swap(0, Ordering::Relaxed)
    }

    /// Restore a previously taken dirty count after a failed snapshot so the
    /// next tick retries.
    pub fn restore_changes(&self, n: u64) {
        self.changes_after_last_snapshot.fetch_add(n, Ordering::Relaxed);
    }
}

/// Aggregated, serializable view over all workers plus the global counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StatsSnapshot {
    pub workers: WorkerStats,
    pub malloc_fails: u64,
    pub changes_after_last_snapshot: u64,
    pub snapshots_taken: u64,
    pub evictions: u64,
    pub items: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("stats snapshot is always serializable")
    }
}

/// Sum every worker block into one [`WorkerStats`].
pub fn aggregate_workers(blocks: &[&StatsBlock]) -> WorkerStats {
    let mut out = WorkerStats::default();
    for block in blocks {
        let s = block.snapshot();
        out.conns_handled += s.conns_handled;
        out.get_cmds += s.get_cmds;
        out.get_hits += s.get_hits;
        out.get_misses += s.get_misses;
        out.set_cmds += s.set_cmds;
        out.delete_cmds += s.delete_cmds;
        out.delete_misses += s.delete_misses;
        out.touch_cmds += s.touch_cmds;
        out.touch_misses += s.touch_misses;
        out.incr_misses += s.incr_misses;
        out.decr_misses += s.decr_misses;
        out.cas_misses += s.cas_misses;
        out.cas_badval += s.cas_badval;
    }
    out
}
