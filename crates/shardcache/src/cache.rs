//! The assembled cache: store, durability pipeline, snapshotter, recovery.
//!
//! [`Cache::open`] runs the startup sequence in order: create the data
//! directory, rebuild the table from disk (recovery completes before the
//! call returns), start the per-class log writers, start the snapshot timer.
//! Every mutating operation applies the change under the item lock and then
//! submits the new image (or a tombstone) to the matching log writer.
//!
//! The worker pool is deliberately not owned here: the dispatch fabric is
//! transport plumbing, and embedders wire a [`crate::worker::WorkerPool`]
//! whose connection handler calls into a shared `Cache`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::item::{self, Item};
use crate::recover::{self, ReplaySummary};
use crate::slab;
use crate::snapshot::Snapshotter;
use crate::stats::{aggregate_workers, GlobalStats, StatsBlock, StatsSnapshot};
use crate::store::{Store, StoreMode, StoreOutcome};
use crate::types::{CacheError, Settings, MAX_KEY_LEN};
use crate::wal::LogWriterPool;

/// A durable cache instance.
pub struct Cache {
    settings: Settings,
    replay: ReplaySummary,
    // Teardown order: the snapshot timer stops first, then the log writers
    // drain, then the store goes away.
    snapshotter: Snapshotter,
    wal: Arc<LogWriterPool>,
    store: Arc<Store>,
    stats: Arc<GlobalStats>,
    recovering: Arc<AtomicBool>,
}

impl Cache {
    /// Open (or create) the cache under `settings.data_dir`. Returns only
    /// after recovery has fully rebuilt the table.
    pub fn open(settings: Settings) -> Result<Cache, CacheError> {
        std::fs::create_dir_all(&settings.data_dir).map_err(|e| {
            CacheError::io(format!("create {}", settings.data_dir.display()), e)
        })?;

        let store = Arc::new(Store::new(settings.num_threads, settings.shard_capacity));
        let stats = Arc::new(GlobalStats::new());
        let recovering = Arc::new(AtomicBool::new(false));

        let replay = recover::run(Arc::clone(&store), &settings.data_dir, &recovering)?;

        let max_ntotal = item::HEADER_LEN + MAX_KEY_LEN + settings.max_item_size;
        let wal = Arc::new(LogWriterPool::spawn(
            slab::class_count(max_ntotal),
            &settings.data_dir,
            Arc::clone(&recovering),
            Arc::clone(&stats),
        )?);

        let snapshotter = Snapshotter::spawn(
            Arc::clone(&store),
            Arc::clone(&wal),
            Arc::clone(&stats),
            Arc::clone(&recovering),
            settings.snapshot_period,
            settings.snapshot_change_threshold,
            settings.data_dir.clone(),
        );

        log::info!(
            "cache open under {}: {} items recovered, {} log writers",
            settings.data_dir.display(),
            store.item_count(),
            wal.writer_count()
        );

        Ok(Cache { settings, replay, snapshotter, wal, store, stats, recovering })
    }

    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(CacheError::KeyTooLong { len: key.len() });
        }
        if value.len() > self.settings.max_item_size {
            return Err(CacheError::ValueTooLarge {
                len: value.len(),
                limit: self.settings.max_item_size,
            });
        }
        Ok(())
    }

    fn apply_store(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
        mode: StoreMode,
    ) -> Result<(StoreOutcome, Option<u64>), CacheError> {
        self.validate(key, value)?;
        let (outcome, stored) =
            self.store.store(key, Arc::from(value), flags, exptime, mode);
        let cas = stored.as_ref().map(|it| it.cas);
        if let Some(it) = stored {
            self.wal.submit(item::encode_linked(key, &it));
        }
        Ok((outcome, cas))
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Look up a key. Misses and lazy expiry need no log record.
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        self.store.get(key)
    }

    /// Unconditional store; returns the new cas token.
    pub fn set(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<u64, CacheError> {
        match self.apply_store(key, value, flags, exptime, StoreMode::Set)? {
            (_, Some(cas)) => Ok(cas),
            _ => unreachable!("an unconditional set always stores"),
        }
    }

    /// Store only if absent.
    pub fn add(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<StoreOutcome, CacheError> {
        Ok(self.apply_store(key, value, flags, exptime, StoreMode::Add)?.0)
    }

    /// Store only if present.
    pub fn replace(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
    ) -> Result<StoreOutcome, CacheError> {
        Ok(self.apply_store(key, value, flags, exptime, StoreMode::Replace)?.0)
    }

    /// Store only if the entry still carries `token`.
    pub fn cas(
        &self,
        key: &[u8],
        value: &[u8],
        flags: u32,
        exptime: u32,
        token: u64,
    ) -> Result<StoreOutcome, CacheError> {
        Ok(self.apply_store(key, value, flags, exptime, StoreMode::Cas(token))?.0)
    }

    /// Remove a key. A hit logs a tombstone so the removal survives a crash.
    pub fn delete(&self, key: &[u8]) -> bool {
        match self.store.remove(key) {
            Some(it) => {
                self.wal.submit(item::encode_tombstone(key, &it));
                true
            }
            None => false,
        }
    }

    /// Update the expiration of a live entry.
    pub fn touch(&self, key: &[u8], exptime: u32) -> bool {
        match self.store.touch(key, exptime) {
            Some(it) => {
                self.wal.submit(item::encode_linked(key, &it));
                true
            }
            None => false,
        }
    }

    /// Increment a decimal value, wrapping at u64.
    pub fn incr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, CacheError> {
        self.delta(key, true, delta)
    }

    /// Decrement a decimal value, saturating at zero.
    pub fn decr(&self, key: &[u8], delta: u64) -> Result<Option<u64>, CacheError> {
        self.delta(key, false, delta)
    }

    fn delta(&self, key: &[u8], incr: bool, delta: u64) -> Result<Option<u64>, CacheError> {
        match self.store.add_delta(key, incr, delta)? {
            Some((value, it)) => {
                self.wal.submit(item::encode_linked(key, &it));
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Drop every expired item. The corpses need no tombstones; their images
    /// carry their own expiration.
    pub fn flush_expired(&self) -> u64 {
        self.store.flush_expired()
    }

    // ── Introspection and control ────────────────────────────────────────────

    /// Capture a snapshot on the snapshotter's next wakeup regardless of the
    /// dirty count.
    pub fn trigger_snapshot(&self) {
        self.snapshotter.trigger();
    }

    /// What recovery replayed when this instance opened.
    pub fn replay_summary(&self) -> &ReplaySummary {
        &self.replay
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn item_count(&self) -> u64 {
        self.store.item_count()
    }

    /// The item store, for embedders wiring lock-mode switches or maintenance.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The log-writer pool, for embedders driving rotation directly.
    pub fn log_writers(&self) -> &Arc<LogWriterPool> {
        &self.wal
    }

    pub fn global_stats(&self) -> &Arc<GlobalStats> {
        &self.stats
    }

    /// True while startup recovery is replaying.
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Aggregate worker blocks and the global counters into one view.
    pub fn stats_snapshot(&self, worker_blocks: &[&StatsBlock]) -> StatsSnapshot {
        use std::sync::atomic::Ordering;
        StatsSnapshot {
            workers: aggregate_workers(worker_blocks),
            malloc_fails: self.stats.malloc_fails.load(Ordering::Relaxed),
            changes_after_last_snapshot: self
                .stats
                .changes_after_last_snapshot
                .load(Ordering::Relaxed),
            snapshots_taken: self.stats.snapshots_taken.load(Ordering::Relaxed),
            evictions: self.store.evictions(),
            items: self.store.item_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::log_path;

    fn open_in(dir: &std::path::Path) -> Cache {
        Cache::open(Settings {
            num_threads: 1,
            data_dir: dir.to_path_buf(),
            ..Settings::default()
        })
        .expect("open cache")
    }

    #[test]
    fn test_set_get_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_in(dir.path());

        let cas = cache.set(b"k", b"v", 3, 0).expect("set");
        assert!(cas > 0);
        let it = cache.get(b"k").expect("hit");
        assert_eq!(&*it.value, b"v");
        assert_eq!(it.flags, 3);

        assert!(cache.delete(b"k"));
        assert!(cache.get(b"k").is_none());
        assert!(!cache.delete(b"k"));
    }

    #[test]
    fn test_key_and_value_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = Cache::open(Settings {
            num_threads: 1,
            data_dir: dir.path().to_path_buf(),
            max_item_size: 8,
            ..Settings::default()
        })
        .expect("open cache");

        assert!(matches!(cache.set(b"", b"v", 0, 0), Err(CacheError::KeyTooLong { .. })));
        let long_key = vec![b'x'; MAX_KEY_LEN + 1];
        assert!(matches!(
            cache.set(&long_key, b"v", 0, 0),
            Err(CacheError::KeyTooLong { .. })
        ));
        assert!(matches!(
            cache.set(b"k", &[0u8; 9], 0, 0),
            Err(CacheError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_mutations_reach_the_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let cache = open_in(dir.path());
            cache.set(b"k", b"v", 0, 0).expect("set");
            cache.delete(b"k");
        }
        // Both images share a size class; set then tombstone, in order.
        let class = crate::slab::clsid(item::HEADER_LEN + 1 + 1);
        let bytes = std::fs::read(log_path(dir.path(), class)).expect("read log");
        let first = crate::item::peek_ntotal(&bytes).expect("first record");
        let set_img = crate::item::decode(&bytes[..first]).expect("decode set");
        assert!(set_img.linked);
        let del_img = crate::item::decode(&bytes[first..]).expect("decode delete");
        assert!(!del_img.linked);
        assert_eq!(del_img.key, b"k");
    }

    #[test]
    fn test_incr_decr_logged_and_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_in(dir.path());
        cache.set(b"n", b"41", 0, 0).expect("set");
        assert_eq!(cache.incr(b"n", 1).expect("incr"), Some(42));
        assert_eq!(cache.decr(b"n", 50).expect("decr"), Some(0));
        assert_eq!(cache.incr(b"missing", 1).expect("incr"), None);
    }

    #[test]
    fn test_stats_snapshot_counts_items() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open_in(dir.path());
        cache.set(b"a", b"1", 0, 0).expect("set");
        cache.set(b"b", b"2", 0, 0).expect("set");
        let snap = cache.stats_snapshot(&[]);
        assert_eq!(snap.items, 2);
        assert_eq!(snap.changes_after_last_snapshot, 2);
        assert!(snap.to_json().contains("\"items\":2"));
    }
}
