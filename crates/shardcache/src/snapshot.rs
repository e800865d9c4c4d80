//! Periodic snapshot capture.
//!
//! One timer thread wakes every `snapshot_period` and, when enough mutations
//! have accumulated, performs the rotate-walk-release sequence:
//!
//! 1. exchange the dirty counter to zero;
//! 2. send `Rotate` to every log writer, so records submitted from here on
//!    land in fresh files;
//! 3. walk the live table, one stripe at a time, into `snapshot.tmp`, then
//!    rename it over `snapshot`;
//! 4. send `RotateDone`, releasing the pre-rotation tails.
//!
//! Every mutation applied before its stripe is walked is captured by the
//! walk, and every mutation submitted after the rotate lands in the new
//! logs, so deleting the old tails at step 4 loses nothing.
//!
//! If the walk fails the dirty count is restored and step 4 is skipped: the
//! previous snapshot plus the preserved tails plus the live logs still
//! reconstruct the table, and the next tick retries.
//!
//! The timer rearms unconditionally after each fire.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::stats::GlobalStats;
use crate::store::Store;
use crate::wal::{LogCommand, LogWriterPool};

/// The snapshot file under the data directory.
pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("snapshot")
}

fn snapshot_tmp_path(dir: &Path) -> PathBuf {
    dir.join("snapshot.tmp")
}

/// Handle on the timer thread. Dropping it stops the timer.
pub struct Snapshotter {
    control: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl Snapshotter {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        store: Arc<Store>,
        wal: Arc<LogWriterPool>,
        stats: Arc<GlobalStats>,
        recovering: Arc<AtomicBool>,
        period: Duration,
        change_threshold: u64,
        data_dir: PathBuf,
    ) -> Snapshotter {
        let (control, ticks) = mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name("shardcache-snapshot".to_string())
            .spawn(move || loop {
                let forced = match ticks.recv_timeout(period) {
                    Ok(()) => true,
                    Err(RecvTimeoutError::Timeout) => false,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                tick(&store, &wal, &stats, &recovering, change_threshold, &data_dir, forced);
            })
            .expect("failed to spawn the snapshot thread");
        Snapshotter { control: Some(control), join: Some(join) }
    }

    /// Capture a snapshot on the next wakeup regardless of the dirty count.
    pub fn trigger(&self) {
        if let Some(control) = &self.control {
            let _ = control.send(());
        }
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.control.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn tick(
    store: &Store,
    wal: &LogWriterPool,
    stats: &GlobalStats,
    recovering: &AtomicBool,
    change_threshold: u64,
    data_dir: &Path,
    forced: bool,
) {
    if recovering.load(Ordering::Acquire) {
        return;
    }
    if !forced
        && stats.changes_after_last_snapshot.load(Ordering::Relaxed) < change_threshold
    {
        return;
    }
    let taken = stats.take_changes();

    wal.broadcast(LogCommand::Rotate);
    match write_snapshot_file(store, data_dir) {
        Ok(records) => {
            wal.broadcast(LogCommand::RotateDone);
            stats.snapshots_taken.fetch_add(1, Ordering::Relaxed);
            log::info!("snapshot captured: {records} records");
        }
        Err(e) => {
            // The preserved tails stay on disk; together with the previous
            // snapshot and the new logs they still reconstruct the table.
            log::error!("snapshot failed: {e}");
            stats.restore_changes(taken);
        }
    }
}

fn write_snapshot_file(store: &Store, data_dir: &Path) -> std::io::Result<u64> {
    let tmp = snapshot_tmp_path(data_dir);
    let mut out = BufWriter::new(File::create(&tmp)?);
    let records = store.write_snapshot(&mut out)?;
    out.flush()?;
    drop(out);
    std::fs::rename(&tmp, snapshot_path(data_dir))?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreMode;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn harness(dir: &Path) -> (Arc<Store>, Arc<LogWriterPool>, Arc<GlobalStats>, Arc<AtomicBool>) {
        let store = Arc::new(Store::new(1, None));
        let recovering = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(GlobalStats::new());
        let wal = Arc::new(
            LogWriterPool::spawn(1, dir, Arc::clone(&recovering), Arc::clone(&stats))
                .expect("spawn wal pool"),
        );
        (store, wal, stats, recovering)
    }

    #[test]
    fn test_trigger_captures_snapshot_below_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, wal, stats, recovering) = harness(dir.path());
        store.store(b"k", std::sync::Arc::from(&b"v"[..]), 0, 0, StoreMode::Set);

        let snapshotter = Snapshotter::spawn(
            Arc::clone(&store),
            Arc::clone(&wal),
            Arc::clone(&stats),
            recovering,
            Duration::from_secs(3600),
            u64::MAX,
            dir.path().to_path_buf(),
        );
        snapshotter.trigger();
        assert!(
            wait_until(Duration::from_secs(5), || snapshot_path(dir.path()).exists()),
            "forced trigger must produce a snapshot file"
        );
        assert_eq!(stats.snapshots_taken.load(Ordering::Relaxed), 1);

        let bytes = std::fs::read(snapshot_path(dir.path())).expect("read snapshot");
        let ntotal = crate::item::peek_ntotal(&bytes).expect("one record");
        assert_eq!(bytes.len(), ntotal, "exactly one record in the snapshot");
    }

    #[test]
    fn test_timer_tick_respects_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, wal, stats, recovering) = harness(dir.path());

        let _snapshotter = Snapshotter::spawn(
            store,
            wal,
            stats,
            recovering,
            Duration::from_millis(10),
            1_000,
            dir.path().to_path_buf(),
        );
        std::thread::sleep(Duration::from_millis(100));
        assert!(
            !snapshot_path(dir.path()).exists(),
            "a clean table below the threshold must not snapshot"
        );
    }

    #[test]
    fn test_timer_tick_fires_once_dirty_enough() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, wal, stats, recovering) = harness(dir.path());
        store.store(b"k", std::sync::Arc::from(&b"v"[..]), 0, 0, StoreMode::Set);
        stats.count_change();

        let _snapshotter = Snapshotter::spawn(
            Arc::clone(&store),
            wal,
            Arc::clone(&stats),
            recovering,
            Duration::from_millis(10),
            1,
            dir.path().to_path_buf(),
        );
        assert!(
            wait_until(Duration::from_secs(5), || snapshot_path(dir.path()).exists()),
            "a dirty table at the threshold must snapshot on the next tick"
        );
        assert_eq!(
            stats.changes_after_last_snapshot.load(Ordering::Relaxed),
            0,
            "the dirty counter resets when the snapshot is taken"
        );
    }

    #[test]
    fn test_no_snapshot_while_recovering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, wal, stats, recovering) = harness(dir.path());
        recovering.store(true, Ordering::Release);
        stats.count_change();

        let snapshotter = Snapshotter::spawn(
            store,
            wal,
            stats,
            recovering,
            Duration::from_millis(10),
            1,
            dir.path().to_path_buf(),
        );
        snapshotter.trigger();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!snapshot_path(dir.path()).exists());
    }
}
