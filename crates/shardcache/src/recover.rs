//! Startup recovery: rebuild the table from the snapshot and the per-class
//! logs before any traffic is admitted.
//!
//! Replay order is: `snapshot`, then for each class in ascending order its
//! preserved pre-rotation tail (`log_<s>.snapshot_before`, if one survived a
//! crash mid-snapshot) followed by the live `log_<s>`. Within a file,
//! records replay in file order, which is submission order.
//!
//! The replay runs on a dedicated thread whose item-lock mode is global, so
//! one lock protects the whole rebuild; joining that thread is the startup
//! barrier. While the `recovering` flag is up, log submission is a no-op, so
//! the replay itself never generates records.
//!
//! ## File parsing
//!
//! A log or snapshot file is a contiguous stream of item images. `redo_file`
//! reads through a fixed 8 MiB buffer; when the residue is too short for the
//! next record it is copied to the front and the buffer refilled. This bounds
//! the largest replayable image: a record longer than the buffer fails the
//! replay deterministically. A torn final record (the crash landed mid-append)
//! is tolerated and ends the file.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::item;
use crate::snapshot::snapshot_path;
use crate::store::Store;
use crate::types::CacheError;
use crate::wal::{log_path, rotated_log_path};

/// Replay buffer size; also the upper bound on a recoverable item image.
pub const REPLAY_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// What a recovery pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Files that existed and were replayed.
    pub files: usize,
    /// Linked images applied.
    pub linked: u64,
    /// Tombstones applied.
    pub unlinked: u64,
    /// Records skipped because they did not decode.
    pub skipped: u64,
}

/// Run recovery over `data_dir`, blocking until the rebuild is complete.
pub fn run(
    store: Arc<Store>,
    data_dir: &Path,
    recovering: &Arc<AtomicBool>,
) -> Result<ReplaySummary, CacheError> {
    recovering.store(true, Ordering::Release);
    let dir = data_dir.to_path_buf();
    let result = std::thread::Builder::new()
        .name("shardcache-recover".to_string())
        .spawn(move || {
            crate::store::set_thread_lock_mode(crate::types::LockMode::Global);
            replay_all(&store, &dir)
        })
        .map_err(|e| CacheError::io("spawn recovery thread", e))?
        .join()
        .map_err(|_| CacheError::RecoveryFailed)?;
    recovering.store(false, Ordering::Release);
    result
}

fn replay_all(store: &Store, dir: &Path) -> Result<ReplaySummary, CacheError> {
    let mut summary = ReplaySummary::default();
    redo_file(store, &snapshot_path(dir), REPLAY_BUFFER_SIZE, &mut summary)?;

    let mut class = 0;
    loop {
        let live = log_path(dir, class);
        if !live.exists() {
            break;
        }
        redo_file(store, &rotated_log_path(dir, class), REPLAY_BUFFER_SIZE, &mut summary)?;
        redo_file(store, &live, REPLAY_BUFFER_SIZE, &mut summary)?;
        class += 1;
    }
    log::info!(
        "recovery replayed {} files: {} linked, {} unlinked, {} skipped",
        summary.files,
        summary.linked,
        summary.unlinked,
        summary.skipped
    );
    Ok(summary)
}

/// Replay one file of concatenated item images. A missing file is a no-op.
fn redo_file(
    store: &Store,
    path: &Path,
    buffer_size: usize,
    summary: &mut ReplaySummary,
) -> Result<(), CacheError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CacheError::io(format!("open {}", path.display()), e)),
    };
    summary.files += 1;

    let mut buf = vec![0u8; buffer_size];
    let mut filled = 0usize;
    let mut eof = false;
    loop {
        while !eof && filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| CacheError::io(format!("read {}", path.display()), e))?;
            if n == 0 {
                eof = true;
            } else {
                filled += n;
            }
        }

        let mut pos = 0usize;
        while let Some(ntotal) = item::peek_ntotal(&buf[pos..filled]) {
            if ntotal > buf.len() {
                return Err(CacheError::OversizeReplayRecord { ntotal, limit: buf.len() });
            }
            if pos + ntotal > filled {
                break;
            }
            apply_record(store, &buf[pos..pos + ntotal], summary);
            pos += ntotal;
        }

        if eof {
            if pos < filled {
                log::warn!(
                    "{} trailing bytes in {}; treating them as a torn final record",
                    filled - pos,
                    path.display()
                );
            }
            return Ok(());
        }
        // Short residue: move the tail to the front and refill behind it.
        buf.copy_within(pos..filled, 0);
        filled -= pos;
    }
}

fn apply_record(store: &Store, bytes: &[u8], summary: &mut ReplaySummary) {
    match item::decode(bytes) {
        Err(e) => {
            summary.skipped += 1;
            log::warn!("skipping an undecodable replay record: {e}");
        }
        Ok(image) if image.linked => {
            store.link_replayed(image.key, image.to_item());
            summary.linked += 1;
        }
        Ok(image) => {
            store.unlink_replayed(image.key);
            summary.unlinked += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{encode_linked, encode_tombstone, Item};
    use std::io::Write;

    fn item_with(value: &[u8], cas: u64) -> Item {
        Item { flags: 0, exptime: 0, cas, value: Arc::from(value) }
    }

    fn write_file(path: &Path, chunks: &[&[u8]]) {
        let mut f = File::create(path).expect("create file");
        for chunk in chunks {
            f.write_all(chunk).expect("write chunk");
        }
    }

    fn fresh() -> (Arc<Store>, Arc<AtomicBool>) {
        (Arc::new(Store::new(1, None)), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_empty_directory_recovers_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(summary, ReplaySummary::default());
        assert_eq!(store.item_count(), 0);
        assert!(!recovering.load(Ordering::Acquire), "flag must drop after recovery");
    }

    #[test]
    fn test_empty_log_file_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(&log_path(dir.path(), 0), &[]);
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(summary.files, 1);
        assert_eq!(summary.linked + summary.unlinked + summary.skipped, 0);
        assert_eq!(store.item_count(), 0);
    }

    #[test]
    fn test_link_then_tombstone_leaves_key_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let it = item_with(b"1", 1);
        write_file(
            &log_path(dir.path(), 0),
            &[&encode_linked(b"k", &it), &encode_tombstone(b"k", &it)],
        );
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!((summary.linked, summary.unlinked), (1, 1));
        assert!(store.get(b"k").is_none(), "tombstone replayed after the link wins");
    }

    #[test]
    fn test_duplicate_links_last_one_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(
            &log_path(dir.path(), 0),
            &[
                &encode_linked(b"k", &item_with(b"v1", 1)),
                &encode_linked(b"k", &item_with(b"v2", 2)),
            ],
        );
        let (store, recovering) = fresh();
        run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(&*store.get(b"k").expect("hit").value, b"v2");
        assert_eq!(store.item_count(), 1);
    }

    #[test]
    fn test_rotated_tail_replays_before_live_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(
            &rotated_log_path(dir.path(), 0),
            &[&encode_linked(b"k", &item_with(b"old", 1))],
        );
        write_file(&log_path(dir.path(), 0), &[&encode_linked(b"k", &item_with(b"new", 2))]);
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(summary.files, 2);
        assert_eq!(&*store.get(b"k").expect("hit").value, b"new");
    }

    #[test]
    fn test_snapshot_replays_before_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(
            &snapshot_path(dir.path()),
            &[&encode_linked(b"k", &item_with(b"from-snapshot", 1))],
        );
        let it = item_with(b"from-snapshot", 1);
        write_file(&log_path(dir.path(), 0), &[&encode_tombstone(b"k", &it)]);
        let (store, recovering) = fresh();
        run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert!(store.get(b"k").is_none(), "the later tombstone must override the snapshot");
    }

    #[test]
    fn test_multiple_classes_replay_in_ascending_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(&log_path(dir.path(), 0), &[&encode_linked(b"small", &item_with(b"s", 1))]);
        // A bigger image that a class-1 writer would own.
        write_file(
            &log_path(dir.path(), 1),
            &[&encode_linked(b"large", &item_with(&[9u8; 80], 2))],
        );
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(summary.linked, 2);
        assert!(store.get(b"small").is_some());
        assert!(store.get(b"large").is_some());
    }

    #[test]
    fn test_class_scan_stops_at_first_gap() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(&log_path(dir.path(), 0), &[&encode_linked(b"a", &item_with(b"1", 1))]);
        // log_1 missing; log_2 must be ignored.
        write_file(&log_path(dir.path(), 2), &[&encode_linked(b"c", &item_with(b"3", 2))]);
        let (store, recovering) = fresh();
        run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert!(store.get(b"a").is_some());
        assert!(store.get(b"c").is_none(), "files past a gap are not scanned");
    }

    #[test]
    fn test_small_buffer_forces_refills() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), 0);
        let images: Vec<Box<[u8]>> = (0..32)
            .map(|i| encode_linked(format!("key-{i:02}").as_bytes(), &item_with(b"abcdef", i)))
            .collect();
        let refs: Vec<&[u8]> = images.iter().map(|b| &**b).collect();
        write_file(&path, &refs);

        let (store, _) = fresh();
        let mut summary = ReplaySummary::default();
        // A buffer barely above one record length forces a tail copy per record.
        redo_file(&store, &path, images[0].len() + 7, &mut summary).expect("redo");
        assert_eq!(summary.linked, 32);
        assert_eq!(store.item_count(), 32);
    }

    #[test]
    fn test_record_just_filling_the_buffer_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), 0);
        let image = encode_linked(b"k", &item_with(&[5u8; 100], 1));
        write_file(&path, &[&image]);

        let (store, _) = fresh();
        let mut summary = ReplaySummary::default();
        redo_file(&store, &path, image.len(), &mut summary).expect("redo");
        assert_eq!(summary.linked, 1);
    }

    #[test]
    fn test_record_larger_than_buffer_fails_deterministically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = log_path(dir.path(), 0);
        let image = encode_linked(b"k", &item_with(&[5u8; 100], 1));
        write_file(&path, &[&image]);

        let (store, _) = fresh();
        let mut summary = ReplaySummary::default();
        let err = redo_file(&store, &path, image.len() - 1, &mut summary)
            .expect_err("oversize record must fail");
        assert!(matches!(err, CacheError::OversizeReplayRecord { .. }), "got: {err}");
    }

    #[test]
    fn test_torn_final_record_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let whole = encode_linked(b"whole", &item_with(b"v", 1));
        let torn = encode_linked(b"torn", &item_with(b"vvvv", 2));
        write_file(&log_path(dir.path(), 0), &[&whole, &torn[..torn.len() - 3]]);

        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!(summary.linked, 1);
        assert!(store.get(b"whole").is_some());
        assert!(store.get(b"torn").is_none());
    }

    #[test]
    fn test_undecodable_record_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let it = item_with(b"v", 1);
        let mut bad = encode_linked(b"bad", &it).into_vec();
        bad[0] = 9; // invalid kind, lengths untouched
        write_file(
            &log_path(dir.path(), 0),
            &[&bad, &encode_linked(b"good", &it)],
        );
        let (store, recovering) = fresh();
        let summary = run(Arc::clone(&store), dir.path(), &recovering).expect("recover");
        assert_eq!((summary.linked, summary.skipped), (1, 1));
        assert!(store.get(b"good").is_some());
        assert!(store.get(b"bad").is_none());
    }
}
