//! Per-size-class append logs.
//!
//! ## Design
//!
//! One writer thread per size class, each owning a queue of log records and
//! the append handle on `log_<class>`. Producers never touch the files: a
//! mutation is logged by deep-copying the item's wire image at submission
//! time (so the producer's original can be freed or evicted without racing
//! the writer), pushing the copy onto the class queue, and sending one
//! `Append` over the writer's notify channel.
//!
//! Within one writer, records reach the disk in submission order. There is
//! no ordering across writers; size classes partition items, and replay
//! walks classes sequentially.
//!
//! ## Rotation
//!
//! `Rotate` closes the current file, renames it to
//! `log_<class>.snapshot_before` and reopens a fresh `log_<class>`; from the
//! producers' view the substitution is atomic because it happens between two
//! dequeues. Records submitted before the rotate command never land in the
//! post-rotation file. `RotateDone` unlinks the preserved tail once the
//! snapshotter has captured the state preceding the rotation.
//!
//! ## Failure policy
//!
//! No retries anywhere. A writer whose file failed to open keeps draining
//! its queue and discards records with an error log; a dropped record is
//! expected to be covered by a later snapshot.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use crate::arena::{Handle, RecordPool, LOG_RECORD_CHUNK};
use crate::queue::WorkQueue;
use crate::slab;
use crate::stats::GlobalStats;
use crate::types::CacheError;
use crate::worker::InitBarrier;

/// Command alphabet of a log writer's notify channel.
#[derive(Debug, Clone, Copy)]
pub enum LogCommand {
    /// Pop one record and append its image to the current file.
    Append,
    /// Swap in a fresh log file, preserving the old one as
    /// `log_<class>.snapshot_before`.
    Rotate,
    /// Unlink `log_<class>.snapshot_before`.
    RotateDone,
}

/// Live log file of a class.
pub fn log_path(dir: &Path, class: usize) -> PathBuf {
    dir.join(format!("log_{class}"))
}

/// Pre-rotation tail of a class, present between rotate-begin and
/// snapshot-complete.
pub fn rotated_log_path(dir: &Path, class: usize) -> PathBuf {
    dir.join(format!("log_{class}.snapshot_before"))
}

struct WriterHandle {
    sender: Sender<LogCommand>,
    queue: Arc<WorkQueue<Handle>>,
}

/// The pool of per-class log writers.
pub struct LogWriterPool {
    writers: Vec<WriterHandle>,
    joins: Vec<JoinHandle<()>>,
    records: Arc<RecordPool<Box<[u8]>>>,
    recovering: Arc<AtomicBool>,
    stats: Arc<GlobalStats>,
}

impl LogWriterPool {
    /// Spawn one writer per class under `data_dir` and block until all of
    /// them are wired up. File-open failures are not fatal (the writer runs
    /// discarding); a missing data directory is.
    pub fn spawn(
        class_count: usize,
        data_dir: &Path,
        recovering: Arc<AtomicBool>,
        stats: Arc<GlobalStats>,
    ) -> Result<LogWriterPool, CacheError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| CacheError::io(format!("create {}", data_dir.display()), e))?;

        let barrier = Arc::new(InitBarrier::new());
        let records = Arc::new(RecordPool::new(LOG_RECORD_CHUNK));

        let mut writers = Vec::with_capacity(class_count);
        let mut joins = Vec::with_capacity(class_count);
        for class in 0..class_count {
            let (sender, receiver) = mpsc::channel();
            let queue = Arc::new(WorkQueue::new());
            let path = log_path(data_dir, class);
            let rotated = rotated_log_path(data_dir, class);
            let file = open_append(&path);

            let thread_queue = Arc::clone(&queue);
            let thread_records = Arc::clone(&records);
            let thread_barrier = Arc::clone(&barrier);
            let join = std::thread::Builder::new()
                .name(format!("shardcache-wal-{class}"))
                .spawn(move || {
                    writer_loop(
                        class,
                        path,
                        rotated,
                        file,
                        receiver,
                        thread_queue,
                        thread_records,
                        thread_barrier,
                    )
                })
                .map_err(|e| CacheError::io("spawn log writer", e))?;

            writers.push(WriterHandle { sender, queue });
            joins.push(join);
        }
        barrier.wait_for(class_count);

        Ok(LogWriterPool { writers, joins, records, recovering, stats })
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// Submit one owned image copy for durable append. No-op while recovery
    /// is replaying. The class is derived from the image's own length.
    pub fn submit(&self, image: Box<[u8]>) {
        if self.recovering.load(Ordering::Acquire) {
            return;
        }
        let class = slab::clsid(image.len());
        let Some(writer) = self.writers.get(class) else {
            log::error!("no log writer for class {class} ({} byte image); record dropped", image.len());
            return;
        };
        let Some(handle) = self.records.alloc(image) else {
            self.stats.count_malloc_fail();
            return;
        };
        writer.queue.push(handle);
        if writer.sender.send(LogCommand::Append).is_err() {
            log::error!("log writer {class} notify channel is closed; record stranded");
        }
        self.stats.count_change();
    }

    /// Send `command` to every writer, in class order.
    pub fn broadcast(&self, command: LogCommand) {
        for (class, writer) in self.writers.iter().enumerate() {
            if writer.sender.send(command).is_err() {
                log::error!("log writer {class} notify channel is closed");
            }
        }
    }

    /// Chunk allocations performed by the record pool so far.
    pub fn record_chunk_allocations(&self) -> u64 {
        self.records.chunk_allocations()
    }
}

impl Drop for LogWriterPool {
    fn drop(&mut self) {
        // Closing the channels ends the writer loops; commands already sent
        // (including pending appends) are still delivered first.
        self.writers.clear();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

fn append_one(
    class: usize,
    path: &Path,
    file: &mut Option<File>,
    queue: &WorkQueue<Handle>,
    records: &RecordPool<Box<[u8]>>,
) {
    let Some(handle) = queue.pop() else { return };
    // Taking the record recycles its slot; the image itself is freed when it
    // goes out of scope below.
    let image = records.take(handle);
    match file.as_mut() {
        None => {
            log::error!("log writer {class} has no open file; record dropped");
        }
        Some(f) => {
            if let Err(e) = f.write_all(&image).and_then(|()| f.flush()) {
                log::error!("append to {} failed: {e}", path.display());
            }
        }
    }
}

fn open_append(path: &Path) -> Option<File> {
    match OpenOptions::new().append(true).create(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            log::error!("cannot open {}: {e}", path.display());
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn writer_loop(
    class: usize,
    path: PathBuf,
    rotated: PathBuf,
    mut file: Option<File>,
    receiver: Receiver<LogCommand>,
    queue: Arc<WorkQueue<Handle>>,
    records: Arc<RecordPool<Box<[u8]>>>,
    barrier: Arc<InitBarrier>,
) {
    barrier.register();
    loop {
        let command = match receiver.recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        match command {
            LogCommand::Append => {
                append_one(class, &path, &mut file, &queue, &records);
            }
            LogCommand::Rotate => {
                // Drain first: everything already queued was submitted before
                // the rotate and belongs in the pre-rotation file. The append
                // commands those records also sent will find an empty queue
                // later, which pop treats as a stale wakeup.
                while !queue.is_empty() {
                    append_one(class, &path, &mut file, &queue, &records);
                }
                // Drop closes the current handle before the rename.
                file = None;
                if let Err(e) = std::fs::rename(&path, &rotated) {
                    log::error!("rotate rename of {} failed: {e}", path.display());
                }
                file = open_append(&path);
            }
            LogCommand::RotateDone => {
                if let Err(e) = std::fs::remove_file(&rotated) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::error!("unlink of {} failed: {e}", rotated.display());
                    }
                }
            }
        }
    }
}
