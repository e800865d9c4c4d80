//! Worker pool: listener-to-worker connection handoff.
//!
//! ## Design
//!
//! A fixed set of worker threads is spawned once. Each worker owns:
//! 1. A notify channel (the fd-pipe of classic event-loop servers, reduced
//!    to its semantics: edge-style, one-way, collapsible wakeups).
//! 2. A lock-protected handoff queue. The channel says *something* happened;
//!    the queue carries the records.
//! 3. A stats block behind its own mutex, mutated only by the owning worker.
//! 4. Its thread-local item-lock mode, mirrored into an atomic so the
//!    control thread can observe acknowledged switches.
//!
//! The listener calls [`WorkerPool::dispatch`], which round-robins the target
//! worker, allocates a pooled handoff record, pushes it, and sends one
//! `Conn` command. Round-robin is the only policy; there is no affinity and
//! no load feedback.
//!
//! ## Initialization barrier
//!
//! `spawn` returns only after every worker has wired itself up and
//! registered on a `Mutex`+`Condvar` counter. [`WorkerPool::switch_mode`]
//! reuses the same barrier: it resets the counter, broadcasts the switch
//! command, and blocks until all workers have re-registered. After it
//! returns, every worker has observed the new mode.

use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::arena::{Handle, RecordPool, HANDOFF_CHUNK};
use crate::queue::WorkQueue;
use crate::stats::{GlobalStats, StatsBlock};
use crate::store::set_thread_lock_mode;
use crate::types::{ConnState, LockMode, Transport};

/// Interest in readability.
pub const EV_READ: u8 = 0x01;
/// The registration survives the first event.
pub const EV_PERSIST: u8 = 0x02;

/// One unit of work transferred from the listener to a worker. Owned by the
/// producer until pushed; by the consuming worker after popped. Never visible
/// to any other thread.
#[derive(Debug)]
pub struct Handoff {
    pub transport: Transport,
    pub init_state: ConnState,
    pub event_flags: u8,
    pub read_buffer_size: usize,
}

/// What a worker knows about itself while running a handoff.
pub struct WorkerContext {
    index: usize,
    stats: Arc<StatsBlock>,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> &StatsBlock {
        &self.stats
    }

    /// Owned handle on this worker's stats block, for handlers that serve the
    /// connection on another thread.
    pub fn stats_handle(&self) -> Arc<StatsBlock> {
        Arc::clone(&self.stats)
    }
}

/// Callback constructing the per-connection handler; the `conn_new` seam.
pub type ConnHandler = dyn Fn(Handoff, &WorkerContext) + Send + Sync;

/// One-byte command alphabet of the notify channel.
#[derive(Debug, Clone, Copy)]
enum WorkerCommand {
    /// Consume one handoff record.
    Conn,
    /// Flip to per-bucket locks and acknowledge.
    SetGranular,
    /// Flip to the single global lock and acknowledge.
    SetGlobal,
}

const MODE_GRANULAR: u8 = 0;
const MODE_GLOBAL: u8 = 1;

// ── Init barrier ─────────────────────────────────────────────────────────────

/// Counted registration barrier shared by startup and mode switches.
pub(crate) struct InitBarrier {
    count: Mutex<usize>,
    cond: Condvar,
}

impl InitBarrier {
    pub(crate) fn new() -> Self {
        Self { count: Mutex::new(0), cond: Condvar::new() }
    }

    /// Called by a thread that has finished setting itself up.
    pub(crate) fn register(&self) {
        let mut count = self.count.lock().expect("init barrier mutex poisoned");
        *count += 1;
        self.cond.notify_all();
    }

    /// Block until `n` registrations have arrived since the last reset.
    pub(crate) fn wait_for(&self, n: usize) {
        let mut count = self.count.lock().expect("init barrier mutex poisoned");
        while *count < n {
            count = self.cond.wait(count).expect("init barrier condvar poisoned");
        }
    }

    /// Reset the counter, run `broadcast` while still holding the barrier
    /// lock, then wait for `n` fresh registrations.
    pub(crate) fn run_round<F: FnOnce()>(&self, n: usize, broadcast: F) {
        let mut count = self.count.lock().expect("init barrier mutex poisoned");
        *count = 0;
        broadcast();
        while *count < n {
            count = self.cond.wait(count).expect("init barrier condvar poisoned");
        }
    }
}

// ── Worker pool ──────────────────────────────────────────────────────────────

struct WorkerHandle {
    sender: Sender<WorkerCommand>,
    queue: Arc<WorkQueue<Handle>>,
    mode_mirror: Arc<AtomicU8>,
    stats: Arc<StatsBlock>,
}

/// Fixed-size pool of worker threads plus the listener-side dispatch state.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    joins: Vec<JoinHandle<()>>,
    handoffs: Arc<RecordPool<Handoff>>,
    /// Which worker most recently received a connection. Touched only by the
    /// listener thread.
    last_thread: AtomicUsize,
    barrier: Arc<InitBarrier>,
    global_stats: Arc<GlobalStats>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers and block until all of them are wired up.
    pub fn spawn(
        num_threads: usize,
        handler: Arc<ConnHandler>,
        global_stats: Arc<GlobalStats>,
    ) -> io::Result<WorkerPool> {
        assert!(num_threads > 0, "worker pool needs at least one thread");
        let barrier = Arc::new(InitBarrier::new());
        let handoffs = Arc::new(RecordPool::new(HANDOFF_CHUNK));

        let mut workers = Vec::with_capacity(num_threads);
        let mut joins = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let (sender, receiver) = mpsc::channel();
            let queue = Arc::new(WorkQueue::new());
            let mode_mirror = Arc::new(AtomicU8::new(MODE_GRANULAR));
            let stats = Arc::new(StatsBlock::new());

            let thread_queue = Arc::clone(&queue);
            let thread_mirror = Arc::clone(&mode_mirror);
            let thread_stats = Arc::clone(&stats);
            let thread_barrier = Arc::clone(&barrier);
            let thread_pool = Arc::clone(&handoffs);
            let thread_handler = Arc::clone(&handler);
            let join = std::thread::Builder::new()
                .name(format!("shardcache-worker-{index}"))
                .spawn(move || {
                    worker_loop(
                        index,
                        receiver,
                        thread_queue,
                        thread_pool,
                        thread_mirror,
                        thread_stats,
                        thread_barrier,
                        thread_handler,
                    )
                })?;

            workers.push(WorkerHandle { sender, queue, mode_mirror, stats });
            joins.push(join);
        }

        barrier.wait_for(num_threads);

        Ok(WorkerPool {
            workers,
            joins,
            handoffs,
            last_thread: AtomicUsize::new(num_threads - 1),
            barrier,
            global_stats,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Hand an accepted connection to the next worker in round-robin order.
    /// Callable only from the listener thread. Returns false when the handoff
    /// was dropped.
    pub fn dispatch(&self, handoff: Handoff) -> bool {
        let n = self.workers.len();
        let target = (self.last_thread.load(Ordering::Relaxed) + 1) % n;
        self.last_thread.store(target, Ordering::Relaxed);

        let Some(handle) = self.handoffs.alloc(handoff) else {
            self.global_stats.count_malloc_fail();
            log::error!("failed to grow the handoff pool; dropping connection");
            return false;
        };
        let worker = &self.workers[target];
        worker.queue.push(handle);
        if worker.sender.send(WorkerCommand::Conn).is_err() {
            log::error!("worker {target} notify channel is closed; connection lost");
            return false;
        }
        true
    }

    /// Flip every worker's item-lock mode and wait for all acknowledgments.
    /// Callable only from the control thread. When this returns, every worker
    /// has observed the new mode.
    pub fn switch_mode(&self, mode: LockMode) {
        let cmd = match mode {
            LockMode::Granular => WorkerCommand::SetGranular,
            LockMode::Global => WorkerCommand::SetGlobal,
        };
        self.barrier.run_round(self.workers.len(), || {
            for (i, worker) in self.workers.iter().enumerate() {
                if worker.sender.send(cmd).is_err() {
                    log::error!("worker {i} notify channel is closed during mode switch");
                }
            }
        });
    }

    /// The last mode each worker acknowledged.
    pub fn worker_modes(&self) -> Vec<LockMode> {
        self.workers
            .iter()
            .map(|w| match w.mode_mirror.load(Ordering::Acquire) {
                MODE_GLOBAL => LockMode::Global,
                _ => LockMode::Granular,
            })
            .collect()
    }

    /// Per-worker stats blocks, for aggregation.
    pub fn stats_blocks(&self) -> Vec<&StatsBlock> {
        self.workers.iter().map(|w| &*w.stats).collect()
    }

    /// Owned handles on the worker stats blocks, for aggregation from code
    /// that outlives the borrow (for example connection threads).
    pub fn stats_handles(&self) -> Vec<Arc<StatsBlock>> {
        self.workers.iter().map(|w| Arc::clone(&w.stats)).collect()
    }

    /// Chunk allocations performed by the handoff pool so far.
    pub fn handoff_chunk_allocations(&self) -> u64 {
        self.handoffs.chunk_allocations()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the notify channels ends the worker loops; queued commands
        // are still delivered first.
        self.workers.clear();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    index: usize,
    receiver: Receiver<WorkerCommand>,
    queue: Arc<WorkQueue<Handle>>,
    handoffs: Arc<RecordPool<Handoff>>,
    mode_mirror: Arc<AtomicU8>,
    stats: Arc<StatsBlock>,
    barrier: Arc<InitBarrier>,
    handler: Arc<ConnHandler>,
) {
    set_thread_lock_mode(LockMode::Granular);
    mode_mirror.store(MODE_GRANULAR, Ordering::Release);
    barrier.register();

    let ctx = WorkerContext { index, stats: Arc::clone(&stats) };
    loop {
        let command = match receiver.recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        match command {
            WorkerCommand::Conn => {
                // A wakeup with an empty queue is a stale edge; ignore it.
                if let Some(handle) = queue.pop() {
                    let handoff = handoffs.take(handle);
                    ctx.stats.lock().conns_handled += 1;
                    handler(handoff, &ctx);
                }
            }
            WorkerCommand::SetGranular => {
                set_thread_lock_mode(LockMode::Granular);
                mode_mirror.store(MODE_GRANULAR, Ordering::Release);
                barrier.register();
            }
            WorkerCommand::SetGlobal => {
                set_thread_lock_mode(LockMode::Global);
                mode_mirror.store(MODE_GLOBAL, Ordering::Release);
                barrier.register();
            }
        }
    }
}
