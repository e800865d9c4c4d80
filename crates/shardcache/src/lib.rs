// shardcache: sharded in-memory key-value cache with per-class append logs
// and snapshot recovery.

pub mod arena;
pub mod cache;
pub mod hash;
pub mod item;
pub mod queue;
pub mod recover;
pub mod slab;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod types;
pub mod wal;
pub mod worker;

pub use cache::Cache;
pub use item::Item;
pub use recover::ReplaySummary;
pub use stats::{GlobalStats, StatsBlock, StatsSnapshot, WorkerStats};
pub use store::{Store, StoreMode, StoreOutcome};
pub use types::{
    now_secs, CacheError, ConnState, LockMode, Settings, Transport, MAX_KEY_LEN,
};
pub use worker::{ConnHandler, Handoff, WorkerContext, WorkerPool, EV_PERSIST, EV_READ};
