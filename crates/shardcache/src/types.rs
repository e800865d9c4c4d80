//! Foundational public types for the shardcache library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`Settings`] — configuration for one cache instance
//! - [`CacheError`] — structured error variants
//! - [`LockMode`] — the granular/global item-lock switch
//! - [`ConnState`] and [`Transport`] — the connection-handoff vocabulary

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Configuration that governs one cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Number of worker event-loop threads. Also drives the width of the
    /// item-lock stripe table.
    pub num_threads: usize,

    /// How often the snapshotter wakes up to check the dirty counter.
    pub snapshot_period: Duration,

    /// Minimum number of mutations since the last snapshot before a timer
    /// tick actually captures one.
    pub snapshot_change_threshold: u64,

    /// Directory holding `snapshot` and the per-class `log_<i>` files.
    pub data_dir: PathBuf,

    /// Per-shard item capacity. `None` disables eviction.
    pub shard_capacity: Option<usize>,

    /// Largest accepted value, in bytes. Must stay below the replay buffer
    /// (8 MiB) or the item can never be recovered.
    pub max_item_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_threads: 4,
            snapshot_period: Duration::from_secs(60),
            snapshot_change_threshold: 1_000,
            data_dir: PathBuf::from("shardcache-data"),
            shard_capacity: None,
            max_item_size: 1_048_576,
        }
    }
}

/// Which lock `Store::lock` acquires for the calling thread.
///
/// Workers start in `Granular` and flip only in response to a switch command
/// delivered through their notify channel. The recovery thread runs `Global`
/// so a single lock protects the whole rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Per-bucket stripe locks.
    Granular,
    /// One process-wide lock, engaged for the duration of a table resize.
    Global,
}

/// Initial protocol state carried in a connection handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Fresh connection, waiting for its first command line.
    NewCommand,
    /// Mid-read; the peer still owes payload bytes.
    WaitingRead,
}

/// The socket a handoff transfers, tagged by transport.
#[derive(Debug)]
pub enum Transport {
    Tcp(std::net::TcpStream),
    Udp(std::net::UdpSocket),
}

impl Transport {
    pub fn is_udp(&self) -> bool {
        matches!(self, Transport::Udp(_))
    }
}

/// Errors surfaced by cache construction, mutation, and recovery.
#[derive(Debug)]
pub enum CacheError {
    /// Filesystem or socket failure, with the path or role that failed.
    Io { context: String, source: io::Error },

    /// Key is empty or longer than [`MAX_KEY_LEN`].
    KeyTooLong { len: usize },

    /// Value exceeds [`Settings::max_item_size`].
    ValueTooLarge { len: usize, limit: usize },

    /// A replayed record's self-described length exceeds the replay buffer;
    /// the file cannot be advanced past it.
    OversizeReplayRecord { ntotal: usize, limit: usize },

    /// incr/decr applied to a value that is not an unsigned decimal integer.
    NotNumeric,

    /// The recovery thread panicked before signalling completion.
    RecoveryFailed,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io { context, source } => write!(f, "{context}: {source}"),
            CacheError::KeyTooLong { len } => {
                write!(f, "key length {len} outside 1..={MAX_KEY_LEN}")
            }
            CacheError::ValueTooLarge { len, limit } => {
                write!(f, "value length {len} exceeds limit {limit}")
            }
            CacheError::OversizeReplayRecord { ntotal, limit } => {
                write!(f, "replay record of {ntotal} bytes exceeds buffer of {limit}")
            }
            CacheError::NotNumeric => {
                write!(f, "value is not an unsigned decimal integer")
            }
            CacheError::RecoveryFailed => write!(f, "recovery thread terminated abnormally"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl CacheError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        CacheError::Io { context: context.into(), source }
    }
}

/// Seconds since the Unix epoch, the clock all expirations are measured on.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
