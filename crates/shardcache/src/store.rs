//! The striped item store.
//!
//! ## Locking
//!
//! Items live in 2^P shards, one per lock stripe, where P is derived from the
//! worker count (wide enough to keep contention low, no wider). A key's
//! stripe is `key_hash(key) & (2^P - 1)`.
//!
//! Each thread carries its own lock-mode flag. Under [`LockMode::Granular`],
//! `lock` acquires just the stripe. Under [`LockMode::Global`] it acquires
//! the one global mutex first and then the (now uncontended) stripe, so the
//! data is always reached through its owning lock even while other threads
//! are still synchronizing to the new mode. Lock order is global before
//! stripe, and granular holders never touch the global mutex, so the two
//! modes cannot deadlock against each other.
//!
//! The flag is flipped only by its owning thread: workers in response to a
//! switch command on their notify channel, the recovery thread once at
//! startup. The coordination that makes a switch visible everywhere is the
//! acknowledgment barrier in the worker pool, not any memory ordering on the
//! flag itself.
//!
//! ## Shards
//!
//! A shard is an [`lru::LruCache`] keyed by the raw key bytes. Reads promote,
//! so the shard's iteration order is its LRU order; a configured capacity
//! turns inserts into evict-at-tail.

use std::cell::Cell;
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::hash::key_hash;
use crate::item::{self, Item};
use crate::types::{now_secs, LockMode};

thread_local! {
    static LOCK_MODE: Cell<LockMode> = const { Cell::new(LockMode::Granular) };
}

/// Set the calling thread's lock mode. Only the thread itself may do this.
pub fn set_thread_lock_mode(mode: LockMode) {
    LOCK_MODE.with(|m| m.set(mode));
}

/// The calling thread's current lock mode.
pub fn thread_lock_mode() -> LockMode {
    LOCK_MODE.with(|m| m.get())
}

/// Stripe-table exponent for a worker count. Central locks stop scaling past
/// a handful of threads, so the table tops out at 8192 stripes.
pub fn hashpower_for(num_threads: usize) -> u32 {
    if num_threads < 3 {
        10
    } else if num_threads < 4 {
        11
    } else if num_threads < 5 {
        12
    } else {
        13
    }
}

struct Shard {
    items: LruCache<Box<[u8]>, Item>,
}

/// Guard over one bucket. Which lock it took is observable for callers that
/// need to assert mode-switch visibility.
pub struct BucketGuard<'a> {
    shard: MutexGuard<'a, Shard>,
    global: Option<MutexGuard<'a, ()>>,
}

impl BucketGuard<'_> {
    /// True when the guard went through the global lock.
    pub fn is_global(&self) -> bool {
        self.global.is_some()
    }

    fn items(&mut self) -> &mut LruCache<Box<[u8]>, Item> {
        &mut self.shard.items
    }
}

/// Guard returned by [`Store::trylock`]; releases the stripe on drop.
pub struct TryBucketGuard<'a> {
    _shard: MutexGuard<'a, Shard>,
}

/// How a store operation treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Store only if the present entry still carries this token.
    Cas(u64),
}

/// Outcome of a conditional store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    NotStored,
    /// Cas token mismatch against a live entry.
    Exists,
    /// Cas against an absent key.
    NotFound,
}

/// Sharded item table plus the lock infrastructure guarding it.
pub struct Store {
    shards: Box<[Mutex<Shard>]>,
    mask: u32,
    hashpower: u32,
    global: Mutex<()>,
    /// Last issued cas token.
    cas_counter: AtomicU64,
    evictions: AtomicU64,
}

impl Store {
    pub fn new(num_threads: usize, shard_capacity: Option<usize>) -> Store {
        let hashpower = hashpower_for(num_threads);
        let stripe_count = 1usize << hashpower;
        let shards = (0..stripe_count)
            .map(|_| {
                let items = match shard_capacity {
                    Some(cap) => LruCache::new(
                        NonZeroUsize::new(cap.max(1)).expect("capacity clamped to >= 1"),
                    ),
                    None => LruCache::unbounded(),
                };
                Mutex::new(Shard { items })
            })
            .collect();
        Store {
            shards,
            mask: (stripe_count - 1) as u32,
            hashpower,
            global: Mutex::new(()),
            cas_counter: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn hashpower(&self) -> u32 {
        self.hashpower
    }

    pub fn stripe_count(&self) -> usize {
        self.shards.len()
    }

    // ── Locking ──────────────────────────────────────────────────────────────

    /// Acquire the bucket for hash value `hv` under the calling thread's mode.
    pub fn lock(&self, hv: u32) -> BucketGuard<'_> {
        let idx = (hv & self.mask) as usize;
        match thread_lock_mode() {
            LockMode::Granular => BucketGuard {
                shard: self.shards[idx].lock().expect("stripe mutex poisoned"),
                global: None,
            },
            LockMode::Global => {
                let global = self.global.lock().expect("global item mutex poisoned");
                BucketGuard {
                    shard: self.shards[idx].lock().expect("stripe mutex poisoned"),
                    global: Some(global),
                }
            }
        }
    }

    /// Non-blocking stripe acquisition, ignoring the thread's mode. Used by
    /// background maintenance that must not wait behind a worker already
    /// holding the stripe.
    pub fn trylock(&self, hv: u32) -> Option<TryBucketGuard<'_>> {
        let idx = (hv & self.mask) as usize;
        match self.shards[idx].try_lock() {
            Ok(shard) => Some(TryBucketGuard { _shard: shard }),
            Err(_) => None,
        }
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, guard: &mut BucketGuard<'_>, key: &[u8], item: Item) {
        if let Some((old_key, _)) = guard.items().push(Box::from(key), item) {
            // push reports both same-key replacement and LRU eviction; only
            // the latter counts.
            if old_key.as_ref() != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Item operations ──────────────────────────────────────────────────────

    /// Look up `key`, lazily dropping it if expired. A hit promotes the entry
    /// to most-recently-used.
    pub fn get(&self, key: &[u8]) -> Option<Item> {
        let now = now_secs();
        let mut guard = self.lock(key_hash(key));
        match guard.items().get(key) {
            None => return None,
            Some(it) if !it.is_expired(now) => return Some(it.clone()),
            Some(_) => {}
        }
        // The corpse needs no tombstone: its image carries its own exptime.
        guard.items().pop(key);
        None
    }

    /// Conditional store. On success the freshly stored item (with its new
    /// cas token) is returned so the caller can submit its image.
    pub fn store(
        &self,
        key: &[u8],
        value: Arc<[u8]>,
        flags: u32,
        exptime: u32,
        mode: StoreMode,
    ) -> (StoreOutcome, Option<Item>) {
        let now = now_secs();
        let mut guard = self.lock(key_hash(key));
        let live_cas = match guard.items().peek(key) {
            Some(it) if !it.is_expired(now) => Some(it.cas),
            _ => None,
        };
        let allowed = match mode {
            StoreMode::Set => true,
            StoreMode::Add => live_cas.is_none(),
            StoreMode::Replace => live_cas.is_some(),
            StoreMode::Cas(token) => match live_cas {
                None => return (StoreOutcome::NotFound, None),
                Some(current) if current == token => true,
                Some(_) => return (StoreOutcome::Exists, None),
            },
        };
        if !allowed {
            return (StoreOutcome::NotStored, None);
        }
        let item = Item { flags, exptime, cas: self.next_cas(), value };
        self.insert(&mut guard, key, item.clone());
        (StoreOutcome::Stored, Some(item))
    }

    /// Remove `key`, returning the removed live item. An expired corpse is
    /// dropped but reported as a miss.
    pub fn remove(&self, key: &[u8]) -> Option<Item> {
        let now = now_secs();
        let mut guard = self.lock(key_hash(key));
        match guard.items().peek(key) {
            None => None,
            Some(it) if it.is_expired(now) => {
                guard.items().pop(key);
                None
            }
            Some(_) => guard.items().pop(key),
        }
    }

    /// Update the expiration of a live item, returning its new image source.
    /// The cas token is untouched.
    pub fn touch(&self, key: &[u8], exptime: u32) -> Option<Item> {
        let now = now_secs();
        let mut guard = self.lock(key_hash(key));
        match guard.items().get_mut(key) {
            None => return None,
            Some(it) if !it.is_expired(now) => {
                it.exptime = exptime;
                return Some(it.clone());
            }
            Some(_) => {}
        }
        guard.items().pop(key);
        None
    }

    /// Arithmetic on a decimal value. Increment wraps at u64; decrement
    /// saturates at zero. Returns the new value and the new item, or `None`
    /// for a miss.
    pub fn add_delta(
        &self,
        key: &[u8],
        incr: bool,
        delta: u64,
    ) -> Result<Option<(u64, Item)>, crate::types::CacheError> {
        let now = now_secs();
        let mut guard = self.lock(key_hash(key));
        let (flags, exptime, current) = match guard.items().peek(key) {
            None => return Ok(None),
            Some(it) if it.is_expired(now) => {
                guard.items().pop(key);
                return Ok(None);
            }
            Some(it) => {
                let text = std::str::from_utf8(&it.value)
                    .map_err(|_| crate::types::CacheError::NotNumeric)?;
                let n: u64 =
                    text.trim().parse().map_err(|_| crate::types::CacheError::NotNumeric)?;
                (it.flags, it.exptime, n)
            }
        };
        let next = if incr { current.wrapping_add(delta) } else { current.saturating_sub(delta) };
        let item = Item {
            flags,
            exptime,
            cas: self.next_cas(),
            value: Arc::from(next.to_string().into_bytes()),
        };
        self.insert(&mut guard, key, item.clone());
        Ok(Some((next, item)))
    }

    /// Drop every expired item, one stripe at a time.
    pub fn flush_expired(&self) -> u64 {
        let now = now_secs();
        let mut removed = 0;
        for stripe in self.shards.iter() {
            let mut shard = stripe.lock().expect("stripe mutex poisoned");
            let dead: Vec<Box<[u8]>> = shard
                .items
                .iter()
                .filter(|(_, it)| it.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                shard.items.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    // ── Replay entry points ──────────────────────────────────────────────────

    /// Insert a replayed image verbatim, preserving its cas token and keeping
    /// the cas counter above every token seen.
    pub fn link_replayed(&self, key: &[u8], item: Item) {
        self.cas_counter.fetch_max(item.cas, Ordering::Relaxed);
        let mut guard = self.lock(key_hash(key));
        self.insert(&mut guard, key, item);
    }

    /// Remove a key on behalf of a replayed tombstone.
    pub fn unlink_replayed(&self, key: &[u8]) -> bool {
        let mut guard = self.lock(key_hash(key));
        guard.items().pop(key).is_some()
    }

    // ── Whole-table access ───────────────────────────────────────────────────

    /// Write every linked item's image to `w`, one stripe locked at a time.
    /// Returns the record count.
    pub fn write_snapshot(&self, w: &mut impl io::Write) -> io::Result<u64> {
        let mut count = 0;
        for stripe in self.shards.iter() {
            let shard = stripe.lock().expect("stripe mutex poisoned");
            for (key, it) in shard.items.iter() {
                w.write_all(&item::encode_linked(key, it))?;
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn item_count(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().expect("stripe mutex poisoned").items.len() as u64)
            .sum()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
