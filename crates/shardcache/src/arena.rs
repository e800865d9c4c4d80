//! Chunked record pools.
//!
//! Handoff and log records churn at the rate of the request stream, so they
//! are carved out of chunk allocations instead of hitting the allocator per
//! record. A pool grows by whole chunks and keeps a LIFO of free slot
//! indices; a [`Handle`] names one occupied slot and is consumed exactly once
//! when the record is taken back out.
//!
//! Growth is fallible: if reserving space for a new chunk fails, `alloc`
//! returns `None` and the caller drops the operation (and counts it).

use std::sync::Mutex;

/// Records per chunk for connection handoffs.
pub const HANDOFF_CHUNK: usize = 64;

/// Records per chunk for log records.
pub const LOG_RECORD_CHUNK: usize = 32;

/// Names one live slot in a [`RecordPool`]. Not cloneable: whoever holds the
/// handle owns the record.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle(u32);

struct PoolInner<T> {
    chunks: Vec<Box<[Option<T>]>>,
    free: Vec<u32>,
    chunk_allocations: u64,
}

/// Fixed-chunk pool of records of type `T`.
pub struct RecordPool<T> {
    inner: Mutex<PoolInner<T>>,
    chunk_size: usize,
}

impl<T> RecordPool<T> {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        Self {
            inner: Mutex::new(PoolInner {
                chunks: Vec::new(),
                free: Vec::new(),
                chunk_allocations: 0,
            }),
            chunk_size,
        }
    }

    /// Store `value` in a free slot, growing by one chunk if none is left.
    ///
    /// Returns `None` when reserving the bookkeeping for a new chunk fails;
    /// `value` is dropped in that case.
    pub fn alloc(&self, value: T) -> Option<Handle> {
        let mut inner = self.inner.lock().expect("record pool mutex poisoned");
        if inner.free.is_empty() {
            if inner.chunks.try_reserve(1).is_err() {
                return None;
            }
            if inner.free.try_reserve(self.chunk_size).is_err() {
                return None;
            }
            let chunk: Box<[Option<T>]> = (0..self.chunk_size).map(|_| None).collect();
            let base = (inner.chunks.len() * self.chunk_size) as u32;
            inner.chunks.push(chunk);
            inner.chunk_allocations += 1;
            // Highest index deepest so the LIFO hands slots out in order.
            for slot in (0..self.chunk_size as u32).rev() {
                inner.free.push(base + slot);
            }
        }
        let index = inner.free.pop().expect("free list refilled above");
        let (chunk, slot) = (index as usize / self.chunk_size, index as usize % self.chunk_size);
        inner.chunks[chunk][slot] = Some(value);
        Some(Handle(index))
    }

    /// Take the record named by `handle` out of the pool, recycling its slot.
    pub fn take(&self, handle: Handle) -> T {
        let mut inner = self.inner.lock().expect("record pool mutex poisoned");
        let index = handle.0;
        let (chunk, slot) = (index as usize / self.chunk_size, index as usize % self.chunk_size);
        let value = inner.chunks[chunk][slot].take().expect("handle names a live slot");
        inner.free.push(index);
        value
    }

    /// Number of whole-chunk allocations performed so far.
    pub fn chunk_allocations(&self) -> u64 {
        self.inner.lock().expect("record pool mutex poisoned").chunk_allocations
    }

    /// Currently free slots.
    pub fn free_slots(&self) -> usize {
        self.inner.lock().expect("record pool mutex poisoned").free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_take_round_trip() {
        let pool: RecordPool<String> = RecordPool::new(4);
        let h = pool.alloc("hello".to_string()).expect("alloc");
        assert_eq!(pool.take(h), "hello");
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn test_chunk_allocation_count_matches_ceiling() {
        let pool: RecordPool<u64> = RecordPool::new(64);
        let handles: Vec<_> =
            (0..10_000u64).map(|i| pool.alloc(i).expect("alloc")).collect();
        assert_eq!(pool.chunk_allocations(), 10_000u64.div_ceil(64), "ceil(10000/64) chunks");

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(pool.take(h), i as u64);
        }
        // Freed slots are reused, not re-chunked.
        let again: Vec<_> = (0..10_000u64).map(|i| pool.alloc(i).expect("alloc")).collect();
        assert_eq!(pool.chunk_allocations(), 10_000u64.div_ceil(64));
        drop(again);
    }

    #[test]
    fn test_slots_reused_lifo() {
        let pool: RecordPool<u8> = RecordPool::new(8);
        let a = pool.alloc(1).expect("alloc");
        let first_index = format!("{a:?}");
        pool.take(a);
        let b = pool.alloc(2).expect("alloc");
        assert_eq!(format!("{b:?}"), first_index, "freed slot should be handed out next");
        pool.take(b);
    }

    #[test]
    fn test_interleaved_alloc_free_stays_in_one_chunk() {
        let pool: RecordPool<u32> = RecordPool::new(16);
        for i in 0..1_000 {
            let h = pool.alloc(i).expect("alloc");
            assert_eq!(pool.take(h), i);
        }
        assert_eq!(pool.chunk_allocations(), 1);
    }
}
