//! Per-connection pool of preallocated message slots.
//!
//! A pool owns up to 32 slots, each holding a small preallocated header buffer and data
//!  buffer; blobs exceeding the preallocation spill into a dedicated allocation that is
//!  dropped when the slot is released. Free slots are tracked in a 32-bit mask, making
//!  acquisition O(1) and the acquisition order (highest free index first) deterministic
//!  to trace.
//!
//! The pool is `Arc`-shared: a slot delivered to application code keeps the pool alive
//!  even after its connection has closed. Releasing the slot wakes a reader that stopped
//!  on pool exhaustion; this is chirp's only back-pressure mechanism.

use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::error;

use crate::config::{PREALLOC_HEADER, PREALLOC_DATA};

/// Blob storage of one slot: a preallocated buffer plus an optional spill allocation for
///  blobs that do not fit.
pub(crate) struct SlotBuf {
    prealloc: Vec<u8>,
    spill: Option<Vec<u8>>,
}

impl SlotBuf {
    fn new(prealloc_capacity: usize) -> SlotBuf {
        SlotBuf {
            prealloc: Vec::with_capacity(prealloc_capacity),
            spill: None,
        }
    }

    /// Select the storage for an incoming blob of `len` bytes.
    pub fn prepare(&mut self, len: usize) {
        debug_assert!(self.prealloc.is_empty() && self.spill.is_none());
        if len > self.prealloc.capacity() {
            self.spill = Some(Vec::with_capacity(len));
        }
    }

    /// The buffer selected by [`prepare`](SlotBuf::prepare); incoming bytes are appended
    ///  here across partial reads.
    pub fn storage(&mut self) -> &mut Vec<u8> {
        match &mut self.spill {
            Some(spill) => spill,
            None => &mut self.prealloc,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.spill {
            Some(spill) => spill,
            None => &self.prealloc,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn reset(&mut self) {
        self.prealloc.clear();
        self.spill = None;
    }
}

/// One message slot, handed out by value so the reader and later the application can
///  fill and read it without holding any pool lock.
pub(crate) struct Slot {
    pub index: u8,
    pub header: SlotBuf,
    pub data: SlotBuf,
}

pub(crate) struct BufferPool {
    max_slots: usize,
    inner: Mutex<PoolInner>,
    slot_released: Notify,
}

struct PoolInner {
    /// bit i set = slot i free
    free_mask: u32,
    store: Vec<Option<Box<Slot>>>,
}

fn mask(max_slots: usize) -> u32 {
    if max_slots >= 32 {
        u32::MAX
    } else {
        (1u32 << max_slots) - 1
    }
}

impl BufferPool {
    pub fn new(max_slots: usize) -> BufferPool {
        assert!((1..=32).contains(&max_slots));
        let store = (0..max_slots)
            .map(|i| {
                Some(Box::new(Slot {
                    index: i as u8,
                    header: SlotBuf::new(PREALLOC_HEADER),
                    data: SlotBuf::new(PREALLOC_DATA),
                }))
            })
            .collect();
        BufferPool {
            max_slots,
            inner: Mutex::new(PoolInner {
                free_mask: mask(max_slots),
                store,
            }),
            slot_released: Notify::new(),
        }
    }

    /// Take the highest-indexed free slot, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<Box<Slot>> {
        let mut inner = self.inner.lock().expect("buffer pool lock poisoned");
        if inner.free_mask == 0 {
            return None;
        }
        let index = 31 - inner.free_mask.leading_zeros() as usize;
        inner.free_mask &= !(1 << index);
        let slot = inner.store[index].take();
        debug_assert!(slot.is_some(), "free mask and slot store disagree");
        slot
    }

    /// Return a slot to the pool and wake a reader stopped on exhaustion.
    pub fn release(&self, mut slot: Box<Slot>) {
        slot.header.reset();
        slot.data.reset();

        let mut inner = self.inner.lock().expect("buffer pool lock poisoned");
        let bit = 1u32 << slot.index;
        if inner.free_mask & bit != 0 {
            debug_assert!(false, "slot {} released twice", slot.index);
            error!("slot {} released twice - dropping the release", slot.index);
            return;
        }
        let index = slot.index as usize;
        inner.store[index] = Some(slot);
        inner.free_mask |= bit;
        drop(inner);

        self.slot_released.notify_one();
    }

    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().expect("buffer pool lock poisoned").free_mask == 0
    }

    pub fn used_slots(&self) -> usize {
        let inner = self.inner.lock().expect("buffer pool lock poisoned");
        (!inner.free_mask & mask(self.max_slots)).count_ones() as usize
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Wait until a slot has been released. A release that happened since the last wait
    ///  completes the next call immediately.
    pub async fn slot_released(&self) {
        self.slot_released.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single(1)]
    #[case::sixteen(16)]
    #[case::full(32)]
    fn test_acquire_highest_first(#[case] max_slots: usize) {
        let pool = BufferPool::new(max_slots);
        for expected in (0..max_slots).rev() {
            let slot = pool.acquire().unwrap();
            assert_eq!(slot.index as usize, expected);
            // intentionally leaked from the pool's perspective
            std::mem::forget(slot);
        }
        assert!(pool.is_exhausted());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_release_reuses_slot() {
        let pool = BufferPool::new(2);
        let s1 = pool.acquire().unwrap();
        assert_eq!(s1.index, 1);
        let s0 = pool.acquire().unwrap();
        assert_eq!(s0.index, 0);
        assert!(pool.is_exhausted());

        pool.release(s1);
        assert!(!pool.is_exhausted());
        assert_eq!(pool.acquire().unwrap().index, 1);
    }

    #[test]
    fn test_slot_accounting() {
        let pool = BufferPool::new(5);
        assert_eq!(pool.used_slots(), 0);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.used_slots(), 2);

        pool.release(a);
        assert_eq!(pool.used_slots(), 1);
        pool.release(b);
        assert_eq!(pool.used_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    #[cfg(debug_assertions)]
    fn test_double_release_is_detected() {
        let pool = BufferPool::new(2);
        let slot = pool.acquire().unwrap();
        let index = slot.index;
        pool.release(slot);

        // forge a second release of the same index
        pool.release(Box::new(Slot {
            index,
            header: SlotBuf::new(PREALLOC_HEADER),
            data: SlotBuf::new(PREALLOC_DATA),
        }));
    }

    #[test]
    fn test_slot_buf_spills_and_resets() {
        let pool = BufferPool::new(1);
        let mut slot = pool.acquire().unwrap();

        slot.data.prepare(PREALLOC_DATA + 1);
        slot.data.storage().extend_from_slice(&[7u8; PREALLOC_DATA + 1]);
        assert_eq!(slot.data.len(), PREALLOC_DATA + 1);

        pool.release(slot);
        let mut slot = pool.acquire().unwrap();
        assert_eq!(slot.data.len(), 0);

        slot.data.prepare(10);
        slot.data.storage().extend_from_slice(b"0123456789");
        assert_eq!(slot.data.as_slice(), b"0123456789");
        // small blob stays in the preallocated buffer
        assert!(slot.data.spill.is_none());
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new(1));
        let slot = pool.acquire().unwrap();
        assert!(pool.is_exhausted());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.slot_released().await;
                pool.acquire().is_some()
            })
        };

        tokio::task::yield_now().await;
        pool.release(slot);
        assert!(waiter.await.unwrap());
    }
}
