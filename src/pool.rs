//! Fixed-size object cache pool with a low-/high-water-mark growth
//! policy (spec.md §3/§4.1).
//!
//! Mirrors `cache_manager.c` from the LTFS `iosched` subsystem this
//! scheduler generalizes: a pool of same-sized byte buffers, grown
//! geometrically on demand up to a hard cap, shrunk back to the
//! low-water mark as blocks are released. Blocking on exhaustion is the
//! caller's responsibility (`allocate` never blocks); `wait_for_capacity`
//! is the rendezvous point a caller parks on after signaling the
//! background writer.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Trailing bytes reserved for the tape layer's logical-block CRC, added
/// on top of the configured cache block size (spec.md §3).
pub const CRC_TAIL: usize = 4;

struct PoolInner {
    current_capacity: usize,
    free_list: Vec<Box<[u8]>>,
}

/// A pool of fixed-size byte buffers.
///
/// Invariants (spec.md §3): `low_water <= current_capacity <= high_water`;
/// every buffer on the free list is zeroed; growth from an empty free
/// list doubles the pool (or jumps to `high_water/2` from zero, or
/// straight to `high_water`), never exceeding `high_water`.
pub struct Pool {
    object_size: usize,
    low_water: usize,
    high_water: usize,
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

impl Pool {
    /// Create a pool of `object_size + CRC_TAIL`-byte buffers, pre-filled
    /// to `low_water` capacity on a best-effort basis.
    pub fn new(object_size: usize, low_water: usize, high_water: usize) -> Arc<Self> {
        let buf_size = object_size + CRC_TAIL;
        let mut free_list = Vec::with_capacity(low_water);
        for _ in 0..low_water {
            free_list.push(vec![0u8; buf_size].into_boxed_slice());
        }
        Arc::new(Self {
            object_size,
            low_water,
            high_water,
            inner: Mutex::new(PoolInner {
                current_capacity: low_water,
                free_list,
            }),
            cond: Condvar::new(),
        })
    }

    /// Size of a single object's usable payload, excluding the CRC tail.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// `true` if an allocation could currently succeed without blocking:
    /// either the free list is non-empty, or the pool has not yet hit
    /// `high_water`.
    pub fn has_room(self: &Arc<Self>) -> bool {
        let inner = self.inner.lock();
        !inner.free_list.is_empty() || inner.current_capacity < self.high_water
    }

    /// Allocate a block, growing the pool if necessary. Never blocks:
    /// returns `None` if the free list is empty and the pool is already
    /// at `high_water` -- a normal saturation signal, not an error
    /// (spec.md §4.1).
    pub fn allocate(self: &Arc<Self>) -> Option<CacheBlock> {
        let mut inner = self.inner.lock();

        if let Some(data) = inner.free_list.pop() {
            return Some(CacheBlock {
                pool: Arc::clone(self),
                data: Some(data),
            });
        }

        if inner.current_capacity >= self.high_water {
            return None;
        }

        let new_capacity = if inner.current_capacity == 0 {
            (self.high_water / 2).max(1)
        } else if inner.current_capacity.saturating_mul(2) < self.high_water {
            inner.current_capacity * 2
        } else {
            self.high_water
        };

        let buf_size = self.object_size + CRC_TAIL;
        let to_grow = new_capacity.saturating_sub(inner.current_capacity);
        let mut grown = 0;
        let mut last = None;
        for _ in 0..to_grow {
            // Growth failure is non-fatal: keep whatever succeeded.
            let data = vec![0u8; buf_size].into_boxed_slice();
            last = Some(data);
            grown += 1;
        }
        inner.current_capacity += grown;

        last.map(|data| CacheBlock {
            pool: Arc::clone(self),
            data: Some(data),
        })
    }

    /// Release a block back to the pool. `zero_count` bytes at the start
    /// of the buffer are zeroed before it is either freed (if the pool is
    /// above `low_water`) or returned to the free list; `0` zeroes the
    /// whole buffer.
    pub fn release(self: &Arc<Self>, mut block: CacheBlock, zero_count: usize) {
        let data = block.data.take().expect("block already released");
        self.release_raw(data, zero_count);
    }

    fn release_raw(self: &Arc<Self>, mut data: Box<[u8]>, zero_count: usize) {
        let mut inner = self.inner.lock();

        if inner.current_capacity > self.low_water {
            inner.current_capacity -= 1;
            // `data` is simply dropped, shrinking the pool.
        } else {
            let clear_to = if zero_count == 0 {
                data.len()
            } else {
                zero_count.min(data.len())
            };
            data[..clear_to].fill(0);
            inner.free_list.push(data);
        }

        drop(inner);
        self.cond.notify_one();
    }

    /// Block until a release signals that capacity may be available.
    /// Callers must re-attempt `allocate` after this returns -- a single
    /// call corresponds to one wakeup, not a guarantee of success (other
    /// waiters may win the race).
    pub fn wait_for_capacity(&self) {
        let mut guard = self.inner.lock();
        self.cond.wait(&mut guard);
    }
}

/// An owned, fixed-size byte buffer checked out of a [`Pool`].
///
/// Ownership, not reference counting, models the pool/request
/// relationship: a request owns its cache block outright and returns it
/// to the pool by value via [`Pool::release`]. A block dropped without an
/// explicit release still returns to its pool (zeroed in full), so no
/// accounting can leak through an early return or a panic unwind.
pub struct CacheBlock {
    pool: Arc<Pool>,
    data: Option<Box<[u8]>>,
}

impl CacheBlock {
    /// The block's payload, including the trailing CRC area.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().expect("block already released")
    }

    /// Mutable access to the block's payload.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("block already released")
    }

    /// Total buffer size, including the CRC tail.
    pub fn size(&self) -> usize {
        self.data().len()
    }
}

impl std::fmt::Debug for CacheBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBlock")
            .field("size", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

impl Drop for CacheBlock {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release_raw(data, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_from_zero_to_half_high_water() {
        let pool = Pool::new(16, 0, 8);
        let block = pool.allocate().expect("first allocation grows the pool");
        assert_eq!(block.size(), 20);
        assert_eq!(pool.inner.lock().current_capacity, 4);
    }

    #[test]
    fn doubles_then_caps_at_high_water() {
        let pool = Pool::new(16, 2, 10);
        assert_eq!(pool.inner.lock().current_capacity, 2);

        // Drain the two pre-filled blocks, forcing growth on the third.
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();
        assert_eq!(pool.inner.lock().current_capacity, 4); // doubled 2 -> 4

        drop(_a);
        drop(_b);
        drop(_c);
    }

    #[test]
    fn allocate_returns_none_at_high_water() {
        let pool = Pool::new(16, 0, 2);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert!(!pool.has_room());
    }

    #[test]
    fn release_unblocks_a_waiter() {
        let pool = Pool::new(16, 0, 1);
        let block = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());

        let waiter_pool = Arc::clone(&pool);
        let handle = std::thread::spawn(move || {
            waiter_pool.wait_for_capacity();
            waiter_pool.allocate().is_some()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        pool.release(block, 0);

        assert!(handle.join().unwrap());
    }

    #[test]
    fn shrinks_back_to_low_water_on_release() {
        let pool = Pool::new(16, 1, 4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(pool.inner.lock().current_capacity, 4);

        pool.release(a, 0);
        pool.release(b, 0);
        pool.release(c, 0);
        assert_eq!(pool.inner.lock().current_capacity, 1);
    }

    #[test]
    fn implicit_drop_still_returns_to_pool() {
        let pool = Pool::new(16, 1, 1);
        {
            let _block = pool.allocate().unwrap();
        }
        assert_eq!(pool.inner.lock().current_capacity, 1);
        assert_eq!(pool.inner.lock().free_list.len(), 1);
    }

    #[test]
    fn zero_count_clears_only_a_prefix() {
        let pool = Pool::new(16, 1, 1);
        let mut block = pool.allocate().unwrap();
        block.data_mut().fill(0xAB);
        pool.release(block, 4);

        let mut inner = pool.inner.lock();
        let data = inner.free_list.pop().unwrap();
        assert!(data[..4].iter().all(|&b| b == 0));
        assert!(data[4..].iter().all(|&b| b == 0xAB));
    }
}
