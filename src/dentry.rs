//! Per-dentry scheduling state (spec.md §3).
//!
//! Everything the scheduler tracks about a single open file: its sorted,
//! non-overlapping buffered write requests, the index-partition extents
//! already durable for it, a lazily-recomputed logical size, the
//! data-placement (`write_ip`) flag, and a sticky write-error mailbox.
//!
//! Lock order within a `DentryState` (and relative to the rest of the
//! scheduler, spec.md §5): `SchedulerCore` lock, then `iosched`, then any
//! front-end-owned content/metadata lock, then `io_lock`, then the pool's
//! internal lock. `write_error` is a leaf lock: it is never held while any
//! other lock in the hierarchy is held.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::SchedulerError;
use crate::request::{IpExtent, WriteRequest};

/// State protected by a dentry's `iosched` lock: the buffered request
/// list, the IP extent list, and the bookkeeping derived from them.
#[derive(Default)]
pub struct DentryInner {
    /// Buffered write requests, sorted and kept non-overlapping by merge.
    pub requests: Vec<WriteRequest>,
    /// Durable index-partition extents, sorted by file offset.
    pub ip_extents: Vec<IpExtent>,
    /// Cached logical size; `None` means "needs recomputation".
    logical_size: Option<u64>,
    /// Whether new data for this dentry should also be written to IP.
    pub write_ip: bool,
    /// Count of this dentry's requests currently in the working-set queue.
    pub in_ws: usize,
    /// Count of this dentry's requests currently in the DP queue.
    pub in_dp: usize,
    /// Count of this dentry's requests currently in the IP queue.
    pub in_ip: usize,
    /// `1` once this dentry has been pushed onto the ext_queue for its
    /// current (non-empty) `ip_extents` list, `0` otherwise -- keeps a
    /// dentry from being queued for shutdown reaping more than once while
    /// extents keep accumulating.
    pub in_ext: usize,
}

impl DentryInner {
    /// Index of the first request whose range could overlap or abut
    /// `offset` -- a starting point for merge/insert, not a guaranteed
    /// overlap.
    pub fn insertion_point(&self, offset: u64) -> usize {
        self.requests.partition_point(|r| r.end_offset() < offset)
    }

    /// Recompute and cache the logical size: the end offset of whichever
    /// of the last buffered request or the last IP extent reaches
    /// furthest. Returns the cached value if still valid.
    pub fn logical_size(&mut self) -> u64 {
        if let Some(size) = self.logical_size {
            return size;
        }
        let from_requests = self.requests.last().map(|r| r.end_offset()).unwrap_or(0);
        let from_extents = self.ip_extents.last().map(|e| e.end_offset()).unwrap_or(0);
        let size = from_requests.max(from_extents);
        self.logical_size = Some(size);
        size
    }

    /// Invalidate the cached logical size so the next call recomputes it.
    /// Must be called after any mutation of `requests` or `ip_extents`.
    pub fn invalidate_size(&mut self) {
        self.logical_size = None;
    }

    /// Force the logical size, bypassing recomputation (used by
    /// truncate, which sets an authoritative new size directly).
    pub fn set_logical_size(&mut self, size: u64) {
        self.logical_size = Some(size);
    }
}

/// Per-dentry scheduling state.
pub struct DentryState {
    /// Buffered requests, extents, and derived bookkeeping.
    pub iosched: Mutex<DentryInner>,
    /// Serializes the dentry's actual I/O calls into the front-end/tape
    /// layer, held beneath `iosched` in the lock hierarchy.
    pub io_lock: Mutex<()>,
    /// Sticky first-error mailbox: set only while empty, cleared on read.
    /// A leaf lock -- never held alongside `iosched` or `io_lock`.
    write_error: Mutex<Option<SchedulerError>>,
    /// Number of currently-open handles on this dentry. `close` tears down
    /// the `DentryState` only once this reaches zero and no buffered work
    /// remains (spec.md §4.2).
    open_count: AtomicUsize,
}

impl Default for DentryState {
    fn default() -> Self {
        Self::new()
    }
}

impl DentryState {
    pub fn new() -> Self {
        Self {
            iosched: Mutex::new(DentryInner::default()),
            io_lock: Mutex::new(()),
            write_error: Mutex::new(None),
            open_count: AtomicUsize::new(0),
        }
    }

    /// Record one more open handle on this dentry.
    pub fn add_open_handle(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one open handle, returning the number still outstanding.
    pub fn remove_open_handle(&self) -> usize {
        self.open_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Record a write error, first-wins: if a sticky error is already
    /// pending, this one is dropped silently (the caller already knows
    /// something is wrong; spec.md §4.6 only promises *a* failure is
    /// surfaced, not every one).
    pub fn set_write_error(&self, error: SchedulerError) {
        let mut slot = self.write_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Take and clear the sticky write error, if any.
    pub fn take_write_error(&self) -> Option<SchedulerError> {
        self.write_error.lock().take()
    }

    /// `true` if a sticky write error is currently pending, without
    /// consuming it.
    pub fn has_write_error(&self) -> bool {
        self.write_error.lock().is_some()
    }
}
