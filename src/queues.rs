//! Global scheduling queues and the counters the background writer's
//! policy decision reads (spec.md §3/§4.5).
//!
//! Entries are dentry-level, not request-level: pushing a dentry onto the
//! working-set, DP, or IP queue means "this dentry has at least one
//! request eligible for that stage"; the writer re-examines the dentry's
//! own request list (under its `iosched` lock) to find the specific
//! request to service, and re-queues the dentry if more work remains.
//! This keeps ownership of `WriteRequest`s exactly where spec.md's data
//! model puts it -- inside `DentryState` -- instead of duplicating it into
//! an intrusive list, which Rust's ownership model does not offer for
//! free the way the original's `TAILQ` pointers did.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::dentry::DentryState;
use crate::interfaces::DentryId;

/// A dentry together with the identifier the front-end needs handed back
/// to it (e.g. for `add_extent`).
pub type QueueEntry = (DentryId, Arc<DentryState>);

/// The four global work queues plus the counters the writer's policy
/// (spec.md §4.5) and the cache-pressure protocol (spec.md §4.1/§4.3)
/// read.
#[derive(Default)]
pub struct Queues {
    working_set: Mutex<VecDeque<QueueEntry>>,
    dp_queue: Mutex<VecDeque<QueueEntry>>,
    ip_queue: Mutex<VecDeque<QueueEntry>>,
    ext_queue: Mutex<VecDeque<QueueEntry>>,

    /// Wakes the background writer on any enqueue, and wakes foreground
    /// callers waiting for a flush to complete.
    cond: Condvar,
    /// Dummy mutex paired with `cond`; the real state lives in the four
    /// queues above, each independently lockable.
    cond_lock: Mutex<()>,

    dp_req_count: AtomicUsize,
    ip_req_count: AtomicUsize,
    ws_req_count: AtomicUsize,
    /// Foreground callers currently blocked on pool exhaustion
    /// (spec.md §4.5's `cache_waiters`, read by the writer's DP-preference
    /// policy).
    cache_waiters: AtomicUsize,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_working_set(&self, id: DentryId, dentry: Arc<DentryState>) {
        self.working_set.lock().push_back((id, dentry));
        self.ws_req_count.fetch_add(1, Ordering::SeqCst);
        self.wake_writer();
    }

    pub fn push_dp(&self, id: DentryId, dentry: Arc<DentryState>) {
        self.dp_queue.lock().push_back((id, dentry));
        self.dp_req_count.fetch_add(1, Ordering::SeqCst);
        self.wake_writer();
    }

    pub fn push_ip(&self, id: DentryId, dentry: Arc<DentryState>) {
        self.ip_queue.lock().push_back((id, dentry));
        self.ip_req_count.fetch_add(1, Ordering::SeqCst);
        self.wake_writer();
    }

    pub fn push_ext(&self, id: DentryId, dentry: Arc<DentryState>) {
        self.ext_queue.lock().push_back((id, dentry));
        self.wake_writer();
    }

    pub fn pop_working_set(&self) -> Option<QueueEntry> {
        let popped = self.working_set.lock().pop_front();
        if popped.is_some() {
            self.ws_req_count.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    pub fn pop_dp(&self) -> Option<QueueEntry> {
        let popped = self.dp_queue.lock().pop_front();
        if popped.is_some() {
            self.dp_req_count.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    pub fn pop_ip(&self) -> Option<QueueEntry> {
        let popped = self.ip_queue.lock().pop_front();
        if popped.is_some() {
            self.ip_req_count.fetch_sub(1, Ordering::SeqCst);
        }
        popped
    }

    pub fn pop_ext(&self) -> Option<QueueEntry> {
        self.ext_queue.lock().pop_front()
    }

    pub fn dp_req_count(&self) -> usize {
        self.dp_req_count.load(Ordering::SeqCst)
    }

    pub fn ip_req_count(&self) -> usize {
        self.ip_req_count.load(Ordering::SeqCst)
    }

    pub fn ws_req_count(&self) -> usize {
        self.ws_req_count.load(Ordering::SeqCst)
    }

    pub fn cache_waiters(&self) -> usize {
        self.cache_waiters.load(Ordering::SeqCst)
    }

    pub fn enter_cache_wait(&self) {
        self.cache_waiters.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_cache_wait(&self) {
        self.cache_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// `true` if any of the three service queues has outstanding work.
    pub fn has_work(&self) -> bool {
        self.dp_req_count() > 0 || self.ip_req_count() > 0 || self.ws_req_count() > 0
    }

    fn wake_writer(&self) {
        self.cond.notify_all();
    }

    /// Wake the writer immediately, e.g. to make it notice a shutdown
    /// request without waiting out its poll interval.
    pub fn notify_writer(&self) {
        self.wake_writer();
    }

    /// Block the writer until woken by an enqueue, or until `timeout`
    /// elapses -- the writer re-checks `has_work` either way, so a
    /// spurious or timed-out wakeup is harmless.
    pub fn wait_for_work(&self, timeout: std::time::Duration) {
        let mut guard = self.cond_lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trips_and_updates_counts() {
        let queues = Queues::new();
        let dentry = Arc::new(DentryState::new());
        let id = DentryId(1);

        queues.push_dp(id, Arc::clone(&dentry));
        assert_eq!(queues.dp_req_count(), 1);
        assert!(queues.has_work());

        let (popped_id, popped) = queues.pop_dp().unwrap();
        assert_eq!(popped_id, id);
        assert!(Arc::ptr_eq(&popped, &dentry));
        assert_eq!(queues.dp_req_count(), 0);
        assert!(!queues.has_work());
    }

    #[test]
    fn cache_waiters_tracks_enter_exit() {
        let queues = Queues::new();
        assert_eq!(queues.cache_waiters(), 0);
        queues.enter_cache_wait();
        queues.enter_cache_wait();
        assert_eq!(queues.cache_waiters(), 2);
        queues.exit_cache_wait();
        assert_eq!(queues.cache_waiters(), 1);
    }
}
