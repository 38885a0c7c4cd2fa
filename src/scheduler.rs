//! The scheduler core (spec.md §3/§4.2/§4.3): owns the dentry table, the
//! cache pool, the global queues, and the foreground API every open file
//! operation goes through.
//!
//! Lock order (spec.md §5): this struct's `dentries` lock, then a given
//! dentry's `iosched` lock, then the front-end's own content/metadata
//! lock (opaque to us, taken inside `FrontEnd` calls), then the dentry's
//! `io_lock`, then the pool's internal lock. `write_error` is a leaf lock
//! taken alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::config::SchedulerConfig;
use crate::dentry::DentryState;
use crate::error::{Result, SchedulerError};
use crate::interfaces::{DentryId, FrontEnd, TapeDevice};
use crate::merge::merge_write;
use crate::pool::Pool;
use crate::profiler::{NullProfiler, Profiler};
use crate::queues::Queues;
use crate::request::RequestState;
use crate::{placement, writer};

/// The scheduler's state for one volume: a cache pool, the global work
/// queues, and the table of dentries currently open through it.
pub struct SchedulerCore<D: TapeDevice, F: FrontEnd> {
    pub(crate) device: Arc<D>,
    pub(crate) frontend: Arc<F>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) queues: Arc<Queues>,
    pub(crate) config: SchedulerConfig,
    pub(crate) profiler: Mutex<Arc<dyn Profiler>>,
    /// Multi-reader/single-writer guard matching spec.md §5: foreground
    /// operations take it for read; full-flush, IP servicing, and
    /// shutdown take it for write.
    pub(crate) global_lock: RwLock<()>,
    dentries: Mutex<HashMap<DentryId, Arc<DentryState>>>,
    writer_alive: Arc<AtomicBool>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<D: TapeDevice + 'static, F: FrontEnd + 'static> SchedulerCore<D, F> {
    /// Build a scheduler over `device`/`frontend` and start its
    /// background writer thread.
    pub fn new(device: Arc<D>, frontend: Arc<F>, config: SchedulerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Pool::new(
            config.cache_block_size,
            config.pool_low_water,
            config.pool_high_water,
        );
        let core = Arc::new(Self {
            device,
            frontend,
            pool,
            queues: Arc::new(Queues::new()),
            config,
            profiler: Mutex::new(Arc::new(NullProfiler)),
            global_lock: RwLock::new(()),
            dentries: Mutex::new(HashMap::new()),
            writer_alive: Arc::new(AtomicBool::new(true)),
            writer_handle: Mutex::new(None),
        });

        let handle = writer::spawn(Arc::clone(&core));
        *core.writer_handle.lock() = Some(handle);
        Ok(core)
    }

    /// Install a profiler, replacing any previously configured one.
    pub fn set_profiler(self: &Arc<Self>, profiler: Arc<dyn Profiler>) {
        *self.profiler.lock() = profiler;
    }

    /// Signal the background writer to stop, join it (it performs a final
    /// flush-all then IP-drain before exiting, spec.md §4.5/§5), and reap
    /// whatever dentries are left on the ext_queue. Safe to call at most
    /// once; further foreground calls after this are not meaningful.
    pub fn shutdown(&self) {
        {
            let _global = self.global_lock.write();
            self.writer_alive.store(false, Ordering::SeqCst);
            self.queues.notify_writer();
        }
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
        self.reap_ext_queue();
    }

    pub(crate) fn writer_alive(&self) -> &AtomicBool {
        &self.writer_alive
    }

    fn dentry_state(&self, id: DentryId) -> Result<Arc<DentryState>> {
        self.dentries
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidArg("dentry not open".into()))
    }

    /// Every currently-open dentry, snapshotted by cloning the table's
    /// `Arc`s -- used by the shutdown drain and by error recovery, both of
    /// which need to walk every dentry without holding the table lock for
    /// the duration.
    pub(crate) fn all_dentries(&self) -> Vec<(DentryId, Arc<DentryState>)> {
        self.dentries
            .lock()
            .iter()
            .map(|(id, dentry)| (*id, Arc::clone(dentry)))
            .collect()
    }

    /// Pop every dentry left on the ext_queue at shutdown and, for each
    /// still holding extents, hand them back to the front-end if the
    /// dentry still qualifies for IP placement (spec.md §5 Cancellation:
    /// "pushing remaining IpExtents back to the front-end for still-
    /// qualifying files").
    fn reap_ext_queue(&self) {
        while let Some((id, dentry)) = self.queues.pop_ext() {
            let mut inner = dentry.iosched.lock();
            inner.in_ext = 0;
            if inner.ip_extents.is_empty() {
                continue;
            }
            let size = inner.logical_size();
            let ctx = self.placement_context(id, &inner, size);
            if placement::is_eligible(&ctx) {
                for extent in inner.ip_extents.iter() {
                    let _ = self.frontend.add_extent(id, *extent);
                }
            }
        }
    }

    /// Open `path`, creating scheduler-side dentry state for it if this
    /// is the first time it has been seen, and recording one more open
    /// handle on it.
    pub fn open(&self, path: &str) -> Result<DentryId> {
        if path.is_empty() {
            return Err(SchedulerError::NullArg("path"));
        }
        let id = self.frontend.open(path)?;
        let dentry = Arc::clone(
            self.dentries
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(DentryState::new())),
        );
        dentry.add_open_handle();
        Ok(id)
    }

    /// Close `id`. When `flush` is set, buffered data is flushed first and
    /// any sticky write error is reported. The `DentryState` itself is
    /// only torn down once this was the last open handle and no buffered
    /// work remains (spec.md §4.2) -- an unflushed close on a dentry with
    /// other handles still open, or with work still pending, leaves the
    /// state in place for them.
    pub fn close(&self, id: DentryId, flush: bool) -> Result<()> {
        let dentry = self.dentry_state(id)?;
        let flush_result = if flush { self.flush(id) } else { Ok(()) };

        let remaining = dentry.remove_open_handle();
        if remaining == 0 {
            let empty = dentry.iosched.lock().requests.is_empty();
            if empty {
                self.dentries.lock().remove(&id);
            }
        }

        self.frontend.close(id)?;
        flush_result
    }

    /// Buffer `data` at `offset`, blocking under cache pressure until the
    /// pool can accept it (spec.md §4.1/§4.3's restart protocol).
    pub fn write(&self, id: DentryId, offset: u64, data: &[u8]) -> Result<usize> {
        let _global = self.global_lock.read();
        if self.frontend.is_read_only(id) {
            return Err(SchedulerError::ReadOnlyVolume);
        }
        let dentry = self.dentry_state(id)?;
        let mut spare = None;
        let mut remaining_offset = offset;
        let mut remaining: &[u8] = data;

        loop {
            let restart = {
                let mut inner = dentry.iosched.lock();
                let restart = merge_write(
                    &mut inner,
                    &self.pool,
                    self.config.cache_block_size,
                    &mut spare,
                    remaining_offset,
                    remaining,
                )?;
                if restart.is_none() {
                    self.classify_requests(id, &dentry, &mut inner);
                }
                restart
            };

            match restart {
                None => break,
                Some(restart_offset) => {
                    let consumed = (restart_offset - offset) as usize;
                    remaining_offset = restart_offset;
                    remaining = &data[consumed..];
                    self.queues.enter_cache_wait();
                    self.pool.wait_for_capacity();
                    self.queues.exit_cache_wait();
                }
            }
        }

        self.profiler.lock().on_write_enqueued(data.len());

        if let Some(err) = dentry.take_write_error() {
            return Err(SchedulerError::WriteError(Box::new(err)));
        }
        Ok(data.len())
    }

    /// Push any newly-`Partial` or newly-`Dp` requests onto the matching
    /// global queue, unless already represented there.
    fn classify_requests(
        &self,
        id: DentryId,
        dentry: &Arc<DentryState>,
        inner: &mut crate::dentry::DentryInner,
    ) {
        let has_partial = inner.requests.iter().any(|r| r.state == RequestState::Partial);
        let has_dp = inner.requests.iter().any(|r| r.state == RequestState::Dp);

        if has_partial && inner.in_ws == 0 {
            inner.in_ws = 1;
            self.queues.push_working_set(id, Arc::clone(dentry));
        }
        if has_dp && inner.in_dp == 0 {
            inner.in_dp = 1;
            self.queues.push_dp(id, Arc::clone(dentry));
        }
    }

    /// Read `buf.len()` bytes starting at `offset`, merging any buffered
    /// requests that cover part of the range with already-durable bytes
    /// served by the front-end (spec.md's read-merge-with-pending-writes).
    pub fn read(&self, id: DentryId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _global = self.global_lock.read();
        let dentry = self.dentry_state(id)?;
        let size = self.get_filesize(id)?;
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let target = &mut buf[..want];

        // Start from durable content, then overlay whatever is buffered.
        let fetched = self.frontend.read(id, offset, target)?;
        for i in fetched..target.len() {
            target[i] = 0;
        }

        let inner = dentry.iosched.lock();
        for req in inner.requests.iter() {
            let req_end = req.end_offset();
            let read_start = offset.max(req.file_offset);
            let read_end = (offset + want as u64).min(req_end);
            if read_start >= read_end {
                continue;
            }
            let dst_start = (read_start - offset) as usize;
            let src_start = (read_start - req.file_offset) as usize;
            let len = (read_end - read_start) as usize;
            target[dst_start..dst_start + len]
                .copy_from_slice(&req.block.data()[src_start..src_start + len]);
        }

        Ok(want)
    }

    /// Truncate the dentry to `size`, discarding buffered data and IP
    /// extents past the new end and demoting any request that now holds
    /// fewer than a full cache block.
    pub fn truncate(&self, id: DentryId, size: u64) -> Result<()> {
        let _global = self.global_lock.read();
        let dentry = self.dentry_state(id)?;
        self.frontend.truncate(id, size)?;
        self.frontend.cleanup_extents_past(id, size)?;

        let mut inner = dentry.iosched.lock();
        inner.requests.retain_mut(|req| {
            if req.file_offset >= size {
                return false;
            }
            if req.end_offset() > size {
                req.byte_count = (size - req.file_offset) as usize;
                let _ = crate::merge::demote_if_shrunk(req, self.config.cache_block_size);
            }
            true
        });
        inner.ip_extents.retain(|e| e.file_offset < size);
        inner.set_logical_size(size);

        if size == 0 {
            let ctx = self.placement_context(id, &inner, 0);
            inner.write_ip = placement::try_set_write_ip(inner.write_ip, true, &ctx);
        }

        Ok(())
    }

    /// Current logical size: the front-end's reported size, or further if
    /// buffered data extends past it.
    pub fn get_filesize(&self, id: DentryId) -> Result<u64> {
        let _global = self.global_lock.read();
        let dentry = self.dentry_state(id)?;
        let reported = self.frontend.reported_size(id);
        let mut inner = dentry.iosched.lock();
        Ok(reported.max(inner.logical_size()))
    }

    /// Force every buffered request (regardless of state) out to the
    /// data partition, and to the index partition too if `write_ip` is
    /// set, waiting for completion. Serializes against IP servicing and
    /// full-flush via the global read lock, but not against other
    /// dentries' foreground work.
    pub fn flush(&self, id: DentryId) -> Result<()> {
        let _global = self.global_lock.read();
        let dentry = self.dentry_state(id)?;
        self.flush_one(id, &dentry)
    }

    /// Force every buffered request across every open dentry out to DP
    /// (and IP where eligible). Takes the global write lock, serializing
    /// against all foreground work and IP servicing for its duration
    /// (spec.md §5).
    pub fn flush_all(&self) -> Result<()> {
        let _global = self.global_lock.write();
        let mut first_err = None;
        for (id, dentry) in self.all_dentries() {
            if let Err(e) = self.flush_one(id, &dentry) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush_one(&self, id: DentryId, dentry: &Arc<DentryState>) -> Result<()> {
        self.profiler.lock().on_flush();
        let _io = dentry.io_lock.lock();

        loop {
            let next = {
                let mut inner = dentry.iosched.lock();
                inner.requests.pop()
            };
            let Some(request) = next else { break };
            writer::write_one(self, id, dentry, request)?;
        }

        if let Some(err) = dentry.take_write_error() {
            return Err(SchedulerError::WriteError(Box::new(err)));
        }
        Ok(())
    }

    /// Re-evaluate `write_ip` for a dentry after an out-of-band metadata
    /// change (e.g. the front-end's placement criteria changed).
    pub fn update_data_placement(&self, id: DentryId) -> Result<()> {
        let _global = self.global_lock.read();
        let dentry = self.dentry_state(id)?;
        let mut inner = dentry.iosched.lock();
        let size = inner.logical_size();
        let ctx = self.placement_context(id, &inner, size);
        self.recompute_write_ip(&mut inner, &ctx);
        Ok(())
    }

    /// Re-evaluate `write_ip` against `ctx`, applying spec.md §4.7's
    /// unset side effects if it transitions from set to clear: drop every
    /// `Ip`-state request and the extent list built from them (they
    /// describe index-partition placement this dentry no longer wants),
    /// and forget its IP-queue membership.
    fn recompute_write_ip(&self, inner: &mut crate::dentry::DentryInner, ctx: &placement::PlacementContext) {
        let was_set = inner.write_ip;
        let now = placement::maybe_clear_write_ip(was_set, ctx);
        if was_set && !now {
            inner.requests.retain(|r| r.state != RequestState::Ip);
            inner.ip_extents.clear();
            inner.in_ip = 0;
            inner.in_ext = 0;
            inner.invalidate_size();
        }
        inner.write_ip = now;
    }

    pub(crate) fn placement_context(
        &self,
        id: DentryId,
        _inner: &crate::dentry::DentryInner,
        logical_size: u64,
    ) -> placement::PlacementContext {
        placement::PlacementContext {
            logical_size,
            max_ip_file_size: self.device.max_ip_file_size(),
            name_matches_criteria: self.frontend.name_matches_criteria(id),
            deleted: self.frontend.is_deleted(id),
            ip_writable: !self.device.is_partition_read_only(crate::request::Partition::Ip),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FakeFrontEnd, FakeTapeDevice};

    fn core() -> Arc<SchedulerCore<FakeTapeDevice, FakeFrontEnd>> {
        let device = Arc::new(FakeTapeDevice::new(8, 0));
        let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
        let mut config = SchedulerConfig::default();
        config.cache_block_size = 8;
        config.pool_low_water = 1;
        config.pool_high_water = 8;
        SchedulerCore::new(device, frontend, config).unwrap()
    }

    #[test]
    fn write_then_read_back_sees_buffered_bytes() {
        let core = core();
        let id = core.open("/a").unwrap();
        core.write(id, 0, b"hello").unwrap();

        let mut buf = [0u8; 5];
        let n = core.read(id, 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        core.shutdown();
    }

    #[test]
    fn truncate_to_zero_discards_buffered_data() {
        let core = core();
        let id = core.open("/a").unwrap();
        core.write(id, 0, b"hello").unwrap();
        core.truncate(id, 0).unwrap();
        assert_eq!(core.get_filesize(id).unwrap(), 0);
        core.shutdown();
    }

    #[test]
    fn flush_drains_buffered_requests() {
        let core = core();
        let id = core.open("/a").unwrap();
        core.write(id, 0, b"abcdefgh").unwrap(); // exactly one full block
        core.flush(id).unwrap();

        let dentry = core.dentry_state(id).unwrap();
        assert!(dentry.iosched.lock().requests.is_empty());
        core.shutdown();
    }
}
