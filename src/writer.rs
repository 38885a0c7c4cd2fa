//! Background writer thread (spec.md §4.5).
//!
//! A single cooperative loop, not a pool: draining two queues one
//! dentry-request at a time, picking which queue to service next from a
//! simple, cheap-to-evaluate policy so the thread never blocks on a
//! decision, only on work being absent.
//!
//! Policy, evaluated fresh each cycle: prefer DP service when DP demand
//! dwarfs the number of foreground callers currently blocked on cache
//! pressure (`dp_req_count > DP_PREFERENCE_FACTOR * cache_waiters`) --
//! relieving pressure fast matters more than IP latency in that regime.
//! Otherwise prefer IP only once it has backed up past
//! `ip_high_watermark * pool_high_water`; below that, keep draining
//! whatever DP/working-set work is available.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::DP_PREFERENCE_FACTOR;
use crate::dentry::DentryState;
use crate::error::{Result, SchedulerError};
use crate::extent;
use crate::interfaces::{DentryId, FrontEnd, TapeDevice};
use crate::request::{IpExtent, Partition, RequestState, WriteRequest};
use crate::scheduler::SchedulerCore;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Start the background writer thread for `core`. The thread exits once
/// `core.writer_alive()` is cleared and it next wakes up.
pub fn spawn<D, F>(core: Arc<SchedulerCore<D, F>>) -> JoinHandle<()>
where
    D: TapeDevice + 'static,
    F: FrontEnd + 'static,
{
    std::thread::spawn(move || run(core))
}

fn run<D, F>(core: Arc<SchedulerCore<D, F>>)
where
    D: TapeDevice + 'static,
    F: FrontEnd + 'static,
{
    while core.writer_alive().load(Ordering::SeqCst) {
        let dp_count = core.queues.dp_req_count();
        let waiters = core.queues.cache_waiters();
        let ip_count = core.queues.ip_req_count();
        let ip_watermark =
            (core.config.ip_high_watermark * core.config.pool_high_water as f64) as usize;

        let prefer_dp = dp_count > DP_PREFERENCE_FACTOR * waiters.max(1) && dp_count > 0;
        let prefer_ip = !prefer_dp && ip_count >= ip_watermark && ip_count > 0;

        let mut dp_done = 0usize;
        let mut ip_done = 0usize;

        if prefer_ip {
            if service_one_ip(&core).unwrap_or(false) {
                ip_done += 1;
            }
        } else if service_one_dp(&core).unwrap_or(false) {
            dp_done += 1;
        } else if service_one_ip(&core).unwrap_or(false) {
            ip_done += 1;
        }

        core.profiler.lock().on_writer_cycle(dp_done, ip_done);

        if dp_done == 0 && ip_done == 0 {
            core.queues.wait_for_work(POLL_INTERVAL);
        }
    }

    // Clean shutdown: flush every dentry's Dp/Partial work to DP, then
    // drain whatever that produced on the index partition, before the
    // thread exits (spec.md §4.5 step 2, §5 Cancellation). Losing
    // buffered data is only a risk on abnormal termination -- a process
    // killed without going through `destroy` at all -- not here.
    drain_all_on_shutdown(&core);
}

/// Final drain run once on shutdown: every dentry's remaining `Partial`/
/// `Dp` requests go to DP (promoting to `Ip` when the dentry has
/// `write_ip` set), then the `ip_queue` is drained to exhaustion.
fn drain_all_on_shutdown<D, F>(core: &Arc<SchedulerCore<D, F>>)
where
    D: TapeDevice + 'static,
    F: FrontEnd + 'static,
{
    for (id, dentry) in core.all_dentries() {
        loop {
            let request = {
                let mut inner = dentry.iosched.lock();
                let pos = inner.requests.iter().position(|r| r.state != RequestState::Ip);
                pos.map(|i| inner.requests.remove(i))
            };
            let Some(request) = request else { break };
            let _ = write_dp_request(core, id, &dentry, request);
        }
    }

    while core.queues.ip_req_count() > 0 {
        if !service_one_ip(core).unwrap_or(false) {
            break;
        }
    }
}

fn service_one_dp<D, F>(core: &Arc<SchedulerCore<D, F>>) -> Result<bool>
where
    D: TapeDevice,
    F: FrontEnd,
{
    let Some((id, dentry)) = core.queues.pop_dp() else {
        return Ok(false);
    };

    let request = {
        let mut inner = dentry.iosched.lock();
        inner.in_dp = 0;
        let pos = inner
            .requests
            .iter()
            .position(|r| r.state == RequestState::Dp);
        pos.map(|i| inner.requests.remove(i))
    };

    let Some(request) = request else {
        return Ok(false);
    };

    write_dp_request(core, id, &dentry, request)?;

    // Only re-queue once the write's outcome is known: a failure clears
    // all remaining Dp/Partial requests for this dentry (`handle_write_error`),
    // so there would be nothing left to service anyway.
    let mut inner = dentry.iosched.lock();
    if inner.in_dp == 0 && inner.requests.iter().any(|r| r.state == RequestState::Dp) {
        inner.in_dp = 1;
        drop(inner);
        core.queues.push_dp(id, Arc::clone(&dentry));
    }

    Ok(true)
}

fn write_dp_request<D, F>(
    core: &Arc<SchedulerCore<D, F>>,
    id: DentryId,
    dentry: &Arc<DentryState>,
    request: WriteRequest,
) -> Result<()>
where
    D: TapeDevice,
    F: FrontEnd,
{
    let block_index = request.file_offset / core.config.cache_block_size as u64;
    let payload = &request.block.data()[..request.byte_count];
    let write_result = core.device.write_block(Partition::Dp, block_index, payload);
    if write_result.is_ok() {
        // The front-end is the system of record for "where does file
        // offset X currently live" (spec.md §6's narrow `FrontEnd`
        // boundary); mirroring the bytes here is what makes them visible
        // to a later `read` once this request is no longer buffered.
        let _ = core.frontend.write(id, request.file_offset, payload);
    }

    match write_result {
        Ok(()) => {
            let write_ip = dentry.iosched.lock().write_ip;
            if write_ip {
                let mut ip_request = request;
                ip_request.state = RequestState::Ip;
                let mut inner = dentry.iosched.lock();
                inner.requests.push(ip_request);
                inner.in_ip = 1;
                drop(inner);
                core.queues.push_ip(id, Arc::clone(dentry));
            } else {
                core.pool.release(request.block, 0);
            }
        }
        Err(e) => {
            core.pool.release(request.block, 0);
            handle_write_error(core, dentry, e);
        }
    }
    Ok(())
}

/// React to a failed write on `dentry` (spec.md §4.6): stamp the sticky
/// error unless it's the one IP-out-of-space class that must stay
/// invisible, decide which partition(s) to clear, drop the matching
/// buffered requests (their cache blocks freeing via `Drop` as the
/// `Vec::retain` closures drop them), and recompute the logical size.
/// A genuine write-permanent failure additionally triggers
/// `write_index_after_permanent_error`.
fn handle_write_error<D, F>(core: &SchedulerCore<D, F>, dentry: &Arc<DentryState>, error: SchedulerError)
where
    D: TapeDevice,
    F: FrontEnd,
{
    let suppressed = error.is_suppressed_ip_out_of_space();
    if !suppressed {
        dentry.set_write_error(error.clone());
    }

    let clear_dp = error.clears_partition(Partition::Dp) || matches!(error, SchedulerError::ReadOnlyVolume);
    let clear_ip = error.clears_partition(Partition::Ip) || matches!(error, SchedulerError::ReadOnlyVolume);

    if clear_dp || clear_ip {
        let mut inner = dentry.iosched.lock();
        if clear_dp {
            inner.requests.retain(|r| r.state == RequestState::Ip);
            inner.in_ws = 0;
            inner.in_dp = 0;
        }
        if clear_ip {
            inner.requests.retain(|r| r.state != RequestState::Ip);
            inner.ip_extents.clear();
            inner.in_ip = 0;
            inner.in_ext = 0;
        }
        inner.invalidate_size();
    }

    if !suppressed && (clear_dp || clear_ip) {
        let failed_partition = if error.clears_partition(Partition::Dp) {
            Partition::Dp
        } else {
            Partition::Ip
        };
        write_index_after_permanent_error(core, failed_partition);
    }
}

/// On a write-permanent error (spec.md §4.6): lock the volume against
/// foreign access, find how far the tape actually got, truncate anything
/// recorded past that point -- including in-memory IP extents, which
/// would otherwise describe tape that no longer holds what they claim --
/// and ask for a fresh index write so the volume's on-tape index reflects
/// reality again.
fn write_index_after_permanent_error<D, F>(core: &SchedulerCore<D, F>, failed_partition: Partition)
where
    D: TapeDevice,
    F: FrontEnd,
{
    let _ = core.device.set_volume_locked(true);

    if let Ok(position) = core.device.physical_position(failed_partition) {
        let _ = core.device.truncate_after(failed_partition, position);

        if failed_partition == Partition::Ip {
            for (_, dentry) in core.all_dentries() {
                let mut inner = dentry.iosched.lock();
                let before = inner.ip_extents.len();
                inner.ip_extents.retain(|e| e.start_block < position);
                if inner.ip_extents.len() != before {
                    inner.invalidate_size();
                }
            }
        }
    }

    let _ = core.device.trigger_index_write();
}

fn service_one_ip<D, F>(core: &Arc<SchedulerCore<D, F>>) -> Result<bool>
where
    D: TapeDevice,
    F: FrontEnd,
{
    // spec.md §4.5 "Servicing IP": IP writes serialize against all
    // foreground work for the duration of one request's service.
    let _global = core.global_lock.write();

    let Some((id, dentry)) = core.queues.pop_ip() else {
        return Ok(false);
    };

    let request = {
        let mut inner = dentry.iosched.lock();
        inner.in_ip = 0;
        let pos = inner
            .requests
            .iter()
            .position(|r| r.state == RequestState::Ip);
        let request = pos.map(|i| inner.requests.remove(i));
        if inner.requests.iter().any(|r| r.state == RequestState::Ip) {
            inner.in_ip = 1;
        }
        request
    };

    let Some(request) = request else {
        return Ok(false);
    };

    if dentry.iosched.lock().in_ip == 1 {
        core.queues.push_ip(id, Arc::clone(&dentry));
    }

    write_one_ip(core, id, &dentry, request)?;
    Ok(true)
}

/// Write a single buffered request out synchronously, used by `flush`.
/// Dispatches by state: `Partial`/`Dp` go to the data partition (and on
/// to the index partition if `write_ip` is set and the write succeeds);
/// `Ip` requests (already on DP, only IP service remains) skip straight
/// to the index partition.
pub(crate) fn write_one<D, F>(
    core: &SchedulerCore<D, F>,
    id: DentryId,
    dentry: &Arc<DentryState>,
    request: WriteRequest,
) -> Result<()>
where
    D: TapeDevice,
    F: FrontEnd,
{
    match request.state {
        RequestState::Partial | RequestState::Dp => {
            let block_index = request.file_offset / core.config.cache_block_size as u64;
            let payload = &request.block.data()[..request.byte_count];
            let write_result = core.device.write_block(Partition::Dp, block_index, payload);
            if write_result.is_ok() {
                let _ = core.frontend.write(id, request.file_offset, payload);
            }
            match write_result {
                Ok(()) => {
                    let write_ip = dentry.iosched.lock().write_ip;
                    if write_ip {
                        write_one_ip(core, id, dentry, request)?;
                    } else {
                        core.pool.release(request.block, 0);
                    }
                }
                Err(e) => {
                    core.pool.release(request.block, 0);
                    handle_write_error(core, dentry, e);
                }
            }
        }
        RequestState::Ip => {
            write_one_ip(core, id, dentry, request)?;
        }
    }
    Ok(())
}

/// Write one request's block to the index partition and merge the extent
/// it produces into the dentry's `ip_extents` list (spec.md §4.5
/// "Servicing IP"). A failed write is routed through `handle_write_error`
/// rather than propagated, so a synchronous `flush` caller sees it the
/// same way a background write does: via the dentry's sticky mailbox.
fn write_one_ip<D, F>(
    core: &SchedulerCore<D, F>,
    id: DentryId,
    dentry: &Arc<DentryState>,
    request: WriteRequest,
) -> Result<()>
where
    D: TapeDevice,
    F: FrontEnd,
{
    let block_index = core.device.physical_position(Partition::Ip)?;
    let payload = &request.block.data()[..request.byte_count];

    match core.device.write_block(Partition::Ip, block_index, payload) {
        Ok(()) => {
            let new_extent = IpExtent {
                file_offset: request.file_offset,
                byte_count: request.byte_count as u64,
                start_block: block_index,
                byte_offset: 0,
            };
            record_ip_extent(core, id, dentry, new_extent);
        }
        Err(e) => handle_write_error(core, dentry, e),
    }

    core.pool.release(request.block, 0);
    Ok(())
}

/// Merge a freshly-written extent into `dentry`'s in-memory list, mirror
/// it to the front-end, and push the dentry onto the ext_queue the first
/// time its extent list becomes non-empty (spec.md's invariant "dentry is
/// in ext_queue iff its IpExtent list is non-empty", reaped at shutdown).
fn record_ip_extent<D, F>(
    core: &SchedulerCore<D, F>,
    id: DentryId,
    dentry: &Arc<DentryState>,
    new_extent: IpExtent,
) where
    D: TapeDevice,
    F: FrontEnd,
{
    let (needs_queueing, reported) = {
        let mut inner = dentry.iosched.lock();
        extent::insert_ip_extent(&mut inner.ip_extents, new_extent, core.config.cache_block_size);
        inner.invalidate_size();
        let needs_queueing = !inner.ip_extents.is_empty() && inner.in_ext == 0;
        if needs_queueing {
            inner.in_ext = 1;
        }
        // Report whichever extent now covers the write -- itself, or the
        // coalesced span it just merged into -- so the front-end's view
        // reflects the merge rather than a since-superseded raw slice.
        let reported = inner
            .ip_extents
            .iter()
            .find(|e| e.file_offset <= new_extent.file_offset && new_extent.file_offset < e.end_offset())
            .copied()
            .unwrap_or(new_extent);
        (needs_queueing, reported)
    };

    let _ = core.frontend.add_extent(id, reported);

    if needs_queueing {
        core.queues.push_ext(id, Arc::clone(dentry));
    }
}
