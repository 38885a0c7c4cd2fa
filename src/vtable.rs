//! Plugin-facing entry points and typed handles (spec.md §6/§9).
//!
//! The original exposes this scheduler to its host as a table of function
//! pointers (`iosched_ops.h`) operating on an opaque `void *` dentry
//! handle. Rust has no use for the function-pointer indirection -- a
//! trait implementation already gives the host a concrete, checkable
//! surface -- but the *opaque handle* idea is worth keeping: callers on
//! the other side of this boundary shouldn't need to know a handle is
//! "really" a `DentryId`, only that it names one specific open file.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::interfaces::{DentryId, FrontEnd, TapeDevice};
use crate::profiler::Profiler;
use crate::scheduler::SchedulerCore;

/// An opaque handle to one open file, returned by [`SchedulerVtable::open`]
/// and required by every other entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchedulerHandle(DentryId);

/// The scheduler's entry points, grouped the way `iosched_ops.h` groups
/// its function table: lifecycle (`init`/`destroy`), per-file operations,
/// and the two out-of-band hooks (`update_data_placement`,
/// `set_profiler`).
pub struct SchedulerVtable<D: TapeDevice, F: FrontEnd> {
    core: Arc<SchedulerCore<D, F>>,
}

impl<D: TapeDevice + 'static, F: FrontEnd + 'static> SchedulerVtable<D, F> {
    /// `init`: build the scheduler core over `device`/`frontend` and
    /// start its background writer.
    pub fn init(device: Arc<D>, frontend: Arc<F>, config: SchedulerConfig) -> Result<Self> {
        let core = SchedulerCore::new(device, frontend, config)?;
        Ok(Self { core })
    }

    /// `destroy`: stop the background writer and release scheduler state.
    /// The writer performs a final flush-all of every remaining `Dp`/
    /// `Partial` request, then drains the IP queue, before it exits, so a
    /// clean `destroy` does not lose data buffered by opens that were
    /// never individually flushed or closed. Only an abnormal termination
    /// that never reaches `destroy` at all is outside what this
    /// guarantees.
    pub fn destroy(self) {
        self.core.shutdown();
    }

    pub fn open(&self, path: &str) -> Result<SchedulerHandle> {
        self.core.open(path).map(SchedulerHandle)
    }

    /// `close(dentry, flush, handle)`: release `handle`'s hold on the
    /// dentry, flushing buffered data first if `flush` is set. The
    /// scheduler-side state itself is only torn down once every handle on
    /// the dentry has closed and no buffered work remains.
    pub fn close(&self, handle: SchedulerHandle, flush: bool) -> Result<()> {
        self.core.close(handle.0, flush)
    }

    pub fn read(&self, handle: SchedulerHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.core.read(handle.0, offset, buf)
    }

    pub fn write(&self, handle: SchedulerHandle, offset: u64, data: &[u8]) -> Result<usize> {
        self.core.write(handle.0, offset, data)
    }

    /// `flush(dentry_or_null, closing_flag, handle)`: flush one dentry, or
    /// every open dentry when `handle` is `None`. `closing` is accepted
    /// for signature parity with the host's table but does not change
    /// behavior here -- a full flush already drains everything regardless
    /// of why it was requested.
    pub fn flush(&self, handle: Option<SchedulerHandle>, _closing: bool) -> Result<()> {
        match handle {
            Some(h) => self.core.flush(h.0),
            None => self.core.flush_all(),
        }
    }

    pub fn truncate(&self, handle: SchedulerHandle, size: u64) -> Result<()> {
        self.core.truncate(handle.0, size)
    }

    pub fn get_filesize(&self, handle: SchedulerHandle) -> Result<u64> {
        self.core.get_filesize(handle.0)
    }

    pub fn update_data_placement(&self, handle: SchedulerHandle) -> Result<()> {
        self.core.update_data_placement(handle.0)
    }

    pub fn set_profiler(&self, profiler: Arc<dyn Profiler>) {
        self.core.set_profiler(profiler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FakeFrontEnd, FakeTapeDevice};

    #[test]
    fn open_write_read_close_round_trip() {
        let device = Arc::new(FakeTapeDevice::new(8, 0));
        let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
        let mut config = SchedulerConfig::default();
        config.cache_block_size = 8;
        config.pool_low_water = 1;
        config.pool_high_water = 4;

        let vtable = SchedulerVtable::init(device, frontend, config).unwrap();
        let handle = vtable.open("/file").unwrap();
        vtable.write(handle, 0, b"abcdefgh").unwrap();

        let mut buf = [0u8; 8];
        vtable.read(handle, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");

        vtable.close(handle, true).unwrap();
        vtable.destroy();
    }
}
