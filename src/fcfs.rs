//! First-come-first-served pass-through scheduler (grounded in
//! `src/iosched/fcfs.c` from the original source).
//!
//! Not part of the coalescing core: every write goes straight to the data
//! partition synchronously, with no buffering, no merging, and no
//! background thread. Kept only as a baseline to compare the coalescing
//! scheduler's throughput against in benches/tests -- the original ships
//! it as the simplest possible `iosched_ops` implementation, useful for
//! exactly that kind of comparison.

use std::sync::Arc;

use crate::error::Result;
use crate::interfaces::{DentryId, FrontEnd, TapeDevice};
use crate::request::Partition;

/// A scheduler that performs no write coalescing: each `write` is placed
/// on the data partition immediately, block-aligned, blocking the caller
/// until the device call returns.
pub struct FcfsScheduler<D: TapeDevice, F: FrontEnd> {
    device: Arc<D>,
    frontend: Arc<F>,
}

impl<D: TapeDevice, F: FrontEnd> FcfsScheduler<D, F> {
    pub fn new(device: Arc<D>, frontend: Arc<F>) -> Self {
        Self { device, frontend }
    }

    pub fn open(&self, path: &str) -> Result<DentryId> {
        self.frontend.open(path)
    }

    pub fn close(&self, id: DentryId) -> Result<()> {
        self.frontend.close(id)
    }

    /// Write `data` at `offset`, one tape block at a time, in request
    /// order with no reordering or merging across calls.
    pub fn write(&self, id: DentryId, offset: u64, data: &[u8]) -> Result<usize> {
        let block_size = self.device.block_size();
        let mut written = 0;
        while written < data.len() {
            let abs_offset = offset + written as u64;
            let block_index = abs_offset / block_size as u64;
            let window_start = block_index * block_size as u64;
            let local_off = (abs_offset - window_start) as usize;
            let chunk_len = (block_size - local_off).min(data.len() - written);
            let chunk = &data[written..written + chunk_len];

            self.device.write_block(Partition::Dp, block_index, chunk)?;
            self.frontend.write(id, abs_offset, chunk)?;
            written += chunk_len;
        }
        Ok(written)
    }

    pub fn read(&self, id: DentryId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.frontend.read(id, offset, buf)
    }

    pub fn truncate(&self, id: DentryId, size: u64) -> Result<()> {
        self.frontend.truncate(id, size)
    }

    pub fn get_filesize(&self, id: DentryId) -> u64 {
        self.frontend.reported_size(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FakeFrontEnd, FakeTapeDevice};

    #[test]
    fn write_lands_synchronously_with_no_buffering() {
        let device = Arc::new(FakeTapeDevice::new(4, 0));
        let frontend = Arc::new(FakeFrontEnd::new("ip_eligible"));
        let scheduler = FcfsScheduler::new(Arc::clone(&device), Arc::clone(&frontend));

        let id = scheduler.open("/a").unwrap();
        scheduler.write(id, 0, b"abcdefgh").unwrap();

        // Visible immediately through the front-end, no flush needed.
        assert_eq!(scheduler.get_filesize(id), 8);
        assert_eq!(device.read_block(Partition::Dp, 0).unwrap(), b"abcd");
        assert_eq!(device.read_block(Partition::Dp, 1).unwrap(), b"efgh");
    }
}
