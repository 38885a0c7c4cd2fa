//! External collaborator traits (spec.md §6) and in-process fakes used by
//! tests to drive the scheduler deterministically, without real tape
//! hardware or a real file-system front-end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SchedulerError};
use crate::request::{IpExtent, Partition};

/// Opaque identifier for an open dentry, handed back by [`FrontEnd::open`]
/// and threaded through every other `FrontEnd` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryId(pub u64);

/// The raw tape device this scheduler drives writes down to. Narrow by
/// design: only what a write-coalescing scheduler needs to place blocks
/// and query device state, not the full device/medium lifecycle.
pub trait TapeDevice: Send + Sync {
    /// Read one block at `block` in `partition`.
    fn read_block(&self, partition: Partition, block: u64) -> Result<Vec<u8>>;
    /// Write one block at `block` in `partition`.
    fn write_block(&self, partition: Partition, block: u64, data: &[u8]) -> Result<()>;
    /// Write a file mark in `partition` at the current position.
    fn write_file_mark(&self, partition: Partition) -> Result<()>;
    /// Current physical block position in `partition`.
    fn physical_position(&self, partition: Partition) -> Result<u64>;
    /// Lock or unlock the volume against foreign access.
    fn set_volume_locked(&self, locked: bool) -> Result<()>;
    /// Discard everything in `partition` after `block` (used on a failed
    /// or superseded write to keep the tape consistent).
    fn truncate_after(&self, partition: Partition, block: u64) -> Result<()>;
    /// Ask the index layer to flush a new index generation now.
    fn trigger_index_write(&self) -> Result<()>;
    /// `true` if `partition` currently rejects writes.
    fn is_partition_read_only(&self, partition: Partition) -> bool;
    /// Nominal tape block size for this volume.
    fn block_size(&self) -> usize;
    /// Data-partition identifier.
    fn dp_partition_id(&self) -> u8;
    /// Index-partition identifier.
    fn ip_partition_id(&self) -> u8;
    /// Largest file size still eligible for index-partition placement.
    fn max_ip_file_size(&self) -> u64;
}

/// The file-system front-end this scheduler serves. Narrow by design:
/// only the dentry-level operations the scheduler needs to resolve,
/// mirror, and annotate front-end state.
pub trait FrontEnd: Send + Sync {
    /// Resolve a path to a dentry, opening it if necessary.
    fn open(&self, path: &str) -> Result<DentryId>;
    /// Release a previously opened dentry.
    fn close(&self, dentry: DentryId) -> Result<()>;
    /// Read directly from the front-end's own copy (used when a read
    /// falls entirely outside any buffered request).
    fn read(&self, dentry: DentryId, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Mirror a write into the front-end's own copy (metadata/content
    /// lock owned by the front-end, per spec.md §5's lock hierarchy).
    fn write(&self, dentry: DentryId, offset: u64, data: &[u8]) -> Result<usize>;
    /// Truncate the front-end's copy to `size`.
    fn truncate(&self, dentry: DentryId, size: u64) -> Result<()>;
    /// `true` if the front-end considers this dentry read-only.
    fn is_read_only(&self, dentry: DentryId) -> bool;
    /// `true` if the dentry's name matches the IP placement criteria.
    fn name_matches_criteria(&self, dentry: DentryId) -> bool;
    /// `true` if the dentry has been unlinked.
    fn is_deleted(&self, dentry: DentryId) -> bool;
    /// The front-end's own idea of the dentry's size.
    fn reported_size(&self, dentry: DentryId) -> u64;
    /// Record a newly-written index-partition extent against the dentry.
    fn add_extent(&self, dentry: DentryId, extent: IpExtent) -> Result<()>;
    /// Drop any extents past `offset` (used after a truncate).
    fn cleanup_extents_past(&self, dentry: DentryId, offset: u64) -> Result<()>;
    /// Ask the front-end to flush its index metadata now.
    fn write_index_now(&self) -> Result<()>;
}

/// An in-memory [`TapeDevice`] for tests: two growable block vectors, one
/// per partition, plus injectable failure toggles.
pub struct FakeTapeDevice {
    block_size: usize,
    max_ip_file_size: u64,
    dp_blocks: Mutex<Vec<Vec<u8>>>,
    ip_blocks: Mutex<Vec<Vec<u8>>>,
    dp_position: AtomicU64,
    ip_position: AtomicU64,
    dp_read_only: AtomicBool,
    ip_read_only: AtomicBool,
    fail_next_dp_write: AtomicBool,
    fail_next_ip_write: AtomicBool,
}

impl FakeTapeDevice {
    pub fn new(block_size: usize, max_ip_file_size: u64) -> Self {
        Self {
            block_size,
            max_ip_file_size,
            dp_blocks: Mutex::new(Vec::new()),
            ip_blocks: Mutex::new(Vec::new()),
            dp_position: AtomicU64::new(0),
            ip_position: AtomicU64::new(0),
            dp_read_only: AtomicBool::new(false),
            ip_read_only: AtomicBool::new(false),
            fail_next_dp_write: AtomicBool::new(false),
            fail_next_ip_write: AtomicBool::new(false),
        }
    }

    pub fn set_read_only(&self, partition: Partition, read_only: bool) {
        match partition {
            Partition::Dp => self.dp_read_only.store(read_only, Ordering::SeqCst),
            Partition::Ip => self.ip_read_only.store(read_only, Ordering::SeqCst),
        }
    }

    pub fn fail_next_write(&self, partition: Partition) {
        match partition {
            Partition::Dp => self.fail_next_dp_write.store(true, Ordering::SeqCst),
            Partition::Ip => self.fail_next_ip_write.store(true, Ordering::SeqCst),
        }
    }

    fn blocks(&self, partition: Partition) -> &Mutex<Vec<Vec<u8>>> {
        match partition {
            Partition::Dp => &self.dp_blocks,
            Partition::Ip => &self.ip_blocks,
        }
    }
}

impl TapeDevice for FakeTapeDevice {
    fn read_block(&self, partition: Partition, block: u64) -> Result<Vec<u8>> {
        let blocks = self.blocks(partition).lock();
        blocks
            .get(block as usize)
            .cloned()
            .ok_or_else(|| SchedulerError::InvalidArg("block out of range".into()))
    }

    fn write_block(&self, partition: Partition, block: u64, data: &[u8]) -> Result<()> {
        let fail_flag = match partition {
            Partition::Dp => &self.fail_next_dp_write,
            Partition::Ip => &self.fail_next_ip_write,
        };
        if fail_flag.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::WritePermanent(
                partition,
                "injected failure".into(),
            ));
        }
        if self.is_partition_read_only(partition) {
            return Err(SchedulerError::ReadOnlyPartition(partition));
        }
        let mut blocks = self.blocks(partition).lock();
        let idx = block as usize;
        if idx >= blocks.len() {
            blocks.resize(idx + 1, Vec::new());
        }
        blocks[idx] = data.to_vec();
        match partition {
            Partition::Dp => self.dp_position.store(block + 1, Ordering::SeqCst),
            Partition::Ip => self.ip_position.store(block + 1, Ordering::SeqCst),
        }
        Ok(())
    }

    fn write_file_mark(&self, _partition: Partition) -> Result<()> {
        Ok(())
    }

    fn physical_position(&self, partition: Partition) -> Result<u64> {
        Ok(match partition {
            Partition::Dp => self.dp_position.load(Ordering::SeqCst),
            Partition::Ip => self.ip_position.load(Ordering::SeqCst),
        })
    }

    fn set_volume_locked(&self, _locked: bool) -> Result<()> {
        Ok(())
    }

    fn truncate_after(&self, partition: Partition, block: u64) -> Result<()> {
        let mut blocks = self.blocks(partition).lock();
        blocks.truncate(block as usize);
        Ok(())
    }

    fn trigger_index_write(&self) -> Result<()> {
        Ok(())
    }

    fn is_partition_read_only(&self, partition: Partition) -> bool {
        match partition {
            Partition::Dp => self.dp_read_only.load(Ordering::SeqCst),
            Partition::Ip => self.ip_read_only.load(Ordering::SeqCst),
        }
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn dp_partition_id(&self) -> u8 {
        0
    }

    fn ip_partition_id(&self) -> u8 {
        1
    }

    fn max_ip_file_size(&self) -> u64 {
        self.max_ip_file_size
    }
}

struct FakeDentry {
    path: String,
    data: Vec<u8>,
    read_only: bool,
    deleted: bool,
    extents: Vec<IpExtent>,
}

/// An in-memory [`FrontEnd`] for tests: a simple path-keyed table of
/// dentries, each with its own byte buffer and flags.
pub struct FakeFrontEnd {
    dentries: Mutex<HashMap<DentryId, FakeDentry>>,
    next_id: AtomicU64,
    name_criteria: String,
}

impl FakeFrontEnd {
    pub fn new(name_criteria: impl Into<String>) -> Self {
        Self {
            dentries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            name_criteria: name_criteria.into(),
        }
    }

    pub fn mark_deleted(&self, dentry: DentryId) {
        if let Some(d) = self.dentries.lock().get_mut(&dentry) {
            d.deleted = true;
        }
    }

    pub fn set_read_only(&self, dentry: DentryId, read_only: bool) {
        if let Some(d) = self.dentries.lock().get_mut(&dentry) {
            d.read_only = read_only;
        }
    }

    /// Snapshot the extents recorded against `dentry` via `add_extent`, in
    /// the order they were reported. Test-only inspection hook.
    pub fn extents(&self, dentry: DentryId) -> Vec<IpExtent> {
        self.dentries
            .lock()
            .get(&dentry)
            .map(|d| d.extents.clone())
            .unwrap_or_default()
    }
}

impl FrontEnd for FakeFrontEnd {
    fn open(&self, path: &str) -> Result<DentryId> {
        let mut dentries = self.dentries.lock();
        if let Some((id, _)) = dentries.iter().find(|(_, d)| d.path == path) {
            return Ok(*id);
        }
        let id = DentryId(self.next_id.fetch_add(1, Ordering::SeqCst));
        dentries.insert(
            id,
            FakeDentry {
                path: path.to_string(),
                data: Vec::new(),
                read_only: false,
                deleted: false,
                extents: Vec::new(),
            },
        );
        Ok(id)
    }

    fn close(&self, _dentry: DentryId) -> Result<()> {
        Ok(())
    }

    fn read(&self, dentry: DentryId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let dentries = self.dentries.lock();
        let d = dentries
            .get(&dentry)
            .ok_or_else(|| SchedulerError::InvalidArg("unknown dentry".into()))?;
        let start = offset as usize;
        if start >= d.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(d.data.len() - start);
        buf[..n].copy_from_slice(&d.data[start..start + n]);
        Ok(n)
    }

    fn write(&self, dentry: DentryId, offset: u64, data: &[u8]) -> Result<usize> {
        let mut dentries = self.dentries.lock();
        let d = dentries
            .get_mut(&dentry)
            .ok_or_else(|| SchedulerError::InvalidArg("unknown dentry".into()))?;
        if d.read_only {
            return Err(SchedulerError::ReadOnlyVolume);
        }
        let start = offset as usize;
        let end = start + data.len();
        if d.data.len() < end {
            d.data.resize(end, 0);
        }
        d.data[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn truncate(&self, dentry: DentryId, size: u64) -> Result<()> {
        let mut dentries = self.dentries.lock();
        let d = dentries
            .get_mut(&dentry)
            .ok_or_else(|| SchedulerError::InvalidArg("unknown dentry".into()))?;
        d.data.resize(size as usize, 0);
        d.extents.retain(|e| e.file_offset < size);
        Ok(())
    }

    fn is_read_only(&self, dentry: DentryId) -> bool {
        self.dentries
            .lock()
            .get(&dentry)
            .map(|d| d.read_only)
            .unwrap_or(true)
    }

    fn name_matches_criteria(&self, dentry: DentryId) -> bool {
        self.dentries
            .lock()
            .get(&dentry)
            .map(|d| d.path.contains(&self.name_criteria))
            .unwrap_or(false)
    }

    fn is_deleted(&self, dentry: DentryId) -> bool {
        self.dentries
            .lock()
            .get(&dentry)
            .map(|d| d.deleted)
            .unwrap_or(true)
    }

    fn reported_size(&self, dentry: DentryId) -> u64 {
        self.dentries
            .lock()
            .get(&dentry)
            .map(|d| d.data.len() as u64)
            .unwrap_or(0)
    }

    fn add_extent(&self, dentry: DentryId, extent: IpExtent) -> Result<()> {
        let mut dentries = self.dentries.lock();
        let d = dentries
            .get_mut(&dentry)
            .ok_or_else(|| SchedulerError::InvalidArg("unknown dentry".into()))?;
        d.extents.push(extent);
        Ok(())
    }

    fn cleanup_extents_past(&self, dentry: DentryId, offset: u64) -> Result<()> {
        let mut dentries = self.dentries.lock();
        let d = dentries
            .get_mut(&dentry)
            .ok_or_else(|| SchedulerError::InvalidArg("unknown dentry".into()))?;
        d.extents.retain(|e| e.file_offset < offset);
        Ok(())
    }

    fn write_index_now(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_device_round_trips_a_block() {
        let device = FakeTapeDevice::new(16, 1024);
        device.write_block(Partition::Dp, 0, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_block(Partition::Dp, 0).unwrap(), vec![1, 2, 3]);
        assert_eq!(device.physical_position(Partition::Dp).unwrap(), 1);
    }

    #[test]
    fn fake_device_honors_injected_failure() {
        let device = FakeTapeDevice::new(16, 1024);
        device.fail_next_write(Partition::Dp);
        assert!(device.write_block(Partition::Dp, 0, &[1]).is_err());
        // The next write should succeed again.
        assert!(device.write_block(Partition::Dp, 0, &[1]).is_ok());
    }

    #[test]
    fn fake_front_end_opens_same_path_to_same_id() {
        let fe = FakeFrontEnd::new("ip_eligible");
        let a = fe.open("/foo").unwrap();
        let b = fe.open("/foo").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fake_front_end_name_criteria_matches_substring() {
        let fe = FakeFrontEnd::new("ip_eligible");
        let d = fe.open("/data/ip_eligible_file").unwrap();
        assert!(fe.name_matches_criteria(d));
        let other = fe.open("/data/other").unwrap();
        assert!(!fe.name_matches_criteria(other));
    }
}
