//! Write-request and index-partition-extent types (spec.md §3).
//!
//! A [`WriteRequest`] is one cache block's worth of buffered, not-yet-fully-
//! written data for a single dentry; its [`RequestState`] tracks how far
//! along the data/index partition pipeline it has traveled. An
//! [`IpExtent`] records a span of bytes already durable in the index
//! partition, kept so a later overwrite can tell what still needs
//! flushing versus what a read can already satisfy from IP.

use crate::pool::CacheBlock;

/// Which tape partition a request or extent targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// The data partition: the bulk, append-mostly store.
    Dp,
    /// The index partition: compact, randomly-updatable metadata store.
    Ip,
}

/// Lifecycle state of a buffered [`WriteRequest`] (spec.md §3).
///
/// `Partial -> Dp -> Ip`, one-way: a request only regresses from `Dp` back
/// to `Partial` when a later write truncates it below a full cache block
/// (see `merge`), never from `Ip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Fewer bytes than a full cache block; not yet eligible for DP write.
    Partial,
    /// Exactly a full cache block; queued or already written to DP.
    Dp,
    /// Already durable on DP; queued or already written to IP as well.
    Ip,
}

/// One cache block's worth of buffered write data for a dentry.
///
/// Requests are kept in a dentry's request list sorted by `file_offset`
/// and are maintained non-overlapping by `merge` (spec.md §4.4): any two
/// requests touching the same bytes are combined into one before either
/// is queued for dispatch.
#[derive(Debug)]
pub struct WriteRequest {
    /// Offset into the file this request's data begins at.
    pub file_offset: u64,
    /// Number of valid bytes in `block`, starting at its first byte.
    pub byte_count: usize,
    /// Lifecycle state.
    pub state: RequestState,
    /// The buffered bytes.
    pub block: CacheBlock,
}

impl WriteRequest {
    /// Offset one past the last valid byte this request covers.
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.byte_count as u64
    }

    /// `true` if `[file_offset, file_offset + byte_count)` overlaps or
    /// directly abuts `other`'s range -- the condition under which `merge`
    /// may combine the two.
    pub fn contiguous_or_overlapping(&self, other_offset: u64, other_count: usize) -> bool {
        let other_end = other_offset + other_count as u64;
        self.file_offset <= other_end && other_offset <= self.end_offset()
    }

    /// A request is eligible to become a full DP write once it holds a
    /// complete cache block's worth of bytes.
    pub fn is_full_block(&self, cache_block_size: usize) -> bool {
        self.byte_count >= cache_block_size
    }
}

/// A span of bytes already written to the index partition for a dentry.
///
/// Extents are kept sorted by `file_offset` in a dentry's extent list; the
/// list is merged and split as new extents are written or superseded,
/// mirroring how a data-partition write can "shadow" a previously-written
/// IP region that has not yet been superseded on tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpExtent {
    /// Offset into the file this extent's data begins at.
    pub file_offset: u64,
    /// Number of bytes this extent covers.
    pub byte_count: u64,
    /// Tape block at which this extent begins within the index partition.
    pub start_block: u64,
    /// Byte offset within `start_block` the extent's data begins at.
    pub byte_offset: u32,
}

impl IpExtent {
    /// Offset one past the last byte this extent covers.
    pub fn end_offset(&self) -> u64 {
        self.file_offset + self.byte_count
    }

    /// `true` if this extent's range overlaps `[offset, offset + count)`.
    pub fn overlaps(&self, offset: u64, count: u64) -> bool {
        self.file_offset < offset + count && offset < self.end_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(size: usize) -> CacheBlock {
        crate::pool::Pool::new(size, 1, 1).allocate().unwrap()
    }

    #[test]
    fn end_offset_accounts_for_byte_count() {
        let req = WriteRequest {
            file_offset: 100,
            byte_count: 50,
            state: RequestState::Partial,
            block: block(64),
        };
        assert_eq!(req.end_offset(), 150);
    }

    #[test]
    fn detects_contiguity_and_overlap() {
        let req = WriteRequest {
            file_offset: 100,
            byte_count: 50,
            state: RequestState::Partial,
            block: block(64),
        };
        assert!(req.contiguous_or_overlapping(150, 10)); // exactly abutting
        assert!(req.contiguous_or_overlapping(120, 10)); // overlapping
        assert!(!req.contiguous_or_overlapping(200, 10)); // disjoint
    }

    #[test]
    fn ip_extent_overlap_is_half_open() {
        let extent = IpExtent {
            file_offset: 10,
            byte_count: 20,
            start_block: 0,
            byte_offset: 0,
        };
        assert!(extent.overlaps(25, 5));
        assert!(!extent.overlaps(30, 5));
        assert!(!extent.overlaps(0, 10));
    }
}
