//! Crate-wide error taxonomy and `Result` alias.
//!
//! Mirrors the abstract error kinds a tape-backed scheduler must
//! distinguish: argument validation, partition exhaustion, permanent
//! device failure, and the various "volume is not currently writable"
//! conditions a front-end needs to react to differently.

use thiserror::Error;

use crate::request::Partition;

/// Errors surfaced by the scheduler, its pool, or the collaborators it
/// drives (tape device, front-end).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// A required argument was null/empty where a value was expected.
    #[error("null argument: {0}")]
    NullArg(&'static str),

    /// An argument failed validation (e.g. malformed configuration).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A lock could not be constructed or was observed poisoned.
    #[error("mutex init/poison error: {0}")]
    MutexInit(String),

    /// The target partition is completely out of space.
    #[error("no space left on {0:?}")]
    NoSpaceOnPartition(Partition),

    /// The target partition is nearly out of space (soft, IP-only).
    #[error("less space remaining on {0:?}")]
    LessSpaceOnPartition(Partition),

    /// A write failed in a way that will not succeed on retry (medium or
    /// device error). Fatal for the request's partition.
    #[error("permanent write error on {0:?}: {1}")]
    WritePermanent(Partition, String),

    /// The whole volume is read-only.
    #[error("volume is read-only")]
    ReadOnlyVolume,

    /// A specific partition is read-only.
    #[error("{0:?} partition is read-only")]
    ReadOnlyPartition(Partition),

    /// A revalidation pass is currently running on the volume.
    #[error("revalidation is running")]
    RevalidationRunning,

    /// A revalidation pass failed.
    #[error("revalidation failed")]
    RevalidationFailed,

    /// The underlying device is not ready (no medium, still spinning up).
    #[error("device not ready")]
    DeviceUnready,

    /// A sticky error recorded by the background writer, surfaced once to
    /// the next foreground caller on this dentry.
    #[error("sticky write error: {0}")]
    WriteError(Box<SchedulerError>),
}

impl SchedulerError {
    /// `true` for the class of IP errors that must never surface to the
    /// caller (the DP copy is still authoritative, per spec.md §4.6/§7).
    pub fn is_suppressed_ip_out_of_space(&self) -> bool {
        matches!(
            self,
            SchedulerError::NoSpaceOnPartition(Partition::Ip)
                | SchedulerError::LessSpaceOnPartition(Partition::Ip)
        )
    }

    /// `true` if this error means the named partition is no longer
    /// usable for writes (permanent failure, full, or read-only).
    pub fn clears_partition(&self, partition: Partition) -> bool {
        match self {
            SchedulerError::NoSpaceOnPartition(p) | SchedulerError::WritePermanent(p, _) => {
                *p == partition
            }
            SchedulerError::ReadOnlyPartition(p) => *p == partition,
            SchedulerError::ReadOnlyVolume => true,
            _ => false,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SchedulerError>;
