//! Error and Result types for NBTree storage operations.

use crate::blockstore::LogicAddr;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for NBTree operations.
pub type Result<T> = std::result::Result<T, NBTreeError>;

/// The error type for block store and tree operations.
#[derive(Debug, Error)]
pub enum NBTreeError {
    /// An argument was rejected by the operation that received it.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// A single volume has no free blocks left.
    #[error("Volume is full (capacity {capacity} blocks)")]
    VolumeFull {
        /// Capacity of the exhausted volume in blocks.
        capacity: u32,
    },

    /// Every volume of the store is exhausted.
    #[error("Block store is full (capacity {capacity} blocks)")]
    StoreFull {
        /// Combined capacity of the store in blocks.
        capacity: u64,
    },

    /// A node reached its fixed capacity and has to be sealed first.
    #[error("Node is full (capacity {capacity})")]
    NodeFull {
        /// Capacity of the node.
        capacity: usize,
    },

    /// A sealed node was modified.
    #[error("Node is sealed")]
    NodeSealed,

    /// The address does not resolve to a written block.
    #[error("Address not found: {0}")]
    AddressNotFound(LogicAddr),

    /// Stored checksum does not match the content.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored CRC32 checksum.
        expected: u32,
        /// Computed CRC32 checksum.
        actual: u32,
    },

    /// Invalid magic bytes at the start of a file or node.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported on-disk format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// A block decoded into something that is not a valid node.
    #[error("Corrupt node: {0}")]
    CorruptNode(String),

    /// Volume file length disagrees with its declared capacity.
    #[error("Volume size mismatch: expected {expected} bytes, got {actual}")]
    VolumeSizeMismatch {
        /// Length implied by the declared capacity.
        expected: u64,
        /// Actual file length.
        actual: u64,
    },

    /// The number of volume files differs from the metavolume table.
    #[error("Volume count mismatch: metavolume lists {expected}, got {actual}")]
    VolumeCountMismatch {
        /// Number of volumes in the metavolume.
        expected: usize,
        /// Number of volume paths supplied.
        actual: usize,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl NBTreeError {
    /// Returns true for capacity errors (volume or whole store exhausted).
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::VolumeFull { .. } | Self::StoreFull { .. })
    }

    /// Returns true for errors that indicate unreadable or foreign data.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::AddressNotFound(_)
                | Self::ChecksumMismatch { .. }
                | Self::InvalidMagic(_)
                | Self::UnsupportedVersion(_)
                | Self::CorruptNode(_)
        )
    }
}
