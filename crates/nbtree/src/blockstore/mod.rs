//! Append-only block storage.
//!
//! The tree layer writes every sealed node exactly once through the
//! [`BlockStore`] trait and refers to it afterwards only by its [`LogicAddr`].
//! Two implementations share the same read-after-write and immutability
//! semantics:
//!
//! - [`FileStorage`]: durable, composed of a [`MetaVolume`] allocation table
//!   and a fixed set of fixed-capacity [`Volume`] files.
//! - [`MemStore`]: in-memory, for tests and short-lived series.
//!
//! ## Block Frame
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  payload_len: u32 LE                           │
//! │  crc32(payload): u32 LE                        │
//! │  payload[payload_len]                          │
//! │  zero padding up to BLOCK_SIZE                 │
//! └───────────────────────────────────────────────┘
//! ```

pub mod file;
pub mod memory;
pub mod meta;
pub mod volume;

pub use file::{FileStorage, FileStorageConfig, VolumeStats};
pub use memory::MemStore;
pub use meta::MetaVolume;
pub use volume::Volume;

use crate::error::{NBTreeError, Result};
use std::fmt;
use std::fs::File;

/// Size of one block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the per-block frame header (length + CRC32).
pub const BLOCK_FRAME_HEADER_SIZE: usize = 8;

/// Largest payload a single block can hold.
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_FRAME_HEADER_SIZE;

/// Logical address of one immutable block.
///
/// For the file store the high 32 bits hold the volume index and the low 32
/// bits the block offset inside that volume. Addresses are totally ordered
/// in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicAddr(u64);

impl LogicAddr {
    /// Sentinel that is never issued by a store.
    pub const EMPTY: LogicAddr = LogicAddr(u64::MAX);

    /// Creates an address from its raw representation.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Creates an address from a volume index and an in-volume offset.
    pub const fn from_parts(volume: u32, offset: u32) -> Self {
        Self(((volume as u64) << 32) | offset as u64)
    }

    /// Returns the raw representation.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Volume index component.
    pub const fn volume(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// In-volume offset component.
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    /// Returns true for [`LogicAddr::EMPTY`].
    pub const fn is_empty(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for LogicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}:{}", self.volume(), self.offset())
        }
    }
}

/// Sync mode for block store durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// `sync_all` after every metadata flush and block write (default).
    #[default]
    Fsync,
    /// `sync_data` (skip file metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

impl SyncMode {
    /// Applies the sync mode to an open file.
    pub(crate) fn sync(self, file: &File) -> Result<()> {
        match self {
            SyncMode::Fsync => file.sync_all()?,
            SyncMode::Fdatasync => file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }
}

/// Capacity and utilization of a block store, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStoreStats {
    /// Total number of blocks the store can hold.
    pub capacity: u64,
    /// Number of blocks already allocated.
    pub used: u64,
    /// Block size in bytes.
    pub block_size: usize,
}

impl BlockStoreStats {
    /// Blocks still available for allocation.
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Append-only storage of immutable blocks.
///
/// Implementations must be safe to share between series: concurrent
/// `append` calls never receive the same address, and `read` of an address
/// returned by a successful `append` always yields the same bytes.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Allocates a new block, writes `payload` into it and returns its address.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::StoreFull` when no block can be allocated and
    /// `NBTreeError::BadArgument` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
    fn append(&self, payload: &[u8]) -> Result<LogicAddr>;

    /// Reads the payload stored at `addr`.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::AddressNotFound` for addresses that were never
    /// written and an integrity error for corrupted blocks.
    fn read(&self, addr: LogicAddr) -> Result<Vec<u8>>;

    /// Returns true if `addr` was issued by this store and can be read.
    fn exists(&self, addr: LogicAddr) -> bool;

    /// Total capacity in blocks.
    fn capacity(&self) -> u64;

    /// Number of allocated blocks.
    fn used(&self) -> u64;

    /// Makes all completed appends durable.
    fn flush(&self) -> Result<()>;

    /// Capacity and utilization snapshot.
    fn stats(&self) -> BlockStoreStats {
        BlockStoreStats {
            capacity: self.capacity(),
            used: self.used(),
            block_size: BLOCK_SIZE,
        }
    }
}

/// Checks that a payload fits into a single block.
pub(crate) fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(NBTreeError::BadArgument("empty block payload".to_string()));
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(NBTreeError::BadArgument(format!(
            "block payload of {} bytes exceeds {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

/// Wraps a payload into a full block frame.
pub(crate) fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    check_payload(payload)?;
    let mut block = Vec::with_capacity(BLOCK_SIZE);
    block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    block.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    block.extend_from_slice(payload);
    block.resize(BLOCK_SIZE, 0);
    Ok(block)
}

/// Extracts and verifies the payload of a block frame.
pub(crate) fn decode_frame(addr: LogicAddr, block: &[u8]) -> Result<Vec<u8>> {
    if block.len() < BLOCK_FRAME_HEADER_SIZE {
        return Err(NBTreeError::AddressNotFound(addr));
    }
    let len = u32::from_le_bytes([block[0], block[1], block[2], block[3]]) as usize;
    let expected = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);

    // Allocated but never written.
    if len == 0 {
        return Err(NBTreeError::AddressNotFound(addr));
    }
    if len > block.len() - BLOCK_FRAME_HEADER_SIZE {
        return Err(NBTreeError::CorruptNode(format!(
            "block {} declares {} payload bytes",
            addr, len
        )));
    }

    let payload = &block[BLOCK_FRAME_HEADER_SIZE..BLOCK_FRAME_HEADER_SIZE + len];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(NBTreeError::ChecksumMismatch { expected, actual });
    }
    Ok(payload.to_vec())
}
