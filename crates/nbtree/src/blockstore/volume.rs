//! Fixed-capacity, file-backed block container.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header block (BLOCK_SIZE bytes, 18 used)                    │
//! │  - Magic: "NBVL" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Block size: u32 (4 bytes)                                 │
//! │  - Capacity in blocks: u32 (4 bytes)                         │
//! │  - CRC32 of the fields above: u32 (4 bytes)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data blocks 0..capacity (BLOCK_SIZE bytes each, framed)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The file is preallocated at creation and never resized. The write cursor
//! is not stored in the volume; the [`MetaVolume`](super::MetaVolume) owns it
//! and restores it on open.

use crate::blockstore::{decode_frame, encode_frame, LogicAddr, SyncMode, BLOCK_SIZE};
use crate::error::{NBTreeError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Magic bytes for volume files: "NBVL"
pub const VOLUME_MAGIC: [u8; 4] = *b"NBVL";

/// Current volume format version.
pub const VOLUME_VERSION: u16 = 1;

/// Number of meaningful bytes in the header block.
const VOLUME_HEADER_SIZE: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
struct VolumeHeader {
    block_size: u32,
    capacity: u32,
}

impl VolumeHeader {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOCK_SIZE);
        buf.extend_from_slice(&VOLUME_MAGIC);
        buf.extend_from_slice(&VOLUME_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.resize(BLOCK_SIZE, 0);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        let magic: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
        if magic != VOLUME_MAGIC {
            return Err(NBTreeError::InvalidMagic(magic));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > VOLUME_VERSION {
            return Err(NBTreeError::UnsupportedVersion(version));
        }

        let expected = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);
        let actual = crc32fast::hash(&buf[..14]);
        if expected != actual {
            return Err(NBTreeError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            block_size: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            capacity: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }
}

/// A fixed-capacity file of equally sized blocks.
///
/// Blocks are handed out by [`Volume::allocate`] in increasing offset order
/// and written exactly once. Reads and writes use positional I/O, so a
/// volume can be shared between threads without a lock.
#[derive(Debug)]
pub struct Volume {
    path: PathBuf,
    file: File,
    capacity: u32,
    write_pos: AtomicU32,
}

impl Volume {
    /// Creates a new, empty volume file.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` for a zero capacity and an I/O
    /// error if the file already exists or cannot be written.
    pub fn create_new(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if capacity == 0 {
            return Err(NBTreeError::BadArgument(format!(
                "volume {} must have non-zero capacity",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = VolumeHeader {
            block_size: BLOCK_SIZE as u32,
            capacity,
        };
        file.write_all_at(&header.to_bytes(), 0)?;
        file.set_len(Self::file_len(capacity))?;
        file.sync_all()?;

        debug!(
            "Created volume {} with {} blocks",
            path.display(),
            capacity
        );

        Ok(Self {
            path,
            file,
            capacity,
            write_pos: AtomicU32::new(0),
        })
    }

    /// Opens an existing volume with its write cursor at zero.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::VolumeSizeMismatch` if the file length does not
    /// match the capacity declared in its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; VOLUME_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)?;
        let header = VolumeHeader::from_bytes(&buf)?;

        if header.block_size as usize != BLOCK_SIZE {
            return Err(NBTreeError::BadArgument(format!(
                "volume {} uses {} byte blocks, expected {}",
                path.display(),
                header.block_size,
                BLOCK_SIZE
            )));
        }

        let expected = Self::file_len(header.capacity);
        let actual = file.metadata()?.len();
        if expected != actual {
            return Err(NBTreeError::VolumeSizeMismatch { expected, actual });
        }

        debug!(
            "Opened volume {} with {} blocks",
            path.display(),
            header.capacity
        );

        Ok(Self {
            path,
            file,
            capacity: header.capacity,
            write_pos: AtomicU32::new(0),
        })
    }

    fn file_len(capacity: u32) -> u64 {
        (capacity as u64 + 1) * BLOCK_SIZE as u64
    }

    fn block_position(offset: u32) -> u64 {
        (offset as u64 + 1) * BLOCK_SIZE as u64
    }

    /// Restores the write cursor persisted by the metavolume.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if `write_pos` exceeds capacity.
    pub fn restore_write_pos(&self, write_pos: u32) -> Result<()> {
        if write_pos > self.capacity {
            return Err(NBTreeError::BadArgument(format!(
                "write position {} exceeds capacity {} of {}",
                write_pos,
                self.capacity,
                self.path.display()
            )));
        }
        self.write_pos.store(write_pos, Ordering::Release);
        Ok(())
    }

    /// Reserves the next free block and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::VolumeFull` when no blocks remain.
    pub fn allocate(&self) -> Result<u32> {
        let mut current = self.write_pos.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return Err(NBTreeError::VolumeFull {
                    capacity: self.capacity,
                });
            }
            match self.write_pos.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(c) => current = c,
            }
        }
    }

    /// Writes a payload into a previously allocated block.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if the block was not allocated or the
    /// payload does not fit into one block.
    pub fn write(&self, offset: u32, payload: &[u8]) -> Result<()> {
        if offset >= self.write_pos() {
            return Err(NBTreeError::BadArgument(format!(
                "block {} of {} was not allocated",
                offset,
                self.path.display()
            )));
        }
        let block = encode_frame(payload)?;
        self.file.write_all_at(&block, Self::block_position(offset))?;
        Ok(())
    }

    /// Reads the payload of a written block.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::AddressNotFound` if the block was never
    /// allocated or written, and an integrity error if its checksum fails.
    pub fn read(&self, offset: u32) -> Result<Vec<u8>> {
        let addr = LogicAddr::from_raw(offset as u64);
        if offset >= self.write_pos() {
            return Err(NBTreeError::AddressNotFound(addr));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        self.file
            .read_exact_at(&mut block, Self::block_position(offset))?;
        decode_frame(addr, &block)
    }

    /// Applies the sync mode to the volume file.
    pub fn sync(&self, mode: SyncMode) -> Result<()> {
        mode.sync(&self.file)
    }

    /// Path of the volume file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capacity in blocks.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Offset of the next block to allocate.
    pub fn write_pos(&self) -> u32 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Number of blocks that can still be allocated.
    pub fn remaining(&self) -> u32 {
        self.capacity - self.write_pos()
    }
}
