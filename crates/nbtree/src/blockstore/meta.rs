//! MetaVolume - durable allocation table for a set of volumes.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Magic: "NBMV" (4 bytes)                                     │
//! │  Version: u16 (2 bytes) = 1                                  │
//! │  Volume count: u32 (4 bytes)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Per volume (8 bytes each)                                   │
//! │  - Capacity in blocks: u32                                   │
//! │  - Write position: u32                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CRC32 of everything above (4 bytes)                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The table is rewritten as a whole on every [`MetaVolume::flush`] using
//! the tmp file → fsync → rename → fsync(dir) sequence, so a crash leaves
//! either the old or the new table on disk.

use crate::blockstore::{LogicAddr, SyncMode};
use crate::error::{NBTreeError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for metavolume files: "NBMV"
pub const META_MAGIC: [u8; 4] = *b"NBMV";

/// Current metavolume format version.
pub const META_VERSION: u16 = 1;

const META_PREFIX_SIZE: usize = 10;
const META_ENTRY_SIZE: usize = 8;

/// Allocation state of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptor {
    /// Declared capacity in blocks.
    pub capacity: u32,
    /// Offset of the next block to allocate.
    pub write_pos: u32,
}

impl VolumeDescriptor {
    fn allocate(&mut self) -> Result<u32> {
        if self.write_pos >= self.capacity {
            return Err(NBTreeError::VolumeFull {
                capacity: self.capacity,
            });
        }
        let offset = self.write_pos;
        self.write_pos += 1;
        Ok(offset)
    }

    /// Blocks still available in this volume.
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.write_pos)
    }
}

/// Durable directory of all volumes of a store.
///
/// Exactly one volume is current at a time: the first one with free blocks.
/// Allocation rolls over to the next volume only when the current one is
/// exhausted, and fails with `NBTreeError::StoreFull` once all are.
#[derive(Debug)]
pub struct MetaVolume {
    path: PathBuf,
    volumes: Vec<VolumeDescriptor>,
    current: usize,
    sync_mode: SyncMode,
    dirty: bool,
}

impl MetaVolume {
    /// Creates a new metavolume file for volumes of the given capacities.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` for an empty list or a zero
    /// capacity, and an I/O error if the file already exists.
    pub fn create_new(path: impl AsRef<Path>, capacities: &[u32]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if capacities.is_empty() {
            return Err(NBTreeError::BadArgument(
                "metavolume needs at least one volume".to_string(),
            ));
        }
        if let Some(ix) = capacities.iter().position(|&c| c == 0) {
            return Err(NBTreeError::BadArgument(format!(
                "volume {} has zero capacity",
                ix
            )));
        }

        let meta = Self {
            path,
            volumes: capacities
                .iter()
                .map(|&capacity| VolumeDescriptor {
                    capacity,
                    write_pos: 0,
                })
                .collect(),
            current: 0,
            sync_mode: SyncMode::default(),
            dirty: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&meta.path)?;
        file.write_all(&meta.to_bytes())?;
        file.sync_all()?;

        debug!(
            "Created metavolume {} with {} volumes",
            meta.path.display(),
            capacities.len()
        );
        Ok(meta)
    }

    /// Loads an existing allocation table.
    ///
    /// # Errors
    ///
    /// Returns an integrity error if the file is truncated or its checksum
    /// does not match.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let buf = fs::read(&path)?;
        let volumes = Self::parse(&buf)?;
        let current = Self::find_current(&volumes);

        debug!(
            "Opened metavolume {} with {} volumes, current volume {}",
            path.display(),
            volumes.len(),
            current
        );

        Ok(Self {
            path,
            volumes,
            current,
            sync_mode: SyncMode::default(),
            dirty: false,
        })
    }

    /// Sets the sync mode used by [`MetaVolume::flush`].
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    fn find_current(volumes: &[VolumeDescriptor]) -> usize {
        volumes
            .iter()
            .position(|v| v.remaining() > 0)
            .unwrap_or(volumes.len() - 1)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(META_PREFIX_SIZE + self.volumes.len() * META_ENTRY_SIZE + 4);
        buf.extend_from_slice(&META_MAGIC);
        buf.extend_from_slice(&META_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.volumes.len() as u32).to_le_bytes());
        for volume in &self.volumes {
            buf.extend_from_slice(&volume.capacity.to_le_bytes());
            buf.extend_from_slice(&volume.write_pos.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Result<Vec<VolumeDescriptor>> {
        if buf.len() < META_PREFIX_SIZE + 4 {
            return Err(NBTreeError::CorruptNode(format!(
                "metavolume is truncated ({} bytes)",
                buf.len()
            )));
        }

        let magic: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
        if magic != META_MAGIC {
            return Err(NBTreeError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > META_VERSION {
            return Err(NBTreeError::UnsupportedVersion(version));
        }

        let count = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
        let body_len = META_PREFIX_SIZE + count * META_ENTRY_SIZE;
        if count == 0 || buf.len() != body_len + 4 {
            return Err(NBTreeError::CorruptNode(format!(
                "metavolume declares {} volumes in {} bytes",
                count,
                buf.len()
            )));
        }

        let expected = u32::from_le_bytes([
            buf[body_len],
            buf[body_len + 1],
            buf[body_len + 2],
            buf[body_len + 3],
        ]);
        let actual = crc32fast::hash(&buf[..body_len]);
        if expected != actual {
            return Err(NBTreeError::ChecksumMismatch { expected, actual });
        }

        let mut volumes = Vec::with_capacity(count);
        for entry in buf[META_PREFIX_SIZE..body_len].chunks_exact(META_ENTRY_SIZE) {
            let capacity = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let write_pos = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
            if write_pos > capacity {
                return Err(NBTreeError::CorruptNode(format!(
                    "write position {} exceeds capacity {}",
                    write_pos, capacity
                )));
            }
            volumes.push(VolumeDescriptor {
                capacity,
                write_pos,
            });
        }
        Ok(volumes)
    }

    /// Reserves the next block of the current volume.
    ///
    /// When the current volume is exhausted the table rolls over to the next
    /// one. The new cursor is only durable after [`MetaVolume::flush`].
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::StoreFull` when every volume is exhausted.
    pub fn allocate(&mut self) -> Result<LogicAddr> {
        loop {
            match self.volumes[self.current].allocate() {
                Ok(offset) => {
                    self.dirty = true;
                    return Ok(LogicAddr::from_parts(self.current as u32, offset));
                }
                Err(NBTreeError::VolumeFull { .. }) if self.current + 1 < self.volumes.len() => {
                    self.current += 1;
                    info!(
                        "Volume {} is full, rolling allocation over to volume {}",
                        self.current - 1,
                        self.current
                    );
                }
                Err(NBTreeError::VolumeFull { .. }) => {
                    warn!(
                        "All {} volumes are full, {} blocks allocated",
                        self.volumes.len(),
                        self.used()
                    );
                    return Err(NBTreeError::StoreFull {
                        capacity: self.capacity(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Translates an address into (volume index, in-volume offset).
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::AddressNotFound` if the address was never issued.
    pub fn resolve(&self, addr: LogicAddr) -> Result<(usize, u32)> {
        let index = addr.volume() as usize;
        match self.volumes.get(index) {
            Some(volume) if addr.offset() < volume.write_pos && !addr.is_empty() => {
                Ok((index, addr.offset()))
            }
            _ => Err(NBTreeError::AddressNotFound(addr)),
        }
    }

    /// Persists the allocation table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing, syncing or renaming the table fails.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&self.to_bytes())?;
            self.sync_mode.sync(&file)?;
        }
        fs::rename(&tmp_path, &self.path)?;

        if self.sync_mode != SyncMode::None {
            let dir = self
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            File::open(dir)?.sync_all()?;
        }

        self.dirty = false;
        Ok(())
    }

    /// Path of the metavolume file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocation state of every volume.
    pub fn volumes(&self) -> &[VolumeDescriptor] {
        &self.volumes
    }

    /// Index of the volume receiving new allocations.
    pub fn current_volume(&self) -> usize {
        self.current
    }

    /// Combined capacity of all volumes in blocks.
    pub fn capacity(&self) -> u64 {
        self.volumes.iter().map(|v| v.capacity as u64).sum()
    }

    /// Number of allocated blocks across all volumes.
    pub fn used(&self) -> u64 {
        self.volumes.iter().map(|v| v.write_pos as u64).sum()
    }
}
