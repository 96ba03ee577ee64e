//! Durable multi-volume block store.

use crate::blockstore::meta::MetaVolume;
use crate::blockstore::volume::Volume;
use crate::blockstore::{check_payload, BlockStore, LogicAddr, SyncMode, BLOCK_SIZE};
use crate::error::{NBTreeError, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone, Default)]
pub struct FileStorageConfig {
    /// Sync mode applied to metavolume flushes and block writes.
    pub sync_mode: SyncMode,
}

impl FileStorageConfig {
    /// Creates a configuration with a custom sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }
}

/// Utilization of one volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeStats {
    /// Position of the volume in the store.
    pub index: usize,
    /// Capacity in blocks.
    pub capacity: u32,
    /// Allocated blocks.
    pub used: u32,
    /// Free space in bytes.
    pub free_space: u64,
}

/// Block store backed by a [`MetaVolume`] and a fixed list of [`Volume`]s.
///
/// Allocation is the only critical section: the metavolume is guarded by a
/// mutex, and an address is issued only after the table update that
/// reserved it has been flushed. Block I/O and address lookups happen
/// outside the lock.
#[derive(Debug)]
pub struct FileStorage {
    meta: Mutex<MetaVolume>,
    volumes: Vec<Volume>,
    config: FileStorageConfig,
}

impl FileStorage {
    /// Creates the metavolume and volume files of a new store.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if the path and capacity lists
    /// disagree, and an error if any of the files already exists.
    pub fn create<P: AsRef<Path>>(
        meta_path: impl AsRef<Path>,
        volume_paths: &[P],
        capacities: &[u32],
    ) -> Result<()> {
        if volume_paths.len() != capacities.len() {
            return Err(NBTreeError::BadArgument(format!(
                "{} volume paths for {} capacities",
                volume_paths.len(),
                capacities.len()
            )));
        }
        MetaVolume::create_new(meta_path, capacities)?;
        for (path, &capacity) in volume_paths.iter().zip(capacities) {
            Volume::create_new(path, capacity)?;
        }
        Ok(())
    }

    /// Opens an existing store.
    ///
    /// `volume_paths` must list the volumes in the order they were created.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::VolumeCountMismatch` or
    /// `NBTreeError::VolumeSizeMismatch` if the files disagree with the
    /// metavolume table.
    pub fn open<P: AsRef<Path>>(
        meta_path: impl AsRef<Path>,
        volume_paths: &[P],
        config: FileStorageConfig,
    ) -> Result<Self> {
        let meta = MetaVolume::open(meta_path)?.with_sync_mode(config.sync_mode);
        if meta.volumes().len() != volume_paths.len() {
            return Err(NBTreeError::VolumeCountMismatch {
                expected: meta.volumes().len(),
                actual: volume_paths.len(),
            });
        }

        let mut volumes = Vec::with_capacity(volume_paths.len());
        for (path, descriptor) in volume_paths.iter().zip(meta.volumes()) {
            let volume = Volume::open(path)?;
            if volume.capacity() != descriptor.capacity {
                return Err(NBTreeError::VolumeSizeMismatch {
                    expected: (descriptor.capacity as u64 + 1) * BLOCK_SIZE as u64,
                    actual: (volume.capacity() as u64 + 1) * BLOCK_SIZE as u64,
                });
            }
            volume.restore_write_pos(descriptor.write_pos)?;
            volumes.push(volume);
        }

        info!(
            "Opened block store {} with {} volumes, {}/{} blocks used",
            meta.path().display(),
            volumes.len(),
            meta.used(),
            meta.capacity()
        );

        Ok(Self {
            meta: Mutex::new(meta),
            volumes,
            config,
        })
    }

    fn lock_meta(&self) -> MutexGuard<'_, MetaVolume> {
        self.meta.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Maps an address to its volume using the volume's own write cursor.
    ///
    /// The volume cursors advance in lockstep with the metavolume table, so
    /// lookups never take the allocation lock.
    fn resolve(&self, addr: LogicAddr) -> Result<(&Volume, u32)> {
        match self.volumes.get(addr.volume() as usize) {
            Some(volume) if !addr.is_empty() && addr.offset() < volume.write_pos() => {
                Ok((volume, addr.offset()))
            }
            _ => Err(NBTreeError::AddressNotFound(addr)),
        }
    }

    /// Returns the configuration of the store.
    pub fn config(&self) -> &FileStorageConfig {
        &self.config
    }

    /// Per-volume utilization.
    pub fn volume_stats(&self) -> Vec<VolumeStats> {
        self.volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| VolumeStats {
                index,
                capacity: volume.capacity(),
                used: volume.write_pos(),
                free_space: volume.remaining() as u64 * BLOCK_SIZE as u64,
            })
            .collect()
    }

    /// Index of the volume currently receiving allocations.
    pub fn current_volume(&self) -> usize {
        self.lock_meta().current_volume()
    }
}

impl BlockStore for FileStorage {
    fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        check_payload(payload)?;

        let (addr, index, offset) = {
            let mut meta = self.lock_meta();
            let addr = meta.allocate()?;
            let (index, offset) = meta.resolve(addr)?;
            let volume_offset = self.volumes[index].allocate()?;
            if volume_offset != offset {
                return Err(NBTreeError::CorruptNode(format!(
                    "volume {} cursor {} disagrees with metavolume offset {}",
                    index, volume_offset, offset
                )));
            }
            meta.flush()?;
            (addr, index, offset)
        };

        let volume = &self.volumes[index];
        volume.write(offset, payload)?;
        volume.sync(self.config.sync_mode)?;

        debug!("Wrote {} byte block at {}", payload.len(), addr);
        Ok(addr)
    }

    fn read(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        let (volume, offset) = self.resolve(addr)?;
        volume.read(offset).map_err(|err| match err {
            NBTreeError::AddressNotFound(_) => NBTreeError::AddressNotFound(addr),
            other => other,
        })
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        self.resolve(addr).is_ok()
    }

    fn capacity(&self) -> u64 {
        self.volumes.iter().map(|v| v.capacity() as u64).sum()
    }

    fn used(&self) -> u64 {
        self.volumes.iter().map(|v| v.write_pos() as u64).sum()
    }

    fn flush(&self) -> Result<()> {
        self.lock_meta().flush()?;
        for volume in &self.volumes {
            volume.sync(self.config.sync_mode)?;
        }
        Ok(())
    }
}
