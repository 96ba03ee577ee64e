//! In-memory block store.

use crate::blockstore::{check_payload, BlockStore, LogicAddr};
use crate::error::{NBTreeError, Result};
use std::sync::{Mutex, MutexGuard};

/// Block store that keeps every payload in memory.
///
/// Addresses are dense indices starting at zero. The store has the same
/// read-after-write and immutability guarantees as [`super::FileStorage`],
/// but nothing survives the process.
#[derive(Debug, Default)]
pub struct MemStore {
    blocks: Mutex<Vec<Vec<u8>>>,
    capacity: Option<u64>,
}

impl MemStore {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that holds at most `capacity` blocks.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            blocks: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.blocks.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl BlockStore for MemStore {
    fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
        check_payload(payload)?;
        let mut blocks = self.lock();
        if let Some(capacity) = self.capacity {
            if blocks.len() as u64 >= capacity {
                return Err(NBTreeError::StoreFull { capacity });
            }
        }
        let addr = LogicAddr::from_raw(blocks.len() as u64);
        blocks.push(payload.to_vec());
        Ok(addr)
    }

    fn read(&self, addr: LogicAddr) -> Result<Vec<u8>> {
        self.lock()
            .get(addr.as_u64() as usize)
            .cloned()
            .ok_or(NBTreeError::AddressNotFound(addr))
    }

    fn exists(&self, addr: LogicAddr) -> bool {
        (addr.as_u64() as usize) < self.lock().len() && !addr.is_empty()
    }

    fn capacity(&self) -> u64 {
        self.capacity.unwrap_or(u64::MAX)
    }

    fn used(&self) -> u64 {
        self.lock().len() as u64
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
