//! NBTree - Alopex Time Series Block Storage
//!
//! This crate provides the per-series storage engine of the Alopex time
//! series database: an append-only tree of immutable blocks on top of a
//! multi-volume block store.
//!
//! # Components
//!
//! - [`BlockStore`]: append/read of immutable blocks by [`LogicAddr`]
//! - [`FileStorage`]: durable store built from a [`MetaVolume`] and volumes
//! - [`MemStore`]: in-memory store with the same semantics
//! - [`NBTreeRootsCollection`]: per-series tree with `append` and `search`
//! - [`NBTreeIterator`] / [`NBTreeCursor`]: ordered pull scans
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_nbtree::{FileStorage, FileStorageConfig, NBTreeRootsCollection};
//! use std::sync::Arc;
//!
//! FileStorage::create(&meta_path, &volume_paths, &[1024, 1024])?;
//! let store = Arc::new(FileStorage::open(&meta_path, &volume_paths, FileStorageConfig::default())?);
//!
//! let mut series = NBTreeRootsCollection::new(42, store.clone());
//! series.append(1_000, 0.75)?;
//! series.append(1_010, 0.80)?;
//!
//! for sample in series.search(0, 2_000) {
//!     let (ts, value) = sample?;
//! }
//!
//! // Seal the open path and persist the root list.
//! let roots = series.close()?;
//! ```

#![deny(missing_docs)]

pub mod blockstore;
pub mod error;
pub mod nbtree;

pub use blockstore::{
    BlockStore, BlockStoreStats, FileStorage, FileStorageConfig, LogicAddr, MemStore, MetaVolume,
    SyncMode, Volume, VolumeStats, BLOCK_SIZE,
};
pub use error::{NBTreeError, Result};
pub use nbtree::{
    NBTreeCursor, NBTreeIterator, NBTreeLeaf, NBTreeRootsCollection, NBTreeSummary,
    NBTreeSuperblock, ScanDirection, SearchQuery, SearchSink, SeriesId, Timestamp,
};
