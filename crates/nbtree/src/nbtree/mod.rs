//! Per-series append-only tree.
//!
//! Samples of one series are appended to an open leaf. A full leaf is
//! sealed into an immutable block and referenced, together with its
//! [`NBTreeSummary`], from the open superblock one level up. Full
//! superblocks seal the same way. When the topmost open node seals it
//! becomes a *root*: its address is appended to the series' root list and
//! a new, empty level is opened above the path.
//!
//! ```text
//!   roots: [r0, r1, r2]          open path
//!                                 level 2  [c, c, _, ...]
//!                                 level 1  [c, _, ...]
//!                                 level 0  (t, v) (t, v) ...
//! ```
//!
//! Only sealed nodes and the root list are durable. The open path is lost
//! on crash unless [`NBTreeRootsCollection::close`] seals it first.

pub mod gorilla;
pub mod iterator;
pub mod node;
pub mod roots;
pub mod sink;

pub use iterator::{NBTreeCursor, NBTreeIterator};
pub use node::{NBTreeLeaf, NBTreeSummary, NBTreeSuperblock};
pub use roots::NBTreeRootsCollection;
pub use sink::{ScanDirection, SearchQuery, SearchSink};

/// Sample timestamp.
pub type Timestamp = u64;

/// Identifier of one time series.
pub type SeriesId = u64;

/// Number of samples a leaf holds before it is sealed.
pub const NBTREE_LEAF_CAPACITY: usize = 240;

/// Number of children a superblock holds before it is sealed.
pub const NBTREE_FANOUT: usize = 32;

/// Default page size of [`NBTreeCursor`].
pub const NBTREE_CURSOR_PAGE_SIZE: usize = 1024;
