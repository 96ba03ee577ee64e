//! Per-series roots collection.

use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::{NBTreeError, Result};
use crate::nbtree::iterator::{NBTreeCursor, NBTreeIterator, ScanRange, TreeSnapshot};
use crate::nbtree::node::{NBTreeLeaf, NBTreeNode, NBTreeSummary, NBTreeSuperblock};
use crate::nbtree::{SeriesId, Timestamp};
use std::sync::Arc;
use tracing::{debug, warn};

/// Growable tree of one series.
///
/// Owns the open path (one leaf plus one open superblock per level above
/// it) and the list of sealed roots. The collection is not internally
/// synchronized: appends to one series must be serialized by the caller.
/// Independent series may share one [`BlockStore`] and append concurrently.
#[derive(Debug)]
pub struct NBTreeRootsCollection {
    id: SeriesId,
    store: Arc<dyn BlockStore>,
    roots: Vec<LogicAddr>,
    leaf: NBTreeLeaf,
    /// Open superblocks; index `i` holds level `i + 1`.
    superblocks: Vec<NBTreeSuperblock>,
}

impl NBTreeRootsCollection {
    /// Creates an empty tree for series `id`.
    pub fn new(id: SeriesId, store: Arc<dyn BlockStore>) -> Self {
        Self {
            id,
            store,
            roots: Vec::new(),
            leaf: NBTreeLeaf::new(id),
            superblocks: Vec::new(),
        }
    }

    /// Reopens a tree from its persisted root list.
    ///
    /// The open path starts empty, one level above the last root.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::AddressNotFound` if a root was never written,
    /// and an integrity error if the last root is not a node of this series.
    pub fn open(id: SeriesId, roots: Vec<LogicAddr>, store: Arc<dyn BlockStore>) -> Result<Self> {
        if let Some(missing) = roots.iter().find(|addr| !store.exists(**addr)) {
            return Err(NBTreeError::AddressNotFound(*missing));
        }

        let height = match roots.last() {
            Some(last) => NBTreeNode::read(store.as_ref(), *last, id)?.level() + 1,
            None => 0,
        };
        debug!(
            "Opened series {} with {} roots, height {}",
            id,
            roots.len(),
            height
        );

        Ok(Self {
            id,
            roots,
            leaf: NBTreeLeaf::new(id),
            superblocks: (1..=height).map(|level| NBTreeSuperblock::new(id, level)).collect(),
            store,
        })
    }

    /// Appends one sample.
    ///
    /// Seals the leaf when it fills, and every ancestor that fills in turn.
    /// The sample is stored if and only if `append` returns `Ok`. When the
    /// leaf it filled cannot be sealed, the sample is taken back out. When
    /// the leaf seals but an ancestor does not, the sample is already part
    /// of a sealed block; the ancestor seal stays pending and is retried by
    /// the next `append` or [`NBTreeRootsCollection::close`], which report
    /// its error.
    ///
    /// # Errors
    ///
    /// Returns the store error of the leaf seal or of a pending seal. The
    /// sample is not stored and the call may be retried.
    pub fn append(&mut self, ts: Timestamp, value: f64) -> Result<()> {
        self.seal_full_nodes()?;
        self.leaf.insert(ts, value)?;
        if !self.leaf.is_full() {
            return Ok(());
        }

        let (addr, summary) = match self.leaf.seal(self.store.as_ref()) {
            Ok(sealed) => sealed,
            Err(err) => {
                self.leaf.pop();
                return Err(err);
            }
        };
        self.leaf = NBTreeLeaf::new(self.id);
        if let Err(err) = self.install(1, addr, summary) {
            warn!(
                "Series {} left a seal pending after storing leaf {}: {}",
                self.id, addr, err
            );
        }
        Ok(())
    }

    /// Seals every full open node, top level first so each parent has room.
    fn seal_full_nodes(&mut self) -> Result<()> {
        for level in (1..=self.superblocks.len()).rev() {
            if self.superblocks[level - 1].is_full() {
                self.seal_superblock(level)?;
            }
        }
        if self.leaf.is_full() {
            self.seal_leaf()?;
        }
        Ok(())
    }

    fn seal_leaf(&mut self) -> Result<()> {
        let (addr, summary) = self.leaf.seal(self.store.as_ref())?;
        self.leaf = NBTreeLeaf::new(self.id);
        self.install(1, addr, summary)
    }

    fn seal_superblock(&mut self, level: usize) -> Result<()> {
        let node = &mut self.superblocks[level - 1];
        let (addr, summary) = node.seal(self.store.as_ref())?;
        *node = NBTreeSuperblock::new(self.id, level as u16);
        self.install(level + 1, addr, summary)
    }

    /// Links a sealed child into the open node at `level`, or registers it
    /// as a root when `level` is above the open path.
    fn install(&mut self, level: usize, addr: LogicAddr, summary: NBTreeSummary) -> Result<()> {
        if level > self.superblocks.len() {
            self.roots.push(addr);
            self.superblocks.push(NBTreeSuperblock::new(self.id, level as u16));
            debug!(
                "Series {} registered root {} ({} samples), height is now {}",
                self.id,
                addr,
                summary.count,
                level
            );
            return Ok(());
        }

        let node = &mut self.superblocks[level - 1];
        node.insert(addr, summary)?;
        if node.is_full() {
            self.seal_superblock(level)?;
        }
        Ok(())
    }

    /// Seals every non-empty open node and returns the root list.
    ///
    /// Partially filled nodes are sealed bottom-up, each into its parent,
    /// and the topmost becomes a new root. Every sample appended before a
    /// successful `close` survives [`NBTreeRootsCollection::open`] with the
    /// returned list. The collection stays usable afterwards.
    ///
    /// # Errors
    ///
    /// Returns the store error of a seal that failed; nothing already
    /// appended is dropped and `close` may be retried.
    pub fn close(&mut self) -> Result<Vec<LogicAddr>> {
        self.seal_full_nodes()?;

        let mut pending = None;
        if !self.leaf.is_empty() {
            pending = Some(self.leaf.seal(self.store.as_ref())?);
            self.leaf = NBTreeLeaf::new(self.id);
        }
        for (index, node) in self.superblocks.iter_mut().enumerate() {
            if let Some((addr, summary)) = pending.take() {
                node.insert(addr, summary)?;
            }
            if !node.is_empty() {
                pending = Some(node.seal(self.store.as_ref())?);
                *node = NBTreeSuperblock::new(self.id, index as u16 + 1);
            }
        }
        if let Some((addr, summary)) = pending {
            self.roots.push(addr);
            debug!(
                "Series {} closed with root {} ({} samples)",
                self.id, addr, summary.count
            );
        }

        self.store.flush()?;
        Ok(self.roots.clone())
    }

    /// Returns an iterator over the samples in the range.
    ///
    /// `begin < end` scans `begin <= ts < end` ascending, `begin > end`
    /// scans `end < ts <= begin` descending, and `begin == end` is empty.
    /// The open path is copied, so later appends do not affect the result.
    pub fn search(&self, begin: Timestamp, end: Timestamp) -> NBTreeIterator {
        let snapshot = TreeSnapshot {
            roots: self.roots.clone(),
            children: self
                .superblocks
                .iter()
                .rev()
                .flat_map(|node| node.children().iter().copied())
                .collect(),
            timestamps: self.leaf.timestamps().to_vec(),
            values: self.leaf.values().to_vec(),
        };
        NBTreeIterator::new(Arc::clone(&self.store), self.id, begin, end, snapshot)
    }

    /// Returns a paged cursor over the samples in the range.
    ///
    /// # Errors
    ///
    /// Returns the error of the first page read.
    pub fn cursor(&self, begin: Timestamp, end: Timestamp) -> Result<NBTreeCursor> {
        NBTreeCursor::new(self.search(begin, end))
    }

    /// Summarizes the samples in the range without visiting subtrees that
    /// lie entirely inside it.
    ///
    /// The range follows the same convention as
    /// [`NBTreeRootsCollection::search`]; the result merges samples in
    /// append order regardless of direction.
    ///
    /// # Errors
    ///
    /// Returns the error of any node that could not be read.
    pub fn aggregate(&self, begin: Timestamp, end: Timestamp) -> Result<NBTreeSummary> {
        let range = ScanRange::new(begin, end);
        let mut result = NBTreeSummary::empty();
        if range.is_empty() {
            return Ok(result);
        }

        for addr in &self.roots {
            self.aggregate_node(*addr, None, &range, &mut result)?;
        }
        for node in self.superblocks.iter().rev() {
            for (addr, summary) in node.children() {
                self.aggregate_node(*addr, Some(summary), &range, &mut result)?;
            }
        }
        add_samples(self.leaf.timestamps(), self.leaf.values(), &range, &mut result);
        Ok(result)
    }

    fn aggregate_node(
        &self,
        addr: LogicAddr,
        summary: Option<&NBTreeSummary>,
        range: &ScanRange,
        result: &mut NBTreeSummary,
    ) -> Result<()> {
        if let Some(summary) = summary {
            if range.covers(summary) {
                result.merge(summary);
                return Ok(());
            }
            if !range.overlaps(summary) {
                return Ok(());
            }
        }

        match NBTreeNode::read(self.store.as_ref(), addr, self.id)? {
            NBTreeNode::Leaf(leaf) => {
                add_samples(leaf.timestamps(), leaf.values(), range, result);
            }
            NBTreeNode::Superblock(node) => {
                if range.covers(node.summary()) {
                    result.merge(node.summary());
                    return Ok(());
                }
                for (child, summary) in node.children() {
                    self.aggregate_node(*child, Some(summary), range, result)?;
                }
            }
        }
        Ok(())
    }

    /// Series identifier.
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Sealed roots, oldest first.
    pub fn roots(&self) -> &[LogicAddr] {
        &self.roots
    }

    /// Number of open superblock levels above the leaf.
    pub fn height(&self) -> usize {
        self.superblocks.len()
    }

    /// Block store backing the tree.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }
}

fn add_samples(timestamps: &[Timestamp], values: &[f64], range: &ScanRange, result: &mut NBTreeSummary) {
    for (ts, value) in timestamps.iter().zip(values) {
        if range.contains(*ts) {
            result.add(*ts, *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemStore;
    use crate::nbtree::{NBTREE_FANOUT, NBTREE_LEAF_CAPACITY};
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn tree_with(n: u64) -> NBTreeRootsCollection {
        let mut tree = NBTreeRootsCollection::new(1, Arc::new(MemStore::new()));
        for i in 0..n {
            tree.append(i, i as f64).unwrap();
        }
        tree
    }

    fn scan(tree: &NBTreeRootsCollection, begin: Timestamp, end: Timestamp) -> Vec<Timestamp> {
        tree.search(begin, end).map(|item| item.unwrap().0).collect()
    }

    #[test]
    fn test_growth() {
        let leaf = NBTREE_LEAF_CAPACITY as u64;
        let mut tree = tree_with(leaf - 1);
        assert!(tree.roots().is_empty());
        assert_eq!(tree.height(), 0);

        // The first full leaf becomes the first root.
        tree.append(leaf - 1, 0.0).unwrap();
        assert_eq!(tree.roots().len(), 1);
        assert_eq!(tree.height(), 1);

        // A full level-1 superblock becomes the second root.
        for i in leaf..leaf * (NBTREE_FANOUT as u64 + 1) {
            tree.append(i, 0.0).unwrap();
        }
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.height(), 2);
        assert_eq!(tree.store().used(), NBTREE_FANOUT as u64 + 2);
    }

    #[test]
    fn test_search_across_roots_and_open_path() {
        let n = (NBTREE_LEAF_CAPACITY * 40 + 17) as u64;
        let tree = tree_with(n);

        assert_eq!(scan(&tree, 0, n), (0..n).collect::<Vec<_>>());
        assert_eq!(scan(&tree, n, 0), (1..=n - 1).rev().collect::<Vec<_>>());
        assert_eq!(scan(&tree, 500, 7_000), (500..7_000).collect::<Vec<_>>());
        assert!(scan(&tree, 42, 42).is_empty());
    }

    #[test]
    fn test_search_is_a_snapshot() {
        let mut tree = tree_with(10);
        let iter = tree.search(0, 100);
        tree.append(10, 0.0).unwrap();
        assert_eq!(iter.count(), 10);
    }

    #[test]
    fn test_out_of_order_timestamps() {
        let mut tree = NBTreeRootsCollection::new(1, Arc::new(MemStore::new()));
        let n = NBTREE_LEAF_CAPACITY as u64 * 3;
        // Reverse order inside each block of 100 samples.
        let timestamps: Vec<u64> = (0..n).map(|i| (i / 100) * 100 + 99 - i % 100).collect();
        for ts in &timestamps {
            tree.append(*ts, *ts as f64).unwrap();
        }

        let mut expected = timestamps.clone();
        expected.sort_unstable();
        expected.retain(|ts| *ts < n);
        assert_eq!(scan(&tree, 0, n), expected);
    }

    #[test]
    fn test_close_and_reopen() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let n = (NBTREE_LEAF_CAPACITY * 3 + 5) as u64;
        let mut tree = NBTreeRootsCollection::new(9, Arc::clone(&store));
        for i in 0..n {
            tree.append(i, i as f64).unwrap();
        }
        let roots = tree.close().unwrap();
        assert_eq!(roots.len(), 2);
        // Closing again seals nothing new.
        assert_eq!(tree.close().unwrap(), roots);

        let reopened = NBTreeRootsCollection::open(9, roots, store).unwrap();
        assert_eq!(reopened.height(), 2);
        assert_eq!(scan(&reopened, 0, n), (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_open_rejects_unknown_root() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let result = NBTreeRootsCollection::open(1, vec![LogicAddr::from_raw(3)], store);
        assert!(matches!(result, Err(NBTreeError::AddressNotFound(_))));
    }

    #[test]
    fn test_aggregate() {
        let n = (NBTREE_LEAF_CAPACITY * 50 + 3) as u64;
        let tree = tree_with(n);

        let all = tree.aggregate(0, n).unwrap();
        assert_eq!(all.count, n);
        assert_eq!(all.first_ts, 0);
        assert_eq!(all.last_ts, n - 1);
        assert_eq!(all.sum, (0..n).map(|i| i as f64).sum::<f64>());

        let part = tree.aggregate(1_000, 2_000).unwrap();
        assert_eq!(part.count, 1_000);
        assert_eq!(part.min, 1_000.0);
        assert_eq!(part.max, 1_999.0);

        let backward = tree.aggregate(2_000, 1_000).unwrap();
        assert_eq!(backward.count, 1_000);
        assert_eq!(backward.min_ts, 1_001);
        assert_eq!(backward.max_ts, 2_000);

        assert!(tree.aggregate(5, 5).unwrap().is_empty());
    }

    #[test]
    fn test_store_full_rejects_sample() {
        let leaf = NBTREE_LEAF_CAPACITY as u64;
        let mut tree = NBTreeRootsCollection::new(1, Arc::new(MemStore::with_capacity(1)));
        for i in 0..leaf * 2 - 1 {
            tree.append(i, 0.0).unwrap();
        }

        // The sample that would fill the second leaf is not stored.
        assert!(tree.append(leaf * 2 - 1, 0.0).unwrap_err().is_capacity());
        assert!(tree.append(leaf * 2 - 1, 0.0).unwrap_err().is_capacity());
        assert_eq!(scan(&tree, 0, u64::MAX), (0..leaf * 2 - 1).collect::<Vec<_>>());

        let summary = tree.aggregate(0, u64::MAX).unwrap();
        assert_eq!(summary.count, leaf * 2 - 1);
        assert_eq!(summary.max_ts, leaf * 2 - 2);
    }

    /// Fails one append after letting `skip` more through.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemStore,
        armed: AtomicBool,
        skip: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_once_after(&self, skip: usize) {
            self.skip.store(skip, Ordering::SeqCst);
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    impl BlockStore for FlakyStore {
        fn append(&self, payload: &[u8]) -> Result<LogicAddr> {
            if self.armed.load(Ordering::SeqCst)
                && self
                    .skip
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
            {
                self.armed.store(false, Ordering::SeqCst);
                return Err(NBTreeError::IoError(io::Error::other("transient")));
            }
            self.inner.append(payload)
        }

        fn read(&self, addr: LogicAddr) -> Result<Vec<u8>> {
            self.inner.read(addr)
        }

        fn exists(&self, addr: LogicAddr) -> bool {
            self.inner.exists(addr)
        }

        fn capacity(&self) -> u64 {
            self.inner.capacity()
        }

        fn used(&self) -> u64 {
            self.inner.used()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn count_of(samples: &[Timestamp], ts: Timestamp) -> usize {
        samples.iter().filter(|t| **t == ts).count()
    }

    #[test]
    fn test_retry_after_failed_leaf_seal_stores_sample_once() {
        let leaf = NBTREE_LEAF_CAPACITY as u64;
        let store = Arc::new(FlakyStore::default());
        let mut tree = NBTreeRootsCollection::new(1, store.clone());
        for i in 0..leaf - 1 {
            tree.append(i, 0.0).unwrap();
        }

        store.fail_once_after(0);
        let err = tree.append(leaf - 1, 1.0).unwrap_err();
        assert!(matches!(err, NBTreeError::IoError(_)));
        assert!(tree.roots().is_empty());

        tree.append(leaf - 1, 1.0).unwrap();
        assert_eq!(tree.roots().len(), 1);

        let samples = scan(&tree, 0, u64::MAX);
        assert_eq!(samples.len() as u64, leaf);
        assert_eq!(count_of(&samples, leaf - 1), 1);
    }

    #[test]
    fn test_failed_ancestor_seal_keeps_sample_and_retries() {
        let leaf = NBTREE_LEAF_CAPACITY as u64;
        let fanout = NBTREE_FANOUT as u64;
        let store = Arc::new(FlakyStore::default());
        let mut tree = NBTreeRootsCollection::new(1, store.clone());
        // The next full leaf also fills the level-1 superblock.
        let last = leaf * (fanout + 1) - 1;
        for i in 0..last {
            tree.append(i, 0.0).unwrap();
        }

        store.fail_once_after(1);
        tree.append(last, 0.0).unwrap();
        assert_eq!(tree.roots().len(), 1);

        // The pending superblock seal succeeds before the next sample lands.
        tree.append(last + 1, 0.0).unwrap();
        assert_eq!(tree.roots().len(), 2);

        let samples = scan(&tree, 0, u64::MAX);
        assert_eq!(samples, (0..=last + 1).collect::<Vec<_>>());
        assert_eq!(count_of(&samples, last), 1);
    }
}
