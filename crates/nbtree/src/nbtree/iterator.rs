//! Range scan over one series.
//!
//! [`NBTreeIterator`] merges every source of a series into one ordered
//! stream: sealed roots, the sealed children referenced from the open path,
//! and a copy of the open leaf taken when the search started. Sources sit
//! in a binary heap keyed by the smallest scan-order key they can still
//! produce. Node references are read from the store only when they reach
//! the top of the heap, so a scan touches just the blocks it emits from.

use crate::blockstore::{BlockStore, LogicAddr};
use crate::error::{NBTreeError, Result};
use crate::nbtree::node::{NBTreeNode, NBTreeSummary};
use crate::nbtree::sink::ScanDirection;
use crate::nbtree::{SeriesId, Timestamp, NBTREE_CURSOR_PAGE_SIZE};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Half-open time range with a direction.
///
/// Forward ranges (`begin < end`) hold `begin <= ts < end`, backward ranges
/// (`begin > end`) hold `end < ts <= begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanRange {
    begin: Timestamp,
    end: Timestamp,
}

impl ScanRange {
    pub(crate) fn new(begin: Timestamp, end: Timestamp) -> Self {
        Self { begin, end }
    }

    pub(crate) fn direction(&self) -> ScanDirection {
        if self.end < self.begin {
            ScanDirection::Backward
        } else {
            ScanDirection::Forward
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub(crate) fn contains(&self, ts: Timestamp) -> bool {
        match self.direction() {
            ScanDirection::Forward => self.begin <= ts && ts < self.end,
            ScanDirection::Backward => self.end < ts && ts <= self.begin,
        }
    }

    /// Returns true if some sample of `summary` may fall in the range.
    pub(crate) fn overlaps(&self, summary: &NBTreeSummary) -> bool {
        if summary.is_empty() || self.is_empty() {
            return false;
        }
        match self.direction() {
            ScanDirection::Forward => summary.max_ts >= self.begin && summary.min_ts < self.end,
            ScanDirection::Backward => summary.min_ts <= self.begin && summary.max_ts > self.end,
        }
    }

    /// Returns true if every sample of `summary` falls in the range.
    pub(crate) fn covers(&self, summary: &NBTreeSummary) -> bool {
        !summary.is_empty() && self.contains(summary.min_ts) && self.contains(summary.max_ts)
    }

    /// Scan-order key: smaller keys are emitted first.
    fn key(&self, ts: Timestamp) -> u64 {
        match self.direction() {
            ScanDirection::Forward => ts,
            ScanDirection::Backward => u64::MAX - ts,
        }
    }

    /// Lower bound of the keys a node with `summary` can produce.
    fn node_key(&self, summary: &NBTreeSummary) -> u64 {
        match self.direction() {
            ScanDirection::Forward => self.key(summary.min_ts.max(self.begin)),
            ScanDirection::Backward => self.key(summary.max_ts.min(self.begin)),
        }
    }

    /// Keeps the samples in range and sorts them in scan order.
    ///
    /// The sort is stable, so equal timestamps keep append order.
    fn filter_sorted(&self, timestamps: &[Timestamp], values: &[f64]) -> SampleRun {
        let mut samples: Vec<(Timestamp, f64)> = timestamps
            .iter()
            .zip(values)
            .filter(|(ts, _)| self.contains(**ts))
            .map(|(ts, value)| (*ts, *value))
            .collect();
        samples.sort_by_key(|(ts, _)| self.key(*ts));
        SampleRun { samples, pos: 0 }
    }
}

/// Open path of a series copied at search time.
#[derive(Debug, Clone, Default)]
pub(crate) struct TreeSnapshot {
    /// Sealed roots, oldest first.
    pub(crate) roots: Vec<LogicAddr>,
    /// Children of the open superblocks.
    pub(crate) children: Vec<(LogicAddr, NBTreeSummary)>,
    /// Open leaf samples in append order.
    pub(crate) timestamps: Vec<Timestamp>,
    /// Open leaf values in append order.
    pub(crate) values: Vec<f64>,
}

#[derive(Debug)]
struct SampleRun {
    samples: Vec<(Timestamp, f64)>,
    pos: usize,
}

impl SampleRun {
    fn peek(&self) -> Option<Timestamp> {
        self.samples.get(self.pos).map(|(ts, _)| *ts)
    }
}

#[derive(Debug)]
enum Source {
    Node(LogicAddr),
    Run(SampleRun),
}

#[derive(Debug)]
struct HeapEntry {
    key: u64,
    seq: u64,
    source: Source,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; the smallest (key, seq) must come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.key, other.seq).cmp(&(self.key, self.seq))
    }
}

/// Ordered pull iterator over the samples of one series in a time range.
///
/// Produced by [`super::NBTreeRootsCollection::search`]. Samples appended
/// after the search started are not visible. Equal timestamps from
/// different nodes are emitted in an unspecified order.
#[derive(Debug)]
pub struct NBTreeIterator {
    store: Arc<dyn BlockStore>,
    id: SeriesId,
    range: ScanRange,
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl NBTreeIterator {
    pub(crate) fn new(
        store: Arc<dyn BlockStore>,
        id: SeriesId,
        begin: Timestamp,
        end: Timestamp,
        snapshot: TreeSnapshot,
    ) -> Self {
        let range = ScanRange::new(begin, end);
        let mut iter = Self {
            store,
            id,
            range,
            heap: BinaryHeap::new(),
            // Sequence 0 is reserved for requeued output.
            next_seq: 1,
        };
        if range.is_empty() {
            return iter;
        }

        let start_key = range.key(begin);
        for addr in snapshot.roots {
            iter.push(start_key, Source::Node(addr));
        }
        for (addr, summary) in snapshot.children {
            if range.overlaps(&summary) {
                iter.push(range.node_key(&summary), Source::Node(addr));
            }
        }
        let tail = range.filter_sorted(&snapshot.timestamps, &snapshot.values);
        iter.push_run(tail);
        iter
    }

    /// Direction of the scan.
    pub fn direction(&self) -> ScanDirection {
        self.range.direction()
    }

    fn push(&mut self, key: u64, source: Source) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { key, seq, source });
    }

    fn push_run(&mut self, run: SampleRun) {
        if let Some(ts) = run.peek() {
            self.push(self.range.key(ts), Source::Run(run));
        }
    }

    /// Reads a node and replaces it in the heap by its in-range content.
    fn expand(&mut self, addr: LogicAddr) -> Result<()> {
        match NBTreeNode::read(self.store.as_ref(), addr, self.id)? {
            NBTreeNode::Leaf(leaf) => {
                let run = self.range.filter_sorted(leaf.timestamps(), leaf.values());
                self.push_run(run);
            }
            NBTreeNode::Superblock(node) => {
                for (child, summary) in node.children() {
                    if self.range.overlaps(summary) {
                        self.push(self.range.node_key(summary), Source::Node(*child));
                    }
                }
            }
        }
        Ok(())
    }

    /// Puts already emitted samples back in front of the stream.
    fn requeue(&mut self, timestamps: &[Timestamp], values: &[f64]) {
        if let Some(&first) = timestamps.first() {
            let samples = timestamps.iter().copied().zip(values.iter().copied()).collect();
            self.heap.push(HeapEntry {
                key: self.range.key(first),
                seq: 0,
                source: Source::Run(SampleRun { samples, pos: 0 }),
            });
        }
    }

    /// Fills the buffers with the next samples in scan order.
    ///
    /// Returns the number of samples written; a count smaller than
    /// `min(timestamps.len(), values.len())` means the scan is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the store or integrity error of a node that could not be
    /// read. Nothing is consumed by a failed call: the samples it had
    /// gathered and the unreadable node are both retried by the next call.
    pub fn read(&mut self, timestamps: &mut [Timestamp], values: &mut [f64]) -> Result<usize> {
        let max = timestamps.len().min(values.len());
        let mut count = 0;

        while count < max {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            match entry.source {
                Source::Node(addr) => {
                    if let Err(err) = self.expand(addr) {
                        self.heap.push(HeapEntry {
                            key: entry.key,
                            seq: entry.seq,
                            source: Source::Node(addr),
                        });
                        self.requeue(&timestamps[..count], &values[..count]);
                        return Err(err);
                    }
                }
                Source::Run(mut run) => {
                    while let Some((ts, value)) = run.samples.get(run.pos).copied() {
                        if count == max {
                            break;
                        }
                        let key = self.range.key(ts);
                        if self.heap.peek().is_some_and(|top| top.key < key) {
                            break;
                        }
                        timestamps[count] = ts;
                        values[count] = value;
                        count += 1;
                        run.pos += 1;
                    }
                    if let Some(ts) = run.peek() {
                        self.heap.push(HeapEntry {
                            key: self.range.key(ts),
                            seq: entry.seq,
                            source: Source::Run(run),
                        });
                    }
                }
            }
        }

        Ok(count)
    }
}

impl Iterator for NBTreeIterator {
    type Item = Result<(Timestamp, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut ts = [0; 1];
        let mut value = [0.0; 1];
        match self.read(&mut ts, &mut value) {
            Ok(0) => None,
            Ok(_) => Some(Ok((ts[0], value[0]))),
            Err(err) => Some(Err(err)),
        }
    }
}

/// Paged view over an [`NBTreeIterator`].
///
/// ```rust,ignore
/// let mut cursor = tree.cursor(begin, end)?;
/// while !cursor.is_eof() {
///     for ix in 0..cursor.size() {
///         let (ts, value) = cursor.at(ix)?;
///     }
///     cursor.proceed()?;
/// }
/// ```
#[derive(Debug)]
pub struct NBTreeCursor {
    iter: NBTreeIterator,
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
    size: usize,
    eof: bool,
}

impl NBTreeCursor {
    /// Wraps an iterator and fetches the first page.
    ///
    /// # Errors
    ///
    /// Returns the error of the first page read.
    pub fn new(iter: NBTreeIterator) -> Result<Self> {
        Self::with_page_size(iter, NBTREE_CURSOR_PAGE_SIZE)
    }

    /// Wraps an iterator using pages of `page_size` samples.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` for a zero page size and the
    /// error of the first page read.
    pub fn with_page_size(iter: NBTreeIterator, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(NBTreeError::BadArgument(
                "cursor page size must be positive".to_string(),
            ));
        }
        let mut cursor = Self {
            iter,
            timestamps: vec![0; page_size],
            values: vec![0.0; page_size],
            size: 0,
            eof: false,
        };
        cursor.fetch()?;
        Ok(cursor)
    }

    fn fetch(&mut self) -> Result<()> {
        self.size = 0;
        let count = self.iter.read(&mut self.timestamps, &mut self.values)?;
        self.size = count;
        self.eof = count == 0;
        Ok(())
    }

    /// Returns true once a fetch produced no samples.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Number of samples in the current page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Sample at `ix` in the current page.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if `ix >= size()`.
    pub fn at(&self, ix: usize) -> Result<(Timestamp, f64)> {
        if ix >= self.size {
            return Err(NBTreeError::BadArgument(format!(
                "index {} outside page of {} samples",
                ix, self.size
            )));
        }
        Ok((self.timestamps[ix], self.values[ix]))
    }

    /// Drops the current page and fetches the next one.
    ///
    /// # Errors
    ///
    /// Returns the read error; the page is empty until a retry succeeds.
    pub fn proceed(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.fetch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemStore;
    use crate::nbtree::node::NBTreeLeaf;

    fn snapshot_of(timestamps: &[Timestamp]) -> TreeSnapshot {
        TreeSnapshot {
            values: timestamps.iter().map(|ts| *ts as f64).collect(),
            timestamps: timestamps.to_vec(),
            ..Default::default()
        }
    }

    fn collect(iter: NBTreeIterator) -> Vec<Timestamp> {
        iter.map(|item| item.unwrap().0).collect()
    }

    #[test]
    fn test_range_membership() {
        let forward = ScanRange::new(10, 20);
        assert!(forward.contains(10));
        assert!(!forward.contains(20));

        let backward = ScanRange::new(20, 10);
        assert_eq!(backward.direction(), ScanDirection::Backward);
        assert!(backward.contains(20));
        assert!(!backward.contains(10));

        let mut summary = NBTreeSummary::empty();
        summary.add(20, 0.0);
        summary.add(25, 0.0);
        assert!(!forward.overlaps(&summary));
        assert!(backward.overlaps(&summary));
        assert!(!backward.covers(&summary));
        assert!(ScanRange::new(30, 19).covers(&summary));
    }

    #[test]
    fn test_open_tail_forward_and_backward() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let snapshot = snapshot_of(&[5, 1, 3, 9, 7]);

        let forward = NBTreeIterator::new(store.clone(), 1, 0, 8, snapshot.clone());
        assert_eq!(collect(forward), vec![1, 3, 5, 7]);

        let backward = NBTreeIterator::new(store, 1, 9, 1, snapshot);
        assert_eq!(collect(backward), vec![9, 7, 5, 3]);
    }

    #[test]
    fn test_empty_range() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let mut iter = NBTreeIterator::new(store, 1, 3, 3, snapshot_of(&[3]));
        let mut ts = [0; 4];
        let mut vals = [0.0; 4];
        assert_eq!(iter.read(&mut ts, &mut vals).unwrap(), 0);
    }

    #[test]
    fn test_merges_sealed_and_open_sources() {
        let store = Arc::new(MemStore::new());
        let mut leaf = NBTreeLeaf::new(1);
        for ts in [2, 4, 6, 8] {
            leaf.insert(ts, ts as f64).unwrap();
        }
        let (addr, summary) = leaf.seal(store.as_ref()).unwrap();

        let mut snapshot = snapshot_of(&[1, 5, 9]);
        snapshot.children.push((addr, summary));
        let iter = NBTreeIterator::new(store, 1, 0, 100, snapshot);
        assert_eq!(collect(iter), vec![1, 2, 4, 5, 6, 8, 9]);
    }

    #[test]
    fn test_failed_read_is_retried() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let mut snapshot = snapshot_of(&[1, 2]);
        snapshot.roots.push(LogicAddr::from_raw(42));
        let mut iter = NBTreeIterator::new(store, 1, 0, 10, snapshot);

        let mut ts = [0; 8];
        let mut vals = [0.0; 8];
        assert!(matches!(
            iter.read(&mut ts, &mut vals),
            Err(NBTreeError::AddressNotFound(_))
        ));
        // The failure repeats instead of silently skipping the node.
        assert!(iter.read(&mut ts, &mut vals).is_err());
    }

    #[test]
    fn test_cursor_pages() {
        let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
        let timestamps: Vec<Timestamp> = (0..10).collect();
        let iter = NBTreeIterator::new(store, 1, 0, 10, snapshot_of(&timestamps));
        let mut cursor = NBTreeCursor::with_page_size(iter, 4).unwrap();

        let mut seen = Vec::new();
        while !cursor.is_eof() {
            for ix in 0..cursor.size() {
                seen.push(cursor.at(ix).unwrap().0);
            }
            assert!(cursor.at(cursor.size()).is_err());
            cursor.proceed().unwrap();
        }
        assert_eq!(seen, timestamps);
        assert_eq!(cursor.size(), 0);
    }
}
