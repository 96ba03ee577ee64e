//! Leaf and superblock nodes.
//!
//! # Node Payload
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Header (86 bytes)                                       │
//! │   magic "NBTN" | version u16 | kind u8 | encoding u8     │
//! │   level u16 | series id u64 | entry count u32            │
//! │   summary (64 bytes)                                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Leaf, raw:        (timestamp u64, value f64) * count    │
//! │  Leaf, gorilla:    compressed timestamp + value streams  │
//! │  Superblock:       (addr u64, summary) * count           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use crate::blockstore::{BlockStore, LogicAddr, MAX_PAYLOAD_SIZE};
use crate::error::{NBTreeError, Result};
use crate::nbtree::gorilla::CompressedSamples;
use crate::nbtree::{SeriesId, Timestamp, NBTREE_FANOUT, NBTREE_LEAF_CAPACITY};
use tracing::{debug, warn};

/// Magic bytes at the start of every node payload.
pub const NODE_MAGIC: [u8; 4] = *b"NBTN";

/// Current node format version.
pub const NODE_VERSION: u16 = 1;

/// Encoded size of [`NBTreeSummary`].
pub const SUMMARY_SIZE: usize = 64;

/// Encoded size of the node header.
pub const NODE_HEADER_SIZE: usize = 22 + SUMMARY_SIZE;

const RAW_SAMPLE_SIZE: usize = 16;
const SUPERBLOCK_ENTRY_SIZE: usize = 8 + SUMMARY_SIZE;

const _: () = assert!(NODE_HEADER_SIZE + NBTREE_LEAF_CAPACITY * RAW_SAMPLE_SIZE <= MAX_PAYLOAD_SIZE);
const _: () = assert!(NODE_HEADER_SIZE + NBTREE_FANOUT * SUPERBLOCK_ENTRY_SIZE <= MAX_PAYLOAD_SIZE);

fn le_u16(buf: &[u8], at: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&buf[at..at + 2]);
    u16::from_le_bytes(bytes)
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn le_f64(buf: &[u8], at: usize) -> f64 {
    f64::from_bits(le_u64(buf, at))
}

/// Aggregate of a run of samples.
///
/// `first_ts`/`last_ts` follow append order, `min_ts`/`max_ts` are the
/// timestamp bounds used to prune subtrees during search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NBTreeSummary {
    /// Number of samples.
    pub count: u64,
    /// Timestamp of the first appended sample.
    pub first_ts: Timestamp,
    /// Timestamp of the last appended sample.
    pub last_ts: Timestamp,
    /// Smallest timestamp.
    pub min_ts: Timestamp,
    /// Largest timestamp.
    pub max_ts: Timestamp,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Sum of all values.
    pub sum: f64,
}

impl Default for NBTreeSummary {
    fn default() -> Self {
        Self::empty()
    }
}

impl NBTreeSummary {
    /// Summary of zero samples.
    pub const fn empty() -> Self {
        Self {
            count: 0,
            first_ts: 0,
            last_ts: 0,
            min_ts: Timestamp::MAX,
            max_ts: Timestamp::MIN,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
        }
    }

    /// Returns true if no sample was added.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Adds one sample appended after all samples already summarized.
    pub fn add(&mut self, ts: Timestamp, value: f64) {
        if self.count == 0 {
            self.first_ts = ts;
        }
        self.count += 1;
        self.last_ts = ts;
        self.min_ts = self.min_ts.min(ts);
        self.max_ts = self.max_ts.max(ts);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    /// Merges a summary of samples appended after this one's.
    pub fn merge(&mut self, other: &NBTreeSummary) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        self.count += other.count;
        self.last_ts = other.last_ts;
        self.min_ts = self.min_ts.min(other.min_ts);
        self.max_ts = self.max_ts.max(other.max_ts);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
    }

    /// Arithmetic mean of the values, if any.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.count.to_le_bytes());
        buf.extend_from_slice(&self.first_ts.to_le_bytes());
        buf.extend_from_slice(&self.last_ts.to_le_bytes());
        buf.extend_from_slice(&self.min_ts.to_le_bytes());
        buf.extend_from_slice(&self.max_ts.to_le_bytes());
        buf.extend_from_slice(&self.min.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.max.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.sum.to_bits().to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            count: le_u64(buf, 0),
            first_ts: le_u64(buf, 8),
            last_ts: le_u64(buf, 16),
            min_ts: le_u64(buf, 24),
            max_ts: le_u64(buf, 32),
            min: le_f64(buf, 40),
            max: le_f64(buf, 48),
            sum: le_f64(buf, 56),
        }
    }
}

/// Node kind stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    /// Holds samples.
    Leaf = 0,
    /// Holds child references.
    Superblock = 1,
}

/// Sample encoding of a leaf body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleEncoding {
    /// Fixed 16 bytes per sample.
    Raw = 0,
    /// Delta-of-delta timestamps and XOR values.
    Gorilla = 1,
}

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeHeader {
    /// Node kind.
    pub kind: NodeKind,
    /// Body encoding.
    pub encoding: SampleEncoding,
    /// Tree level, 0 for leaves.
    pub level: u16,
    /// Owning series.
    pub series_id: SeriesId,
    /// Number of entries in the body.
    pub count: u32,
    /// Summary of every sample under the node.
    pub summary: NBTreeSummary,
}

impl NodeHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&NODE_MAGIC);
        buf.extend_from_slice(&NODE_VERSION.to_le_bytes());
        buf.push(self.kind as u8);
        buf.push(self.encoding as u8);
        buf.extend_from_slice(&self.level.to_le_bytes());
        buf.extend_from_slice(&self.series_id.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        self.summary.write_to(buf);
    }

    /// Parses and validates the header at the start of a node payload.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < NODE_HEADER_SIZE {
            return Err(NBTreeError::CorruptNode(format!(
                "node payload of {} bytes is shorter than its header",
                buf.len()
            )));
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != NODE_MAGIC {
            return Err(NBTreeError::InvalidMagic(magic));
        }
        let version = le_u16(buf, 4);
        if version != NODE_VERSION {
            return Err(NBTreeError::UnsupportedVersion(version));
        }

        let kind = match buf[6] {
            0 => NodeKind::Leaf,
            1 => NodeKind::Superblock,
            other => {
                return Err(NBTreeError::CorruptNode(format!(
                    "unknown node kind {}",
                    other
                )))
            }
        };
        let encoding = match buf[7] {
            0 => SampleEncoding::Raw,
            1 => SampleEncoding::Gorilla,
            other => {
                return Err(NBTreeError::CorruptNode(format!(
                    "unknown sample encoding {}",
                    other
                )))
            }
        };
        let level = le_u16(buf, 8);
        if (kind == NodeKind::Leaf) != (level == 0) {
            return Err(NBTreeError::CorruptNode(format!(
                "{:?} node at level {}",
                kind, level
            )));
        }

        Ok(Self {
            kind,
            encoding,
            level,
            series_id: le_u64(buf, 10),
            count: le_u32(buf, 18),
            summary: NBTreeSummary::read_from(&buf[22..NODE_HEADER_SIZE]),
        })
    }
}

/// Open or sealed leaf node.
#[derive(Debug, Clone)]
pub struct NBTreeLeaf {
    id: SeriesId,
    timestamps: Vec<Timestamp>,
    values: Vec<f64>,
    summary: NBTreeSummary,
    addr: Option<LogicAddr>,
}

impl NBTreeLeaf {
    /// Creates an empty open leaf.
    pub fn new(id: SeriesId) -> Self {
        Self {
            id,
            timestamps: Vec::with_capacity(NBTREE_LEAF_CAPACITY),
            values: Vec::with_capacity(NBTREE_LEAF_CAPACITY),
            summary: NBTreeSummary::empty(),
            addr: None,
        }
    }

    /// Appends a sample.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::NodeSealed` after [`NBTreeLeaf::seal`] and
    /// `NBTreeError::NodeFull` once the leaf holds
    /// [`NBTREE_LEAF_CAPACITY`] samples.
    pub fn insert(&mut self, ts: Timestamp, value: f64) -> Result<()> {
        if self.addr.is_some() {
            return Err(NBTreeError::NodeSealed);
        }
        if self.is_full() {
            return Err(NBTreeError::NodeFull {
                capacity: NBTREE_LEAF_CAPACITY,
            });
        }
        self.timestamps.push(ts);
        self.values.push(value);
        self.summary.add(ts, value);
        Ok(())
    }

    /// Removes the most recent sample of an open leaf.
    pub(crate) fn pop(&mut self) -> Option<(Timestamp, f64)> {
        if self.addr.is_some() {
            return None;
        }
        let sample = self.timestamps.pop().zip(self.values.pop())?;
        self.summary = NBTreeSummary::empty();
        for (ts, value) in self.timestamps.iter().zip(&self.values) {
            self.summary.add(*ts, *value);
        }
        Some(sample)
    }

    /// Writes the leaf into `store` and returns its address and summary.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::NodeSealed` if the leaf is already sealed,
    /// `NBTreeError::BadArgument` if it is empty, and any store error.
    pub fn seal(&mut self, store: &dyn BlockStore) -> Result<(LogicAddr, NBTreeSummary)> {
        if self.addr.is_some() {
            return Err(NBTreeError::NodeSealed);
        }
        if self.is_empty() {
            return Err(NBTreeError::BadArgument(
                "cannot seal an empty leaf".to_string(),
            ));
        }

        let payload = self.encode();
        let addr = store.append(&payload)?;
        self.addr = Some(addr);
        debug!(
            "Sealed leaf of series {} with {} samples into {} ({} bytes)",
            self.id,
            self.len(),
            addr,
            payload.len()
        );
        Ok((addr, self.summary))
    }

    fn encode(&self) -> Vec<u8> {
        let raw_len = self.len() * RAW_SAMPLE_SIZE;
        let compressed = CompressedSamples::compress(&self.timestamps, &self.values)
            .filter(|block| block.encoded_len() < raw_len);

        let encoding = if compressed.is_some() {
            SampleEncoding::Gorilla
        } else {
            SampleEncoding::Raw
        };
        let header = NodeHeader {
            kind: NodeKind::Leaf,
            encoding,
            level: 0,
            series_id: self.id,
            count: self.len() as u32,
            summary: self.summary,
        };

        let mut buf = Vec::with_capacity(NODE_HEADER_SIZE + raw_len);
        header.write_to(&mut buf);
        match compressed {
            Some(block) => block.write_to(&mut buf),
            None => {
                for (ts, value) in self.timestamps.iter().zip(&self.values) {
                    buf.extend_from_slice(&ts.to_le_bytes());
                    buf.extend_from_slice(&value.to_bits().to_le_bytes());
                }
            }
        }
        buf
    }

    fn decode(header: &NodeHeader, body: &[u8], addr: LogicAddr) -> Result<Self> {
        let count = header.count as usize;
        if count > NBTREE_LEAF_CAPACITY {
            return Err(NBTreeError::CorruptNode(format!(
                "leaf {} holds {} samples",
                addr, count
            )));
        }

        let (timestamps, values) = match header.encoding {
            SampleEncoding::Gorilla => CompressedSamples::read_from(body, header.count)?.decompress()?,
            SampleEncoding::Raw => {
                if body.len() < count * RAW_SAMPLE_SIZE {
                    return Err(NBTreeError::CorruptNode(format!(
                        "leaf {} body truncated",
                        addr
                    )));
                }
                body.chunks_exact(RAW_SAMPLE_SIZE)
                    .take(count)
                    .map(|chunk| (le_u64(chunk, 0), le_f64(chunk, 8)))
                    .unzip()
            }
        };

        Ok(Self {
            id: header.series_id,
            timestamps,
            values,
            summary: header.summary,
            addr: Some(addr),
        })
    }

    /// Series the leaf belongs to.
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the leaf holds no samples.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Returns true if no further sample fits.
    pub fn is_full(&self) -> bool {
        self.len() >= NBTREE_LEAF_CAPACITY
    }

    /// Address of the sealed leaf.
    pub fn addr(&self) -> Option<LogicAddr> {
        self.addr
    }

    /// Returns true once the leaf is written to a store.
    pub fn is_sealed(&self) -> bool {
        self.addr.is_some()
    }

    /// Summary of the samples.
    pub fn summary(&self) -> &NBTreeSummary {
        &self.summary
    }

    /// Timestamps in append order.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    /// Values in append order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Open or sealed superblock node.
#[derive(Debug, Clone)]
pub struct NBTreeSuperblock {
    id: SeriesId,
    level: u16,
    children: Vec<(LogicAddr, NBTreeSummary)>,
    summary: NBTreeSummary,
    addr: Option<LogicAddr>,
}

impl NBTreeSuperblock {
    /// Creates an empty open superblock at `level` (1 or higher).
    pub fn new(id: SeriesId, level: u16) -> Self {
        Self {
            id,
            level,
            children: Vec::with_capacity(NBTREE_FANOUT),
            summary: NBTreeSummary::empty(),
            addr: None,
        }
    }

    /// Adds a reference to a sealed child.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::NodeSealed` after [`NBTreeSuperblock::seal`]
    /// and `NBTreeError::NodeFull` once [`NBTREE_FANOUT`] children are held.
    pub fn insert(&mut self, addr: LogicAddr, summary: NBTreeSummary) -> Result<()> {
        if self.addr.is_some() {
            return Err(NBTreeError::NodeSealed);
        }
        if self.is_full() {
            return Err(NBTreeError::NodeFull {
                capacity: NBTREE_FANOUT,
            });
        }
        self.children.push((addr, summary));
        self.summary.merge(&summary);
        Ok(())
    }

    /// Writes the superblock into `store` and returns its address and summary.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::NodeSealed` if already sealed,
    /// `NBTreeError::BadArgument` if empty, and any store error.
    pub fn seal(&mut self, store: &dyn BlockStore) -> Result<(LogicAddr, NBTreeSummary)> {
        if self.addr.is_some() {
            return Err(NBTreeError::NodeSealed);
        }
        if self.is_empty() {
            return Err(NBTreeError::BadArgument(
                "cannot seal an empty superblock".to_string(),
            ));
        }

        let header = NodeHeader {
            kind: NodeKind::Superblock,
            encoding: SampleEncoding::Raw,
            level: self.level,
            series_id: self.id,
            count: self.children.len() as u32,
            summary: self.summary,
        };
        let mut payload =
            Vec::with_capacity(NODE_HEADER_SIZE + self.children.len() * SUPERBLOCK_ENTRY_SIZE);
        header.write_to(&mut payload);
        for (addr, summary) in &self.children {
            payload.extend_from_slice(&addr.as_u64().to_le_bytes());
            summary.write_to(&mut payload);
        }

        let addr = store.append(&payload)?;
        self.addr = Some(addr);
        debug!(
            "Sealed level {} superblock of series {} with {} children into {}",
            self.level,
            self.id,
            self.children.len(),
            addr
        );
        Ok((addr, self.summary))
    }

    fn decode(header: &NodeHeader, body: &[u8], addr: LogicAddr) -> Result<Self> {
        let count = header.count as usize;
        if count > NBTREE_FANOUT || body.len() < count * SUPERBLOCK_ENTRY_SIZE {
            return Err(NBTreeError::CorruptNode(format!(
                "superblock {} with {} children has a {} byte body",
                addr,
                count,
                body.len()
            )));
        }

        let children = body
            .chunks_exact(SUPERBLOCK_ENTRY_SIZE)
            .take(count)
            .map(|chunk| {
                (
                    LogicAddr::from_raw(le_u64(chunk, 0)),
                    NBTreeSummary::read_from(&chunk[8..]),
                )
            })
            .collect();

        Ok(Self {
            id: header.series_id,
            level: header.level,
            children,
            summary: header.summary,
            addr: Some(addr),
        })
    }

    /// Series the superblock belongs to.
    pub fn id(&self) -> SeriesId {
        self.id
    }

    /// Tree level.
    pub fn level(&self) -> u16 {
        self.level
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns true if no child was added.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns true if no further child fits.
    pub fn is_full(&self) -> bool {
        self.children.len() >= NBTREE_FANOUT
    }

    /// Address of the sealed superblock.
    pub fn addr(&self) -> Option<LogicAddr> {
        self.addr
    }

    /// Returns true once the superblock is written to a store.
    pub fn is_sealed(&self) -> bool {
        self.addr.is_some()
    }

    /// Summary of every sample below the superblock.
    pub fn summary(&self) -> &NBTreeSummary {
        &self.summary
    }

    /// Child references in append order.
    pub fn children(&self) -> &[(LogicAddr, NBTreeSummary)] {
        &self.children
    }
}

/// A node read back from a block store.
#[derive(Debug, Clone)]
pub enum NBTreeNode {
    /// Sealed leaf.
    Leaf(NBTreeLeaf),
    /// Sealed superblock.
    Superblock(NBTreeSuperblock),
}

impl NBTreeNode {
    /// Reads and decodes the node at `addr`, checking that it belongs to
    /// series `id`.
    ///
    /// # Errors
    ///
    /// Returns the store error for unreadable blocks and an integrity error
    /// for blocks that do not hold a node of this series.
    pub fn read(store: &dyn BlockStore, addr: LogicAddr, id: SeriesId) -> Result<Self> {
        Self::read_inner(store, addr, id).map_err(|err| {
            if err.is_integrity() {
                warn!("Failed to read node {} of series {}: {}", addr, id, err);
            }
            err
        })
    }

    fn read_inner(store: &dyn BlockStore, addr: LogicAddr, id: SeriesId) -> Result<Self> {
        let payload = store.read(addr)?;
        let header = NodeHeader::read_from(&payload)?;
        if header.series_id != id {
            return Err(NBTreeError::CorruptNode(format!(
                "node {} belongs to series {}, expected {}",
                addr, header.series_id, id
            )));
        }

        let body = &payload[NODE_HEADER_SIZE..];
        match header.kind {
            NodeKind::Leaf => NBTreeLeaf::decode(&header, body, addr).map(Self::Leaf),
            NodeKind::Superblock => {
                NBTreeSuperblock::decode(&header, body, addr).map(Self::Superblock)
            }
        }
    }

    /// Tree level of the node.
    pub fn level(&self) -> u16 {
        match self {
            Self::Leaf(_) => 0,
            Self::Superblock(node) => node.level(),
        }
    }

    /// Summary of every sample under the node.
    pub fn summary(&self) -> &NBTreeSummary {
        match self {
            Self::Leaf(leaf) => leaf.summary(),
            Self::Superblock(node) => node.summary(),
        }
    }
}
