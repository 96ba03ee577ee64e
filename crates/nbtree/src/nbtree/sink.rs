//! Push-style search boundary.
//!
//! The query layer above the storage engine consumes results through a
//! caller-supplied sink. [`NBTreeRootsCollection::search_into`] and
//! [`NBTreeRootsCollection::search_raw_into`] adapt the pull iterator to
//! that shape.

use crate::error::{NBTreeError, Result};
use crate::nbtree::{NBTreeRootsCollection, Timestamp, NBTREE_CURSOR_PAGE_SIZE};

/// Direction of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ScanDirection {
    /// Descending timestamps.
    Backward = 0,
    /// Ascending timestamps.
    Forward = 1,
}

impl ScanDirection {
    /// Converts a wire constant into a direction.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` for unknown values.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Backward),
            1 => Ok(Self::Forward),
            other => Err(NBTreeError::BadArgument(format!(
                "unknown scan direction {}",
                other
            ))),
        }
    }
}

/// Range query in push form.
///
/// Forward scans cover `[lowerbound, upperbound)` in ascending order,
/// backward scans cover `(lowerbound, upperbound]` in descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchQuery {
    /// Lower time bound.
    pub lowerbound: Timestamp,
    /// Upper time bound.
    pub upperbound: Timestamp,
    /// Scan direction.
    pub direction: ScanDirection,
}

impl SearchQuery {
    /// Creates a validated query.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if `lowerbound > upperbound`.
    pub fn new(lowerbound: Timestamp, upperbound: Timestamp, direction: ScanDirection) -> Result<Self> {
        let query = Self {
            lowerbound,
            upperbound,
            direction,
        };
        query.validate()?;
        Ok(query)
    }

    /// Creates a query from a raw direction constant.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` for an unknown direction or an
    /// inverted range.
    pub fn from_raw(lowerbound: Timestamp, upperbound: Timestamp, direction: u32) -> Result<Self> {
        Self::new(lowerbound, upperbound, ScanDirection::from_u32(direction)?)
    }

    /// Checks the bounds.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::BadArgument` if `lowerbound > upperbound`.
    pub fn validate(&self) -> Result<()> {
        if self.lowerbound > self.upperbound {
            return Err(NBTreeError::BadArgument(format!(
                "lower bound {} is above upper bound {}",
                self.lowerbound, self.upperbound
            )));
        }
        Ok(())
    }

    /// `(begin, end)` arguments of the equivalent pull search.
    pub fn search_bounds(&self) -> (Timestamp, Timestamp) {
        match self.direction {
            ScanDirection::Forward => (self.lowerbound, self.upperbound),
            ScanDirection::Backward => (self.upperbound, self.lowerbound),
        }
    }
}

/// Receiver of push-style search results.
pub trait SearchSink {
    /// Receives one sample. Returning `false` stops the scan.
    fn put(&mut self, ts: Timestamp, value: f64) -> bool;

    /// Called once after the last sample of a successful scan.
    fn complete(&mut self);

    /// Called instead of [`SearchSink::complete`] when the scan fails.
    fn set_error(&mut self, err: &NBTreeError);
}

impl NBTreeRootsCollection {
    /// Streams the result of `query` into `sink`.
    ///
    /// The sink is always notified: through [`SearchSink::complete`] when
    /// the scan ends or the sink stops it, or through
    /// [`SearchSink::set_error`] when the query is invalid or a read fails.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the sink.
    pub fn search_into(&self, query: &SearchQuery, sink: &mut dyn SearchSink) -> Result<()> {
        if let Err(err) = query.validate() {
            sink.set_error(&err);
            return Err(err);
        }

        let (begin, end) = query.search_bounds();
        let mut iter = self.search(begin, end);
        let mut timestamps = vec![0; NBTREE_CURSOR_PAGE_SIZE];
        let mut values = vec![0.0; NBTREE_CURSOR_PAGE_SIZE];
        loop {
            let count = match iter.read(&mut timestamps, &mut values) {
                Ok(count) => count,
                Err(err) => {
                    sink.set_error(&err);
                    return Err(err);
                }
            };
            for (&ts, &value) in timestamps[..count].iter().zip(&values[..count]) {
                if !sink.put(ts, value) {
                    sink.complete();
                    return Ok(());
                }
            }
            if count < NBTREE_CURSOR_PAGE_SIZE {
                sink.complete();
                return Ok(());
            }
        }
    }

    /// Streams a query given as raw wire values into `sink`.
    ///
    /// An unknown direction constant or an inverted range is reported to
    /// the sink through [`SearchSink::set_error`] before any scan starts.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the sink.
    pub fn search_raw_into(
        &self,
        lowerbound: Timestamp,
        upperbound: Timestamp,
        direction: u32,
        sink: &mut dyn SearchSink,
    ) -> Result<()> {
        match SearchQuery::from_raw(lowerbound, upperbound, direction) {
            Ok(query) => self.search_into(&query, sink),
            Err(err) => {
                sink.set_error(&err);
                Err(err)
            }
        }
    }
}
