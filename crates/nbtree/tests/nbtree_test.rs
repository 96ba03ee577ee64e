//! Integration tests for append and search on a single series.
//!
//! These tests verify:
//! - Ordered forward and backward scans across roots and the open path
//! - Agreement between the pull iterator, the paged cursor and the sink
//! - The search-ordering property over random ranges

use alopex_nbtree::{
    BlockStore, MemStore, NBTreeCursor, NBTreeError, NBTreeRootsCollection, ScanDirection,
    SearchQuery, SearchSink, Timestamp,
};
use proptest::prelude::*;
use std::sync::Arc;

fn new_series(id: u64) -> NBTreeRootsCollection {
    let store: Arc<dyn BlockStore> = Arc::new(MemStore::new());
    NBTreeRootsCollection::new(id, store)
}

fn scan(series: &NBTreeRootsCollection, begin: Timestamp, end: Timestamp) -> Vec<(Timestamp, f64)> {
    series
        .search(begin, end)
        .collect::<alopex_nbtree::Result<Vec<_>>>()
        .unwrap()
}

// ============================================================================
// Ordered Scans
// ============================================================================

/// Appends 0..10999 with value `i * 0.1` and scans the full span forward.
#[test]
fn test_forward_scan_11000_samples() {
    let mut series = new_series(1);
    for i in 0..11_000u64 {
        series.append(i, i as f64 * 0.1).unwrap();
    }

    let results = scan(&series, 0, 11_000);
    assert_eq!(results.len(), 11_000);
    for (i, (ts, value)) in results.iter().enumerate() {
        assert_eq!(*ts, i as u64);
        assert_eq!(*value, *ts as f64 * 0.1);
    }
}

/// Backward scans start at `begin` inclusive and stop before `end`.
#[test]
fn test_backward_scan() {
    let mut series = new_series(2);
    for i in 0..5_000u64 {
        series.append(i, i as f64).unwrap();
    }

    let begin = 4_321;
    let end = 100;
    let results = scan(&series, begin, end);
    assert_eq!(results.len() as u64, begin - end);
    for (i, (ts, value)) in results.iter().enumerate() {
        assert_eq!(*ts, begin - i as u64);
        assert_eq!(*value, *ts as f64);
    }
}

/// `search(x, x)` is exhausted immediately.
#[test]
fn test_empty_range_for_any_point() {
    let mut series = new_series(3);
    for i in 0..1_000u64 {
        series.append(i, 0.0).unwrap();
    }

    for x in [0, 1, 239, 240, 999, 1_000, u64::MAX] {
        let mut iter = series.search(x, x);
        let mut ts = [0; 16];
        let mut values = [0.0; 16];
        assert_eq!(iter.read(&mut ts, &mut values).unwrap(), 0);
    }
}

/// Short reads signal end-of-stream; full reads do not.
#[test]
fn test_read_protocol() {
    let mut series = new_series(4);
    for i in 0..1_000u64 {
        series.append(i, i as f64).unwrap();
    }

    let mut iter = series.search(0, 1_000);
    assert_eq!(iter.direction(), ScanDirection::Forward);
    let mut ts = vec![0; 300];
    let mut values = vec![0.0; 300];
    let mut total = 0;
    loop {
        let count = iter.read(&mut ts, &mut values).unwrap();
        assert!(ts[..count].iter().enumerate().all(|(i, t)| *t == (total + i) as u64));
        total += count;
        if count < ts.len() {
            break;
        }
    }
    assert_eq!(total, 1_000);
}

/// The cursor pages through exactly what the iterator yields.
#[test]
fn test_cursor_matches_iterator() {
    let mut series = new_series(5);
    for i in 0..3_000u64 {
        series.append(i * 3, (i as f64).sin()).unwrap();
    }

    for (begin, end) in [(0, 9_000), (8_999, 0), (1_234, 5_678)] {
        let expected = scan(&series, begin, end);

        let mut cursor = NBTreeCursor::with_page_size(series.search(begin, end), 97).unwrap();
        let mut paged = Vec::new();
        while !cursor.is_eof() {
            for ix in 0..cursor.size() {
                paged.push(cursor.at(ix).unwrap());
            }
            cursor.proceed().unwrap();
        }
        assert_eq!(paged, expected);

        let mut default_cursor = series.cursor(begin, end).unwrap();
        assert_eq!(default_cursor.size(), expected.len().min(1024));
        default_cursor.proceed().unwrap();
    }
}

// ============================================================================
// Push-style Search
// ============================================================================

#[derive(Default)]
struct RecordingSink {
    samples: Vec<(Timestamp, f64)>,
    completed: bool,
    error: Option<String>,
    limit: Option<usize>,
}

impl SearchSink for RecordingSink {
    fn put(&mut self, ts: Timestamp, value: f64) -> bool {
        self.samples.push((ts, value));
        self.limit.map_or(true, |limit| self.samples.len() < limit)
    }

    fn complete(&mut self) {
        self.completed = true;
    }

    fn set_error(&mut self, err: &NBTreeError) {
        self.error = Some(err.to_string());
    }
}

fn sequence_series() -> NBTreeRootsCollection {
    let mut series = new_series(6);
    for i in 0..1_000u64 {
        series.append(1_000 + i, i as f64).unwrap();
    }
    series
}

#[test]
fn test_sink_search_backward() {
    let series = sequence_series();
    let query = SearchQuery::new(1_400, 1_500, ScanDirection::Backward).unwrap();
    let mut sink = RecordingSink::default();
    series.search_into(&query, &mut sink).unwrap();

    assert!(sink.completed);
    assert_eq!(sink.samples.len(), 100);
    for (i, (_, value)) in sink.samples.iter().enumerate() {
        assert_eq!(*value, (500 - i) as f64);
    }
}

#[test]
fn test_sink_search_forward() {
    let series = sequence_series();
    let query = SearchQuery::new(1_400, 1_500, ScanDirection::Forward).unwrap();
    let mut sink = RecordingSink::default();
    series.search_into(&query, &mut sink).unwrap();

    assert!(sink.completed);
    assert_eq!(sink.samples.len(), 100);
    for (i, (_, value)) in sink.samples.iter().enumerate() {
        assert_eq!(*value, (400 + i) as f64);
    }
}

#[test]
fn test_sink_bad_direction() {
    assert!(matches!(
        SearchQuery::from_raw(1_400, 1_500, 111),
        Err(NBTreeError::BadArgument(_))
    ));

    let series = sequence_series();
    let mut sink = RecordingSink::default();
    let result = series.search_raw_into(1_400, 1_500, 111, &mut sink);
    assert!(matches!(result, Err(NBTreeError::BadArgument(_))));
    assert!(!sink.completed);
    assert!(sink.error.is_some());
    assert!(sink.samples.is_empty());
}

#[test]
fn test_sink_raw_query() {
    let series = sequence_series();
    let mut sink = RecordingSink::default();
    series
        .search_raw_into(1_400, 1_500, ScanDirection::Backward as u32, &mut sink)
        .unwrap();

    assert!(sink.completed);
    assert!(sink.error.is_none());
    assert_eq!(sink.samples.len(), 100);
    assert_eq!(sink.samples[0], (1_500, 500.0));

    let mut sink = RecordingSink::default();
    assert!(series.search_raw_into(1_500, 1_400, 1, &mut sink).is_err());
    assert!(sink.error.is_some());
}

#[test]
fn test_sink_bad_time() {
    let series = sequence_series();
    let query = SearchQuery {
        lowerbound: 1_200,
        upperbound: 1_000,
        direction: ScanDirection::Backward,
    };
    let mut sink = RecordingSink::default();

    let result = series.search_into(&query, &mut sink);
    assert!(matches!(result, Err(NBTreeError::BadArgument(_))));
    assert!(!sink.completed);
    assert!(sink.error.is_some());
    assert!(sink.samples.is_empty());
}

#[test]
fn test_sink_backpressure() {
    let series = sequence_series();
    let query = SearchQuery::new(1_000, 2_000, ScanDirection::Forward).unwrap();
    let mut sink = RecordingSink {
        limit: Some(10),
        ..Default::default()
    };
    series.search_into(&query, &mut sink).unwrap();

    assert!(sink.completed);
    assert_eq!(sink.samples.len(), 10);
    assert_eq!(sink.samples[9].0, 1_009);
}

// ============================================================================
// Property Tests
// ============================================================================

fn increasing_timestamps() -> impl Strategy<Value = Vec<Timestamp>> {
    (0u64..1_000_000, prop::collection::vec(1u64..1_000, 0..2_000)).prop_map(|(base, deltas)| {
        let mut current = base;
        let mut timestamps = Vec::with_capacity(deltas.len());
        for delta in deltas {
            timestamps.push(current);
            current += delta;
        }
        timestamps
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Scans return exactly the in-range samples in scan order.
    #[test]
    fn prop_search_ordering(
        timestamps in increasing_timestamps(),
        a in 0u64..3_000_000,
        b in 0u64..3_000_000,
    ) {
        let mut series = new_series(7);
        for ts in &timestamps {
            series.append(*ts, *ts as f64).unwrap();
        }

        let forward: Vec<Timestamp> = scan(&series, a.min(b), a.max(b)).into_iter().map(|(ts, _)| ts).collect();
        let expected: Vec<Timestamp> = timestamps
            .iter()
            .copied()
            .filter(|ts| a.min(b) <= *ts && *ts < a.max(b))
            .collect();
        prop_assert_eq!(&forward, &expected);

        let backward: Vec<Timestamp> = scan(&series, a.max(b), a.min(b)).into_iter().map(|(ts, _)| ts).collect();
        let mut expected: Vec<Timestamp> = timestamps
            .iter()
            .copied()
            .filter(|ts| a.min(b) < *ts && *ts <= a.max(b))
            .collect();
        expected.reverse();
        prop_assert_eq!(backward, expected);
    }

    /// Unordered and repeated timestamps still come out sorted, none lost.
    #[test]
    fn prop_unordered_appends(
        timestamps in prop::collection::vec(0u64..5_000, 0..1_500),
    ) {
        let mut series = new_series(8);
        for (i, ts) in timestamps.iter().enumerate() {
            series.append(*ts, i as f64).unwrap();
        }

        let results = scan(&series, 0, 5_000);
        prop_assert_eq!(results.len(), timestamps.len());
        prop_assert!(results.windows(2).all(|w| w[0].0 <= w[1].0));

        let mut emitted: Vec<u64> = results.iter().map(|(_, value)| *value as u64).collect();
        emitted.sort_unstable();
        prop_assert_eq!(emitted, (0..timestamps.len() as u64).collect::<Vec<_>>());
    }
}
