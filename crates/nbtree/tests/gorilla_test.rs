//! Property-based tests for the leaf compression codec.
//!
//! Uses proptest to verify lossless round-trip compression for arbitrary
//! sample runs, including unordered timestamps.
//!
//! Note: delta-of-delta values must fit in 32 bits; runs that violate this
//! are rejected by the encoder and stored raw by the leaf.

use alopex_nbtree::nbtree::gorilla::CompressedSamples;
use proptest::prelude::*;

fn roundtrip(timestamps: &[u64], values: &[f64]) -> (Vec<u64>, Vec<f64>, usize) {
    let block = CompressedSamples::compress(timestamps, values).expect("deltas fit in 32 bits");
    let mut buf = Vec::new();
    block.write_to(&mut buf);
    let (ts, vals) = CompressedSamples::read_from(&buf, block.count())
        .unwrap()
        .decompress()
        .unwrap();
    (ts, vals, buf.len())
}

/// Strategy for increasing timestamps with bounded deltas.
fn timestamp_strategy() -> impl Strategy<Value = Vec<u64>> {
    (
        0u64..1_000_000_000_000,
        prop::collection::vec(1u64..1_000_000_000, 1..240),
    )
        .prop_map(|(base, deltas)| {
            let mut timestamps = vec![base];
            let mut current = base;
            for delta in deltas {
                current += delta;
                timestamps.push(current);
            }
            timestamps
        })
}

proptest! {
    /// Increasing timestamps round-trip exactly.
    #[test]
    fn test_timestamp_roundtrip(timestamps in timestamp_strategy()) {
        let values = vec![1.0; timestamps.len()];
        let (ts, _, _) = roundtrip(&timestamps, &values);
        prop_assert_eq!(ts, timestamps);
    }

    /// Unordered and repeated timestamps round-trip exactly.
    #[test]
    fn test_unordered_timestamp_roundtrip(
        timestamps in prop::collection::vec(0u64..1_000_000, 1..240),
    ) {
        let values = vec![0.0; timestamps.len()];
        let (ts, _, _) = roundtrip(&timestamps, &values);
        prop_assert_eq!(ts, timestamps);
    }

    /// Any bit pattern, including NaN payloads, round-trips exactly.
    #[test]
    fn test_value_roundtrip(bits in prop::collection::vec(any::<u64>(), 1..240)) {
        let timestamps: Vec<u64> = (0..bits.len() as u64).map(|i| 1_000 + i * 1_000).collect();
        let values: Vec<f64> = bits.iter().map(|b| f64::from_bits(*b)).collect();

        let (_, decoded, _) = roundtrip(&timestamps, &values);
        let decoded_bits: Vec<u64> = decoded.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(decoded_bits, bits);
    }

    /// Regular intervals with slowly varying values compress well.
    #[test]
    fn test_compression_ratio_regular_intervals(count in 50usize..240) {
        let timestamps: Vec<u64> = (0..count as u64).map(|i| 1_000_000_000 + i * 1_000).collect();
        let values: Vec<f64> = (0..count).map(|i| 50.0 + (i as f64 * 0.1).sin() * 10.0).collect();

        let (_, decoded, encoded_len) = roundtrip(&timestamps, &values);
        prop_assert_eq!(decoded, values);

        let ratio = (count * 16) as f64 / encoded_len as f64;
        prop_assert!(ratio > 1.5, "Expected compression ratio >1.5:1, got {:.2}:1", ratio);
    }

    /// Identical consecutive values cost one bit each.
    #[test]
    fn test_identical_values_compression(value in -1000.0f64..1000.0, count in 10usize..240) {
        let timestamps: Vec<u64> = (0..count as u64).map(|i| i * 10).collect();
        let values = vec![value; count];

        let (_, decoded, encoded_len) = roundtrip(&timestamps, &values);
        prop_assert_eq!(decoded, values);

        // 8 byte stream header, both first samples raw, then ~1 bit per field.
        let expected_bytes = 8 + 16 + 2 + (2 * count).div_ceil(8);
        prop_assert!(encoded_len <= expected_bytes + 4);
    }
}
