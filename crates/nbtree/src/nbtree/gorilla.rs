//! Gorilla compression for leaf samples.
//!
//! Leaves are sealed either raw or with this codec, whichever is smaller.
//!
//! # Timestamp Encoding (Delta-of-Delta)
//!
//! - First value: 64 bits raw
//! - Subsequent values, by delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - fits in `i32`: `'1111'` + 32 bits
//!
//! A delta-of-delta outside `i32` cannot be represented, in which case
//! [`CompressedSamples::compress`] returns `None` and the leaf stays raw.
//! Deltas use wrapping arithmetic so out-of-order timestamps round-trip.
//!
//! # Value Encoding (XOR)
//!
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits

use crate::error::{NBTreeError, Result};
use crate::nbtree::Timestamp;
use bitvec::prelude::*;

type Bits = BitVec<u8, Msb0>;

/// Gorilla-encoded timestamp and value streams of one leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedSamples {
    timestamps: Bits,
    values: Bits,
    count: u32,
}

impl CompressedSamples {
    /// Compresses samples in append order.
    ///
    /// Returns `None` if a delta-of-delta does not fit in 32 bits.
    pub fn compress(timestamps: &[Timestamp], values: &[f64]) -> Option<Self> {
        let mut ts_output = Bits::new();
        let mut val_output = Bits::new();
        let mut ts_encoder = TimestampEncoder::new();
        let mut val_encoder = ValueEncoder::new();

        for (&ts, &val) in timestamps.iter().zip(values) {
            if !ts_encoder.encode(ts, &mut ts_output) {
                return None;
            }
            val_encoder.encode(val, &mut val_output);
        }

        Some(Self {
            timestamps: ts_output,
            values: val_output,
            count: timestamps.len().min(values.len()) as u32,
        })
    }

    /// Number of encoded samples.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Size of [`CompressedSamples::write_to`] output in bytes.
    pub fn encoded_len(&self) -> usize {
        8 + self.timestamps.as_raw_slice().len() + self.values.as_raw_slice().len()
    }

    /// Serializes both bit streams, each prefixed by its bit length.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.timestamps.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.timestamps.as_raw_slice());
        buf.extend_from_slice(self.values.as_raw_slice());
    }

    /// Deserializes streams written by [`CompressedSamples::write_to`].
    pub fn read_from(buf: &[u8], count: u32) -> Result<Self> {
        if buf.len() < 8 {
            return Err(truncated());
        }
        let ts_bits = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let val_bits = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let ts_bytes = ts_bits.div_ceil(8);
        let val_bytes = val_bits.div_ceil(8);
        if buf.len() < 8 + ts_bytes + val_bytes {
            return Err(truncated());
        }

        let mut timestamps = Bits::from_slice(&buf[8..8 + ts_bytes]);
        timestamps.truncate(ts_bits);
        let mut values = Bits::from_slice(&buf[8 + ts_bytes..8 + ts_bytes + val_bytes]);
        values.truncate(val_bits);

        Ok(Self {
            timestamps,
            values,
            count,
        })
    }

    /// Decodes the samples back in append order.
    ///
    /// # Errors
    ///
    /// Returns `NBTreeError::CorruptNode` if a stream ends early.
    pub fn decompress(&self) -> Result<(Vec<Timestamp>, Vec<f64>)> {
        let mut ts_decoder = TimestampDecoder::new(&self.timestamps);
        let mut val_decoder = ValueDecoder::new(&self.values);

        let count = self.count as usize;
        let mut timestamps = Vec::with_capacity(count);
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            timestamps.push(ts_decoder.decode_next().ok_or_else(truncated)?);
            values.push(val_decoder.decode_next().ok_or_else(truncated)?);
        }
        Ok((timestamps, values))
    }
}

fn truncated() -> NBTreeError {
    NBTreeError::CorruptNode("gorilla stream truncated".to_string())
}

fn push_bits(output: &mut Bits, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Bounds-checked sequential reader over a bit stream.
struct BitReader<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    fn read_bits(&mut self, width: u32) -> Option<u64> {
        let end = self.pos + width as usize;
        let slice = self.data.get(self.pos..end)?;
        let value = slice
            .iter()
            .fold(0u64, |acc, bit| (acc << 1) | u64::from(*bit));
        self.pos = end;
        Some(value)
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
struct TimestampEncoder {
    prev_ts: Option<Timestamp>,
    prev_delta: i64,
}

impl TimestampEncoder {
    fn new() -> Self {
        Self {
            prev_ts: None,
            prev_delta: 0,
        }
    }

    /// Returns false if the timestamp cannot be encoded.
    fn encode(&mut self, timestamp: Timestamp, output: &mut Bits) -> bool {
        let Some(prev_ts) = self.prev_ts else {
            self.prev_ts = Some(timestamp);
            push_bits(output, timestamp, 64);
            return true;
        };

        let delta = timestamp.wrapping_sub(prev_ts) as i64;
        let delta_of_delta = delta.wrapping_sub(self.prev_delta);

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else if let Ok(encoded) = i32::try_from(delta_of_delta) {
            push_bits(output, 0b1111, 4);
            push_bits(output, encoded as u32 as u64, 32);
        } else {
            return false;
        }

        self.prev_delta = delta;
        self.prev_ts = Some(timestamp);
        true
    }
}

/// Decoder for delta-of-delta encoded timestamps.
struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    prev_ts: Option<Timestamp>,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            prev_ts: None,
            prev_delta: 0,
        }
    }

    fn decode_next(&mut self) -> Option<Timestamp> {
        let Some(prev_ts) = self.prev_ts else {
            let ts = self.reader.read_bits(64)?;
            self.prev_ts = Some(ts);
            return Some(ts);
        };

        let delta_of_delta = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            self.reader.read_bits(32)? as u32 as i32 as i64
        };

        let delta = self.prev_delta.wrapping_add(delta_of_delta);
        let ts = prev_ts.wrapping_add(delta as u64);
        self.prev_delta = delta;
        self.prev_ts = Some(ts);
        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
struct ValueEncoder {
    prev_value: Option<u64>,
    prev_leading: u32,
    prev_trailing: u32,
}

impl ValueEncoder {
    fn new() -> Self {
        Self {
            prev_value: None,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn encode(&mut self, value: f64, output: &mut Bits) {
        let bits = value.to_bits();
        let Some(prev_value) = self.prev_value else {
            self.prev_value = Some(bits);
            push_bits(output, bits, 64);
            return;
        };

        let xor = bits ^ prev_value;
        if xor == 0 {
            output.push(false);
        } else {
            // The leading count field is 5 bits wide.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();
            let window_set = self.prev_leading + self.prev_trailing > 0;

            if window_set && leading >= self.prev_leading && trailing >= self.prev_trailing {
                push_bits(output, 0b10, 2);
                let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
                push_bits(output, xor >> self.prev_trailing, meaningful_bits);
            } else {
                push_bits(output, 0b11, 2);
                push_bits(output, leading as u64, 5);
                let meaningful_bits = 64 - leading - trailing;
                push_bits(output, (meaningful_bits - 1) as u64, 6);
                push_bits(output, xor >> trailing, meaningful_bits);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value = Some(bits);
    }
}

/// Decoder for XOR-encoded float values.
struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    prev_value: Option<u64>,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> ValueDecoder<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            prev_value: None,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    fn decode_next(&mut self) -> Option<f64> {
        let Some(prev_value) = self.prev_value else {
            let bits = self.reader.read_bits(64)?;
            self.prev_value = Some(bits);
            return Some(f64::from_bits(bits));
        };

        let xor = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            let meaningful_bits = 64 - self.prev_leading - self.prev_trailing;
            self.reader.read_bits(meaningful_bits)? << self.prev_trailing
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let meaningful_bits = self.reader.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful_bits)?;
            let xor = self.reader.read_bits(meaningful_bits)? << trailing;

            self.prev_leading = leading;
            self.prev_trailing = trailing;
            xor
        };

        let bits = prev_value ^ xor;
        self.prev_value = Some(bits);
        Some(f64::from_bits(bits))
    }
}
