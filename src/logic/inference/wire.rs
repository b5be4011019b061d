//! Batch Wire Format
//!
//! Headerless array of fixed 32-byte records, one per tick, oldest first.
//! Each record is the 8 features of `FEATURE_LAYOUT` as little-endian f32.
//!
//! Features are computed in f64 and narrowed to f32 on the wire. Values with
//! magnitude below ~3.4e38 round-trip within f32 precision (relative error
//! <= 2^-24); the GCD sentinel -1.0 is exact.

use thiserror::Error;

use crate::logic::features::{FeatureTuple, FEATURE_COUNT};

/// Bytes per feature value
pub const VALUE_SIZE: usize = 4;

/// Bytes per tick record
pub const RECORD_SIZE: usize = FEATURE_COUNT * VALUE_SIZE;

/// Relative error bound for f64 → f32 → f64
pub const NARROWING_EPSILON: f64 = 1.0 / (1u64 << 24) as f64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("batch length {0} is not a multiple of the 32-byte record size")]
    BadLength(usize),

    #[error("non-finite value in record {record}, feature {feature}")]
    NonFinite { record: usize, feature: usize },
}

/// Encode a window into the batch format
pub fn encode_batch(batch: &[FeatureTuple]) -> Vec<u8> {
    let mut out = Vec::with_capacity(batch.len() * RECORD_SIZE);
    for tuple in batch {
        for value in tuple.to_array() {
            out.extend_from_slice(&(value as f32).to_le_bytes());
        }
    }
    out
}

/// Reference decoder
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<FeatureTuple>, WireError> {
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(WireError::BadLength(bytes.len()));
    }

    bytes
        .chunks_exact(RECORD_SIZE)
        .enumerate()
        .map(|(record, chunk)| {
            let mut values = [0.0f64; FEATURE_COUNT];
            for (feature, raw) in chunk.chunks_exact(VALUE_SIZE).enumerate() {
                let value = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if !value.is_finite() {
                    return Err(WireError::NonFinite { record, feature });
                }
                values[feature] = value as f64;
            }
            Ok(FeatureTuple::from_array(values))
        })
        .collect()
}

/// Records in an encoded batch
pub fn record_count(bytes: &[u8]) -> usize {
    bytes.len() / RECORD_SIZE
}
