//! Feature Layout - per-tick schema shared with the inference server
//!
//! The batch codec writes columns in `FEATURE_LAYOUT` order. Reordering,
//! adding or removing a column is a schema change: bump `FEATURE_VERSION`.
//! The layout hash is folded into the client fingerprint so the server can
//! refuse a client built against another schema.

use crc32fast::Hasher;
use once_cell::sync::Lazy;

/// Schema revision, hashed together with the column names
pub const FEATURE_VERSION: u8 = 1;

/// Column names in wire order
pub const FEATURE_LAYOUT: &[&str] = &[
    "delta_yaw",       // wrapped to (-180, 180]
    "delta_pitch",
    "accel_yaw",
    "accel_pitch",
    "jerk_yaw",
    "jerk_pitch",
    "gcd_error_yaw",   // -1 when the sensitivity step is unknown
    "gcd_error_pitch",
];

pub const FEATURE_COUNT: usize = 8;

const _: () = assert!(FEATURE_LAYOUT.len() == FEATURE_COUNT);

static LAYOUT_HASH: Lazy<u32> = Lazy::new(|| {
    let mut crc = Hasher::new();
    crc.update(&[FEATURE_VERSION]);
    for column in FEATURE_LAYOUT {
        // NUL-separated so "ab","c" and "a","bc" differ
        crc.update(column.as_bytes());
        crc.update(&[0]);
    }
    crc.finalize()
});

/// CRC32 over version and column names
pub fn layout_hash() -> u32 {
    *LAYOUT_HASH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_hash_covers_version_and_names() {
        let mut crc = Hasher::new();
        crc.update(&[FEATURE_VERSION]);
        for column in FEATURE_LAYOUT {
            crc.update(column.as_bytes());
            crc.update(&[0]);
        }
        assert_eq!(layout_hash(), crc.finalize());
        assert_eq!(layout_hash(), layout_hash());
    }

    #[test]
    fn test_columns_are_unique() {
        let mut names: Vec<&str> = FEATURE_LAYOUT.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FEATURE_COUNT);
    }
}
