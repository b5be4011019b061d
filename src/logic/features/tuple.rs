//! Feature Tuple - Per-tick derived rotation features
//!
//! Immutable once produced by the aim processor. Field order matches
//! `FEATURE_LAYOUT`, which is also the batch wire order.

use serde::{Deserialize, Serialize};
use super::layout::{FEATURE_COUNT, FEATURE_LAYOUT};

/// Sentinel emitted for the GCD residual when no sensitivity granularity is known
pub const GCD_ERROR_UNKNOWN: f64 = -1.0;

/// Derived features for one rotation sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureTuple {
    pub delta_yaw: f64,
    pub delta_pitch: f64,
    pub accel_yaw: f64,
    pub accel_pitch: f64,
    pub jerk_yaw: f64,
    pub jerk_pitch: f64,
    pub gcd_error_yaw: f64,
    pub gcd_error_pitch: f64,
}

impl FeatureTuple {
    /// Values in layout order
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.delta_yaw,
            self.delta_pitch,
            self.accel_yaw,
            self.accel_pitch,
            self.jerk_yaw,
            self.jerk_pitch,
            self.gcd_error_yaw,
            self.gcd_error_pitch,
        ]
    }

    /// Build from values in layout order
    pub fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        Self {
            delta_yaw: values[0],
            delta_pitch: values[1],
            accel_yaw: values[2],
            accel_pitch: values[3],
            jerk_yaw: values[4],
            jerk_pitch: values[5],
            gcd_error_yaw: values[6],
            gcd_error_pitch: values[7],
        }
    }

    /// True when the GCD residuals carry the unknown-sensitivity sentinel.
    /// Consumers must exclude these columns from normalization.
    pub fn has_unknown_gcd(&self) -> bool {
        self.gcd_error_yaw == GCD_ERROR_UNKNOWN || self.gcd_error_pitch == GCD_ERROR_UNKNOWN
    }

    /// Every value is finite
    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// CSV header (feature names + label column)
    pub fn csv_header() -> String {
        let mut header = FEATURE_LAYOUT.join(",");
        header.push_str(",is_cheating");
        header
    }

    /// CSV row with a trailing label
    pub fn to_csv(&self, label: &str) -> String {
        let mut row = self
            .to_array()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        row.push(',');
        row.push_str(label);
        row
    }
}

impl From<[f64; FEATURE_COUNT]> for FeatureTuple {
    fn from(values: [f64; FEATURE_COUNT]) -> Self {
        Self::from_array(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_order_matches_layout() {
        let tuple = FeatureTuple {
            delta_yaw: 1.0,
            delta_pitch: 2.0,
            accel_yaw: 3.0,
            accel_pitch: 4.0,
            jerk_yaw: 5.0,
            jerk_pitch: 6.0,
            gcd_error_yaw: 7.0,
            gcd_error_pitch: 8.0,
        };
        let values = tuple.to_array();
        assert_eq!(values, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(FeatureTuple::from_array(values), tuple);
    }

    #[test]
    fn test_unknown_gcd_sentinel() {
        let mut tuple = FeatureTuple::default();
        assert!(!tuple.has_unknown_gcd());
        tuple.gcd_error_yaw = GCD_ERROR_UNKNOWN;
        assert!(tuple.has_unknown_gcd());
    }

    #[test]
    fn test_csv_row() {
        let tuple = FeatureTuple { delta_yaw: 2.5, ..Default::default() };
        let header = FeatureTuple::csv_header();
        let row = tuple.to_csv("LEGIT");
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(row.starts_with("2.5,0,"));
        assert!(row.ends_with(",LEGIT"));
    }
}
