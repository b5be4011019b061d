//! Aim Processor - Rotation Feature Extraction
//!
//! Turns raw (yaw, pitch) samples into a [`FeatureTuple`]: wrapped deltas,
//! accelerations, jerks and the sensitivity-quantization residual.
//!
//! Only a few samples of memory are kept. Until four samples have been seen
//! since the last reset, accelerations and jerks are reported as exactly 0.0.

use super::tuple::{FeatureTuple, GCD_ERROR_UNKNOWN};

/// Samples required before accel/jerk are reported
pub const MIN_SAMPLES_FOR_DERIVATIVES: u32 = 4;

/// Normalize an angle difference into (-180, 180]
pub fn wrap_degrees(delta: f64) -> f64 {
    let mut wrapped = delta % 360.0;
    if wrapped <= -180.0 {
        wrapped += 360.0;
    } else if wrapped > 180.0 {
        wrapped -= 360.0;
    }
    wrapped
}

/// Rotation step in degrees produced by one mouse count at the given
/// client sensitivity (0.0 - 1.0 slider value)
pub fn sensitivity_granularity(sensitivity: f64) -> f64 {
    let f = sensitivity * 0.6 + 0.2;
    f * f * f * 8.0 * 0.15
}

/// `delta mod granularity`, always in [0, granularity)
pub fn gcd_residual(delta: f64, granularity: f64) -> f64 {
    if granularity <= 0.0 || !granularity.is_finite() || !delta.is_finite() {
        return GCD_ERROR_UNKNOWN;
    }
    delta.rem_euclid(granularity)
}

/// Per-player rolling aim state
#[derive(Debug, Clone, Default)]
pub struct AimProcessor {
    last_rotation: Option<(f64, f64)>,
    last_delta: (f64, f64),
    last_accel: (f64, f64),
    samples_seen: u32,
    /// Client-reported sensitivity slider value
    sensitivity: Option<f64>,
    /// Fallback quantization step when the client never reported a sensitivity
    default_granularity: Option<f64>,
}

impl AimProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor using a fixed fallback granularity when sensitivity is unknown
    pub fn with_default_granularity(granularity: Option<f64>) -> Self {
        Self {
            default_granularity: granularity.filter(|g| *g > 0.0 && g.is_finite()),
            ..Default::default()
        }
    }

    /// Record the client's reported mouse sensitivity
    pub fn set_sensitivity(&mut self, sensitivity: Option<f64>) {
        self.sensitivity = sensitivity.filter(|s| s.is_finite() && *s >= 0.0);
    }

    /// Quantization step currently applied, if any
    pub fn granularity(&self) -> Option<f64> {
        self.sensitivity
            .map(sensitivity_granularity)
            .or(self.default_granularity)
    }

    /// Samples observed since the last reset
    pub fn samples_seen(&self) -> u32 {
        self.samples_seen
    }

    /// Feed one rotation sample
    pub fn process(&mut self, yaw: f32, pitch: f32) -> FeatureTuple {
        let (yaw, pitch) = (yaw as f64, pitch as f64);

        // Non-finite input is treated as no movement
        let (yaw, pitch) = match self.last_rotation {
            Some((ly, lp)) if !yaw.is_finite() || !pitch.is_finite() => (ly, lp),
            None if !yaw.is_finite() || !pitch.is_finite() => (0.0, 0.0),
            _ => (yaw, pitch),
        };

        self.samples_seen = self.samples_seen.saturating_add(1);

        let Some((last_yaw, last_pitch)) = self.last_rotation.replace((yaw, pitch)) else {
            return FeatureTuple {
                gcd_error_yaw: self.residual(0.0),
                gcd_error_pitch: self.residual(0.0),
                ..Default::default()
            };
        };

        let delta = (wrap_degrees(yaw - last_yaw), wrap_degrees(pitch - last_pitch));

        let accel = if self.samples_seen >= 3 {
            (delta.0 - self.last_delta.0, delta.1 - self.last_delta.1)
        } else {
            (0.0, 0.0)
        };

        let jerk = if self.samples_seen >= MIN_SAMPLES_FOR_DERIVATIVES {
            (accel.0 - self.last_accel.0, accel.1 - self.last_accel.1)
        } else {
            (0.0, 0.0)
        };

        self.last_delta = delta;
        self.last_accel = accel;

        let reported_accel = if self.samples_seen >= MIN_SAMPLES_FOR_DERIVATIVES {
            accel
        } else {
            (0.0, 0.0)
        };

        FeatureTuple {
            delta_yaw: delta.0,
            delta_pitch: delta.1,
            accel_yaw: reported_accel.0,
            accel_pitch: reported_accel.1,
            jerk_yaw: jerk.0,
            jerk_pitch: jerk.1,
            gcd_error_yaw: self.residual(delta.0),
            gcd_error_pitch: self.residual(delta.1),
        }
    }

    /// Clear all rotation memory (teleport, long idle). Sensitivity is kept.
    pub fn reset(&mut self) {
        self.last_rotation = None;
        self.last_delta = (0.0, 0.0);
        self.last_accel = (0.0, 0.0);
        self.samples_seen = 0;
    }

    fn residual(&self, delta: f64) -> f64 {
        match self.granularity() {
            Some(g) => gcd_residual(delta, g),
            None => GCD_ERROR_UNKNOWN,
        }
    }
}
