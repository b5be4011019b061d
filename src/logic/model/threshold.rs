//! Violation Score Engine - Buffer / VL model
//!
//! Two timescales:
//! - the per-player **buffer** accumulates suspicion fast and decides *when* a flag fires
//! - the **violation level** (VL) moves by whole steps and decays slowly; it selects the punishment
//!
//! Everything here is pure: callers own the numbers and apply the outcome.

use serde::{Deserialize, Serialize};
use crate::constants::{
    DEFAULT_ALERT_THRESHOLD, DEFAULT_BUFFER_DECREASE, DEFAULT_BUFFER_FLAG,
    DEFAULT_BUFFER_MULTIPLIER, DEFAULT_BUFFER_RESET_ON_FLAG,
};

// ============================================================================
// CONFIG
// ============================================================================

/// Buffer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Probability at or above which the buffer accumulates (0.0 - 1.0)
    pub alert_threshold: f64,

    /// Buffer level that raises a flag
    pub flag: f64,

    /// Buffer value restored after a flag
    pub reset_on_flag: f64,

    /// Probability multiplier on accumulation
    pub multiplier: f64,

    /// Decrease applied on a low-probability result
    pub decrease: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            flag: DEFAULT_BUFFER_FLAG,
            reset_on_flag: DEFAULT_BUFFER_RESET_ON_FLAG,
            multiplier: DEFAULT_BUFFER_MULTIPLIER,
            decrease: DEFAULT_BUFFER_DECREASE,
        }
    }
}

// ============================================================================
// PURE UPDATE RULES
// ============================================================================

/// New buffer value after one probability
pub fn update_buffer(buffer: f64, probability: f64, config: &BufferConfig) -> f64 {
    if probability >= config.alert_threshold {
        buffer + probability * config.multiplier
    } else {
        (buffer - config.decrease).max(0.0)
    }
}

/// Whether the buffer has reached the flag level
pub fn should_flag(buffer: f64, flag_threshold: f64) -> bool {
    buffer >= flag_threshold
}

/// VL after one decay step, floored at 0
pub fn decay_level(level: u32, amount: u32) -> u32 {
    level.saturating_sub(amount)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Result of scoring one probability
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    /// Buffer before the update
    pub previous: f64,
    /// Buffer as it stood when the flag check ran
    pub peak: f64,
    /// Buffer to store (reset value when flagged)
    pub buffer: f64,
    pub flagged: bool,
}

impl ScoreOutcome {
    /// Signed change applied by the update itself (before any flag reset)
    pub fn delta(&self) -> f64 {
        self.peak - self.previous
    }
}

/// Stateless scorer bound to one buffer config
#[derive(Debug, Clone, Default)]
pub struct ViolationScoreEngine {
    config: BufferConfig,
}

impl ViolationScoreEngine {
    pub fn new(config: BufferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Swap tuning on reload
    pub fn set_config(&mut self, config: BufferConfig) {
        self.config = config;
    }

    /// Update without the flag check
    pub fn update(&self, buffer: f64, probability: f64) -> f64 {
        update_buffer(buffer, probability, &self.config)
    }

    pub fn should_flag(&self, buffer: f64) -> bool {
        should_flag(buffer, self.config.flag)
    }

    /// Full scoring step: update, check, and reset on flag.
    /// The caller increments VL when `flagged` is set.
    pub fn score(&self, buffer: f64, probability: f64) -> ScoreOutcome {
        let peak = self.update(buffer, probability);
        let flagged = self.should_flag(peak);

        ScoreOutcome {
            previous: buffer,
            peak,
            buffer: if flagged { self.config.reset_on_flag } else { peak },
            flagged,
        }
    }
}
