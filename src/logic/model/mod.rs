//! Model Module - Per-player Scoring State
//!
//! - `buffer` - rolling sample window, combat/step counters, submission gate
//! - `threshold` - buffer / violation-level scoring rules

pub mod buffer;
pub mod threshold;


// Re-export common types
pub use buffer::{PlayerDetectionState, RollingSampleBuffer, WindowState};
pub use threshold::{BufferConfig, ScoreOutcome, ViolationScoreEngine};
