//! Detection Module - per-player pipeline coordination
//!
//! - `engine` - owns player state, submits windows, scores results, flags
//! - `recording` - labelled capture of combat ticks for training data

pub mod engine;
pub mod recording;


// Re-export common types
pub use engine::{DetectionEngine, EngineMessage, PlayerSnapshot};
pub use recording::{
    DataSession, DataSessionRecorder, SessionLabel, SessionRecorder, COMBAT_TIMEOUT_TICKS,
};
