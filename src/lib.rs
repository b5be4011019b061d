//! MLSAC Core - AI aim-assist detection pipeline
//!
//! Rotation samples become feature windows, windows are scored by a remote
//! model over a streaming hub session, and probabilities drive a debounced
//! buffer / violation-level state machine that selects punishments.
//!
//! The host feeds [`DetectionEngine`] with join/quit/rotation/attack/teleport
//! events and calls `on_tick` once per game tick; everything the host has to
//! deliver or execute comes back as a [`DetectionEvent`].

pub mod constants;
pub mod logging;
pub mod logic;

// Re-export common types
pub use logic::config::{ConfigError, DetectionConfig, LadderPolicy};
pub use logic::detection::{DataSessionRecorder, DetectionEngine, PlayerSnapshot, SessionLabel};
pub use logic::events::{DetectionEvent, EventEmitter};
pub use logic::features::{AimProcessor, FeatureTuple};
pub use logic::inference::{InferenceBackend, InferenceClient, InferenceError, PredictResult};
