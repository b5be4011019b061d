//! Logic Module - Detection pipeline & engines
//!
//! - `features/` - rotation feature extraction (aim processor, layout)
//! - `model/` - per-player window state, buffer / VL scoring
//! - `inference/` - remote model service client (hub protocol, session, reconnect)
//! - `detection/` - per-tick orchestration, session recording
//! - `penalty/` - violation levels, punishment ladder, kick history

// Core modules
pub mod alert;
pub mod config;
pub mod events;
pub mod scheduler;

// Pipeline
pub mod detection;
pub mod features;
pub mod inference;
pub mod model;
pub mod penalty;
