//! Features Module - Rotation Feature Extraction
//!
//! Turns the raw look-packet stream into per-tick feature tuples.
//! `layout` is the authoritative feature order shared with the inference server.

pub mod aim;
pub mod layout;
pub mod tuple;


// Re-export common types
pub use aim::{wrap_degrees, AimProcessor};
pub use layout::{layout_hash, FEATURE_COUNT, FEATURE_LAYOUT, FEATURE_VERSION};
pub use tuple::{FeatureTuple, GCD_ERROR_UNKNOWN};
