//! Penalty - violation levels and punishment dispatch
//!
//! Flags raise a player's VL; the ladder turns the new VL into a command the
//! host executes. Kicks and bans are recorded for admin review.

pub mod manager;
pub mod parser;
pub mod types;

// Re-export common types
pub use manager::{FlagContext, PunishmentLadder, ViolationManager};
pub use parser::{has_action_prefix, parse, render, resolve};
pub use types::{
    ActionError, ActionKind, KickRecord, ParsedAction, PenaltyContext, PunishmentOrder,
    ViolationRecord,
};
