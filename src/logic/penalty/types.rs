//! Penalty Types
//!
//! Action kinds, parsed actions, the placeholder context and kick records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ACTION KIND
// ============================================================================

/// Class of a configured punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionKind {
    /// Disconnect the player
    Kick,
    /// Ban the player
    Ban,
    /// Opaque console command
    Raw,
}

impl ActionKind {
    /// Command prefix selecting this kind (`None` for raw)
    pub fn prefix(&self) -> Option<&'static str> {
        match self {
            ActionKind::Kick => Some("kick:"),
            ActionKind::Ban => Some("ban:"),
            ActionKind::Raw => None,
        }
    }

    /// Kick and ban remove the player from the server
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ActionKind::Kick | ActionKind::Ban)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Kick => "KICK",
            ActionKind::Ban => "BAN",
            ActionKind::Raw => "RAW",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PARSED ACTION
// ============================================================================

/// Configured command split into kind and body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub kind: ActionKind,
    /// Command body with the prefix removed
    pub command: String,
}

impl ParsedAction {
    pub fn new(kind: ActionKind, command: impl Into<String>) -> Self {
        Self { kind, command: command.into() }
    }

    pub fn has_command(&self) -> bool {
        !self.command.is_empty()
    }
}

/// Values substituted into command placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyContext {
    pub player_uuid: Uuid,
    pub player_name: String,
    pub violation_level: u32,
    pub probability: f64,
    pub buffer: f64,
}

/// Fully resolved punishment ready for the host to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PunishmentOrder {
    pub player_uuid: Uuid,
    pub player_name: String,
    pub violation_level: u32,
    pub action: ParsedAction,
}

// ============================================================================
// KICK RECORD
// ============================================================================

/// One disconnect-class punishment, kept for admin review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickRecord {
    pub player_name: String,
    pub timestamp: DateTime<Utc>,
    pub probability: f64,
    pub buffer: f64,
    pub vl: u32,
}

/// Per-player violation bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub violation_level: u32,
    pub last_decay_time: Option<DateTime<Utc>>,
    pub kick_history: Vec<KickRecord>,
}

impl Default for ViolationRecord {
    fn default() -> Self {
        Self {
            violation_level: 0,
            last_decay_time: None,
            kick_history: Vec::new(),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("empty punishment command")]
    EmptyCommand,

    #[error("no punishment configured for VL {0}")]
    NoAction(u32),

    #[error("punishment already in flight for {0}")]
    InFlight(String),

    #[error("probability {probability:.2} below punishment minimum {minimum:.2}")]
    BelowMinimum { probability: f64, minimum: f64 },

    #[error("model '{0}' is alert-only")]
    AlertOnly(String),
}
