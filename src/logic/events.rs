//! Event Emitter - Outbound detection events
//!
//! Alerts, punishments and connection changes leave the core as
//! [`DetectionEvent`]s on a channel the host drains. Emitting before a
//! receiver is attached (or after it is dropped) silently drops the event.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::logic::penalty::{KickRecord, PunishmentOrder};

/// Event names
pub mod names {
    pub const ALERT: &str = "detection:alert";
    pub const FLAG: &str = "detection:flag";
    pub const PUNISHMENT: &str = "penalty:punishment";
    pub const KICK_RECORDED: &str = "penalty:kick-recorded";
    pub const CONNECTION_LOST: &str = "inference:connection-lost";
    pub const CONNECTION_RESTORED: &str = "inference:connection-restored";
    pub const CONNECTION_FAILING: &str = "inference:connection-failing";
    pub const AUTHENTICATION_FAILED: &str = "inference:authentication-failed";
}

/// Everything the core asks its host to deliver or execute
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionEvent {
    /// Alert for subscribed admins
    Alert {
        player_uuid: Uuid,
        player_name: String,
        probability: f64,
        buffer: f64,
        vl: u32,
        model: String,
        message: String,
        recipients: Vec<Uuid>,
    },
    /// Buffer crossed the flag threshold
    Flag {
        player_uuid: Uuid,
        player_name: String,
        probability: f64,
        buffer: f64,
        vl: u32,
    },
    /// Punishment command for the host to execute
    Punishment(PunishmentOrder),
    KickRecorded(KickRecord),
    ConnectionLost { reason: String },
    ConnectionRestored { session_id: String },
    /// Connecting keeps failing; raised once per failure streak
    ConnectionFailing { attempts: u32, reason: String },
    AuthenticationFailed { reason: String },
}

impl DetectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionEvent::Alert { .. } => names::ALERT,
            DetectionEvent::Flag { .. } => names::FLAG,
            DetectionEvent::Punishment(_) => names::PUNISHMENT,
            DetectionEvent::KickRecorded(_) => names::KICK_RECORDED,
            DetectionEvent::ConnectionLost { .. } => names::CONNECTION_LOST,
            DetectionEvent::ConnectionRestored { .. } => names::CONNECTION_RESTORED,
            DetectionEvent::ConnectionFailing { .. } => names::CONNECTION_FAILING,
            DetectionEvent::AuthenticationFailed { .. } => names::AUTHENTICATION_FAILED,
        }
    }
}

/// Cloneable handle shared by every component that emits
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sender: Arc<RwLock<Option<mpsc::UnboundedSender<DetectionEvent>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a receiver, replacing any previous one
    pub fn init(&self) -> mpsc::UnboundedReceiver<DetectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write() = Some(tx);
        log::info!("Event emitter initialized");
        rx
    }

    /// Check if a receiver is attached
    pub fn is_initialized(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Emit event to the host
    pub fn emit(&self, event: DetectionEvent) {
        let guard = self.sender.read();
        match guard.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(event) {
                    log::debug!("Event receiver gone, '{}' dropped", e.0.name());
                }
            }
            None => {
                // Silent fail - don't crash if not initialized
                log::debug!("Event system not initialized, event '{}' dropped", event.name());
            }
        }
    }

    pub fn emit_connection_lost(&self, reason: impl Into<String>) {
        self.emit(DetectionEvent::ConnectionLost { reason: reason.into() });
    }

    pub fn emit_connection_restored(&self, session_id: impl Into<String>) {
        self.emit(DetectionEvent::ConnectionRestored { session_id: session_id.into() });
    }

    pub fn emit_connection_failing(&self, attempts: u32, reason: impl Into<String>) {
        self.emit(DetectionEvent::ConnectionFailing { attempts, reason: reason.into() });
    }

    pub fn emit_authentication_failed(&self, reason: impl Into<String>) {
        self.emit(DetectionEvent::AuthenticationFailed { reason: reason.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receiver_is_silent() {
        let emitter = EventEmitter::new();
        assert!(!emitter.is_initialized());
        emitter.emit_connection_lost("test");
    }

    #[test]
    fn test_emit_reaches_receiver() {
        let emitter = EventEmitter::new();
        let mut rx = emitter.init();
        emitter.clone().emit_connection_restored("abcd1234...");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.name(), names::CONNECTION_RESTORED);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(DetectionEvent::AuthenticationFailed {
            reason: "bad key".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "authentication_failed");
        assert_eq!(json["reason"], "bad key");
    }
}
