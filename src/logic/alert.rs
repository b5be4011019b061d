//! Alert Manager - admin alert subscriptions
//!
//! Admins opt in or out of alerts; each alert is emitted as one event
//! addressed to the current subscriber set and optionally echoed to the log.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::logic::config::DetectionConfig;
use crate::logic::events::{DetectionEvent, EventEmitter};

/// What an alert reports
#[derive(Debug, Clone)]
pub struct AlertInput<'a> {
    pub player_uuid: Uuid,
    pub player_name: &'a str,
    pub probability: f64,
    pub buffer: f64,
    pub vl: u32,
    pub model: Option<&'a str>,
}

pub struct AlertManager {
    subscribers: BTreeSet<Uuid>,
    config: DetectionConfig,
    events: EventEmitter,
}

impl AlertManager {
    pub fn new(config: &DetectionConfig, events: EventEmitter) -> Self {
        Self {
            subscribers: BTreeSet::new(),
            config: config.clone(),
            events,
        }
    }

    pub fn apply_config(&mut self, config: &DetectionConfig) {
        self.config = config.clone();
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Flip a subscription; returns the new state
    pub fn toggle(&mut self, admin: Uuid) -> bool {
        if self.subscribers.remove(&admin) {
            false
        } else {
            self.subscribers.insert(admin);
            true
        }
    }

    pub fn enable(&mut self, admin: Uuid) {
        self.subscribers.insert(admin);
    }

    pub fn disable(&mut self, admin: Uuid) {
        self.subscribers.remove(&admin);
    }

    pub fn has_alerts_enabled(&self, admin: &Uuid) -> bool {
        self.subscribers.contains(admin)
    }

    pub fn subscribers(&self) -> Vec<Uuid> {
        self.subscribers.iter().copied().collect()
    }

    /// Subscriptions do not survive a reconnect
    pub fn on_quit(&mut self, player: &Uuid) {
        self.subscribers.remove(player);
    }

    // ========================================================================
    // DELIVERY
    // ========================================================================

    pub fn should_alert(&self, probability: f64) -> bool {
        probability >= self.config.buffer.alert_threshold
    }

    pub fn alert_threshold(&self) -> f64 {
        self.config.buffer.alert_threshold
    }

    pub fn format_message(&self, alert: &AlertInput<'_>) -> String {
        format!(
            "{} failed AI aim check ({}) | probability {:.2} | buffer {:.1} | VL {}",
            alert.player_name,
            self.config.model_display_name(alert.model),
            alert.probability,
            alert.buffer,
            alert.vl
        )
    }

    /// Emit the alert event; returns the formatted message
    pub fn send(&self, alert: &AlertInput<'_>) -> String {
        let message = self.format_message(alert);

        if self.config.console_alerts {
            log::info!("[Alert] {}", message);
        }

        self.events.emit(DetectionEvent::Alert {
            player_uuid: alert.player_uuid,
            player_name: alert.player_name.to_string(),
            probability: alert.probability,
            buffer: alert.buffer,
            vl: alert.vl,
            model: self.config.model_display_name(alert.model),
            message: message.clone(),
            recipients: self.subscribers(),
        });

        message
    }
}
