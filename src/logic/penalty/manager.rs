//! Violation Manager - VL bookkeeping and the punishment ladder
//!
//! Owns one `ViolationRecord` per player. A flag raises VL by one; the
//! configured ladder maps the new VL to at most one punishment per flag.
//! A per-player in-flight guard swallows duplicate flags until the tick ends.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use crate::constants::KICK_HISTORY_SIZE;
use crate::logic::config::{DetectionConfig, LadderPolicy};
use crate::logic::events::{DetectionEvent, EventEmitter};
use crate::logic::model::threshold::decay_level;
use super::parser;
use super::types::{ActionError, KickRecord, PenaltyContext, PunishmentOrder, ViolationRecord};

// ============================================================================
// LADDER
// ============================================================================

/// VL → command lookup
#[derive(Debug, Clone, Default)]
pub struct PunishmentLadder {
    steps: BTreeMap<u32, String>,
    policy: LadderPolicy,
}

impl PunishmentLadder {
    pub fn new(steps: BTreeMap<u32, String>, policy: LadderPolicy) -> Self {
        Self { steps, policy }
    }

    pub fn policy(&self) -> LadderPolicy {
        self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Command for a VL. `Exact` needs a matching key; `HighestAtOrBelow`
    /// takes the largest key not above the VL.
    pub fn lookup(&self, vl: u32) -> Option<&str> {
        match self.policy {
            LadderPolicy::Exact => self.steps.get(&vl).map(String::as_str),
            LadderPolicy::HighestAtOrBelow => {
                self.steps.range(..=vl).next_back().map(|(_, cmd)| cmd.as_str())
            }
        }
    }
}

// ============================================================================
// FLAG INPUT
// ============================================================================

/// Everything `on_flag` needs about the triggering result
#[derive(Debug, Clone)]
pub struct FlagContext {
    pub player_uuid: Uuid,
    pub player_name: String,
    pub probability: f64,
    pub buffer: f64,
    pub violation_level: u32,
    /// Model key reported with the result
    pub model: Option<String>,
}

impl FlagContext {
    fn penalty(&self) -> PenaltyContext {
        PenaltyContext {
            player_uuid: self.player_uuid,
            player_name: self.player_name.clone(),
            violation_level: self.violation_level,
            probability: self.probability,
            buffer: self.buffer,
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ViolationManager {
    ladder: PunishmentLadder,
    min_probability: f64,
    alert_only_models: HashSet<String>,
    records: HashMap<Uuid, ViolationRecord>,
    in_flight: HashSet<Uuid>,
    kick_history: VecDeque<KickRecord>,
    events: EventEmitter,
}

impl ViolationManager {
    pub fn new(config: &DetectionConfig, events: EventEmitter) -> Self {
        let mut manager = Self {
            ladder: PunishmentLadder::default(),
            min_probability: config.punishment_min_probability,
            alert_only_models: HashSet::new(),
            records: HashMap::new(),
            in_flight: HashSet::new(),
            kick_history: VecDeque::with_capacity(KICK_HISTORY_SIZE),
            events,
        };
        manager.apply_config(config);
        manager
    }

    /// Pick up a reloaded config; VLs and history are kept
    pub fn apply_config(&mut self, config: &DetectionConfig) {
        self.ladder = PunishmentLadder::new(config.punishments.clone(), config.ladder_policy);
        self.min_probability = config.punishment_min_probability;
        self.alert_only_models = config
            .models
            .iter()
            .filter(|(_, m)| m.only_alert)
            .map(|(key, _)| key.clone())
            .collect();
        log::debug!(
            "[Penalty] {} ladder step(s), policy {:?}, min probability {:.2}",
            config.punishments.len(),
            self.ladder.policy(),
            self.min_probability
        );
    }

    pub fn ladder(&self) -> &PunishmentLadder {
        &self.ladder
    }

    // ------------------------------------------------------------------
    // VL
    // ------------------------------------------------------------------

    pub fn violation_level(&self, player: &Uuid) -> u32 {
        self.records.get(player).map(|r| r.violation_level).unwrap_or(0)
    }

    pub fn record(&self, player: &Uuid) -> Option<&ViolationRecord> {
        self.records.get(player)
    }

    /// Raise VL by one, returning the new level
    pub fn increment(&mut self, player: Uuid) -> u32 {
        let record = self.records.entry(player).or_default();
        record.violation_level = record.violation_level.saturating_add(1);
        record.violation_level
    }

    pub fn reset_violation(&mut self, player: &Uuid) {
        if let Some(record) = self.records.get_mut(player) {
            record.violation_level = 0;
        }
    }

    /// Decay every VL by `amount`, floored at zero. Returns how many changed.
    pub fn decay_all(&mut self, amount: u32) -> usize {
        if amount == 0 {
            return 0;
        }
        let now = Utc::now();
        let mut changed = 0;
        for record in self.records.values_mut() {
            if record.violation_level > 0 {
                record.violation_level = decay_level(record.violation_level, amount);
                record.last_decay_time = Some(now);
                changed += 1;
            }
        }
        if changed > 0 {
            log::debug!("[Penalty] Decayed VL for {} player(s) by {}", changed, amount);
        }
        changed
    }

    /// Forget a player who left
    pub fn remove_player(&mut self, player: &Uuid) {
        self.records.remove(player);
        self.in_flight.remove(player);
    }

    // ------------------------------------------------------------------
    // PUNISHMENT
    // ------------------------------------------------------------------

    /// Resolve and dispatch the punishment for a flag. At most one order per
    /// player per tick; disconnect-class orders leave a kick record.
    pub fn on_flag(&mut self, flag: &FlagContext) -> Result<PunishmentOrder, ActionError> {
        if self.in_flight.contains(&flag.player_uuid) {
            return Err(ActionError::InFlight(flag.player_name.clone()));
        }
        if let Some(model) = flag.model.as_deref() {
            if self.alert_only_models.contains(model) {
                return Err(ActionError::AlertOnly(model.to_string()));
            }
        }
        if flag.probability < self.min_probability {
            return Err(ActionError::BelowMinimum {
                probability: flag.probability,
                minimum: self.min_probability,
            });
        }

        let template = self
            .ladder
            .lookup(flag.violation_level)
            .ok_or(ActionError::NoAction(flag.violation_level))?;
        let action = parser::resolve(template, &flag.penalty())?;

        self.in_flight.insert(flag.player_uuid);

        let order = PunishmentOrder {
            player_uuid: flag.player_uuid,
            player_name: flag.player_name.clone(),
            violation_level: flag.violation_level,
            action,
        };
        log::info!(
            "[Penalty] {} {} at VL {} (probability {:.2}, buffer {:.1})",
            order.action.kind,
            order.player_name,
            order.violation_level,
            flag.probability,
            flag.buffer
        );

        if order.action.kind.is_disconnect() {
            let kick = KickRecord {
                player_name: flag.player_name.clone(),
                timestamp: Utc::now(),
                probability: flag.probability,
                buffer: flag.buffer,
                vl: flag.violation_level,
            };
            self.push_kick(flag.player_uuid, kick.clone());
            self.events.emit(DetectionEvent::Punishment(order.clone()));
            self.events.emit(DetectionEvent::KickRecorded(kick));
        } else {
            self.events.emit(DetectionEvent::Punishment(order.clone()));
        }

        Ok(order)
    }

    fn push_kick(&mut self, player: Uuid, kick: KickRecord) {
        let record = self.records.entry(player).or_default();
        record.kick_history.push(kick.clone());
        if record.kick_history.len() > KICK_HISTORY_SIZE {
            let excess = record.kick_history.len() - KICK_HISTORY_SIZE;
            record.kick_history.drain(..excess);
        }

        if self.kick_history.len() == KICK_HISTORY_SIZE {
            self.kick_history.pop_front();
        }
        self.kick_history.push_back(kick);
    }

    /// Release the per-tick guard
    pub fn end_tick(&mut self) {
        self.in_flight.clear();
    }

    pub fn is_in_flight(&self, player: &Uuid) -> bool {
        self.in_flight.contains(player)
    }

    // ------------------------------------------------------------------
    // HISTORY
    // ------------------------------------------------------------------

    /// Most recent kicks across all players, newest last
    pub fn kick_history(&self) -> Vec<KickRecord> {
        self.kick_history.iter().cloned().collect()
    }

    pub fn player_kicks(&self, player: &Uuid) -> &[KickRecord] {
        self.records
            .get(player)
            .map(|r| r.kick_history.as_slice())
            .unwrap_or(&[])
    }

    pub fn clear_kick_history(&mut self) {
        self.kick_history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::config::ModelConfig;
    use crate::logic::penalty::ActionKind;

    fn config(policy: LadderPolicy) -> DetectionConfig {
        let mut config = DetectionConfig::default();
        config.punishments = BTreeMap::from([
            (1, "say {PLAYER} flagged".to_string()),
            (3, "kick: {PLAYER} AI aim ({PROBABILITY})".to_string()),
            (5, "ban: {PLAYER} 30d".to_string()),
        ]);
        config.ladder_policy = policy;
        config.punishment_min_probability = 0.85;
        config.models.insert(
            "shadow".to_string(),
            ModelConfig { name: "Shadow".to_string(), only_alert: true },
        );
        config
    }

    fn flag(vl: u32, probability: f64) -> FlagContext {
        FlagContext {
            player_uuid: Uuid::from_u128(7),
            player_name: "Steve".to_string(),
            probability,
            buffer: 52.0,
            violation_level: vl,
            model: None,
        }
    }

    #[test]
    fn test_ladder_policies() {
        let exact = PunishmentLadder::new(config(LadderPolicy::Exact).punishments, LadderPolicy::Exact);
        assert!(exact.lookup(2).is_none());
        assert_eq!(exact.lookup(3), Some("kick: {PLAYER} AI aim ({PROBABILITY})"));

        let below = PunishmentLadder::new(exact.steps.clone(), LadderPolicy::HighestAtOrBelow);
        assert!(below.lookup(0).is_none());
        assert_eq!(below.lookup(2), Some("say {PLAYER} flagged"));
        assert_eq!(below.lookup(4), exact.lookup(3));
        assert_eq!(below.lookup(99), Some("ban: {PLAYER} 30d"));
    }

    #[test]
    fn test_kick_records_history_and_events() {
        let events = EventEmitter::new();
        let mut rx = events.init();
        let mut manager = ViolationManager::new(&config(LadderPolicy::Exact), events);

        let order = manager.on_flag(&flag(3, 0.93)).unwrap();
        assert_eq!(order.action.kind, ActionKind::Kick);
        assert_eq!(order.action.command, "Steve AI aim (0.93)");

        assert!(matches!(rx.try_recv().unwrap(), DetectionEvent::Punishment(_)));
        match rx.try_recv().unwrap() {
            DetectionEvent::KickRecorded(kick) => assert_eq!(kick.vl, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(manager.kick_history().len(), 1);
        assert_eq!(manager.player_kicks(&Uuid::from_u128(7)).len(), 1);
    }

    #[test]
    fn test_duplicate_flag_same_tick_suppressed() {
        let mut manager = ViolationManager::new(&config(LadderPolicy::Exact), EventEmitter::new());
        assert!(manager.on_flag(&flag(1, 0.9)).is_ok());
        assert!(matches!(manager.on_flag(&flag(1, 0.9)), Err(ActionError::InFlight(_))));

        manager.end_tick();
        assert!(manager.on_flag(&flag(1, 0.9)).is_ok());
    }

    #[test]
    fn test_gates_before_dispatch() {
        let mut manager = ViolationManager::new(&config(LadderPolicy::Exact), EventEmitter::new());

        assert!(matches!(
            manager.on_flag(&flag(3, 0.6)),
            Err(ActionError::BelowMinimum { .. })
        ));
        assert!(matches!(manager.on_flag(&flag(2, 0.95)), Err(ActionError::NoAction(2))));

        let mut shadow = flag(3, 0.99);
        shadow.model = Some("shadow".to_string());
        assert!(matches!(manager.on_flag(&shadow), Err(ActionError::AlertOnly(_))));
        assert!(!manager.is_in_flight(&shadow.player_uuid));
    }

    #[test]
    fn test_violation_level_decay_floors_at_zero() {
        let mut manager = ViolationManager::new(&config(LadderPolicy::Exact), EventEmitter::new());
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        manager.increment(a);
        manager.increment(a);
        manager.increment(b);

        assert_eq!(manager.decay_all(1), 2);
        assert_eq!(manager.violation_level(&a), 1);
        assert_eq!(manager.violation_level(&b), 0);
        assert!(manager.record(&b).unwrap().last_decay_time.is_some());

        assert_eq!(manager.decay_all(5), 1);
        assert_eq!(manager.violation_level(&a), 0);
        assert_eq!(manager.decay_all(1), 0);

        manager.remove_player(&a);
        assert!(manager.record(&a).is_none());
    }

    #[test]
    fn test_global_history_is_bounded() {
        let mut manager = ViolationManager::new(&config(LadderPolicy::HighestAtOrBelow), EventEmitter::new());
        for i in 0..(KICK_HISTORY_SIZE as u32 + 5) {
            manager.on_flag(&flag(3 + (i % 2), 0.9)).unwrap();
            manager.end_tick();
        }
        let history = manager.kick_history();
        assert_eq!(history.len(), KICK_HISTORY_SIZE);
        assert_eq!(manager.player_kicks(&Uuid::from_u128(7)).len(), KICK_HISTORY_SIZE);
    }
}
