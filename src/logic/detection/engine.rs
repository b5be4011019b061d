//! Detection Engine - per-tick coordinator
//!
//! Single owner of every `PlayerDetectionState`. Inbound host events mutate
//! state directly; inference runs on the async runtime and posts its results
//! back as `EngineMessage`s, which are applied when the host calls `on_tick`.
//! Each submission carries a ticket so results for a player who left, or for
//! a superseded submission, are dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::logic::alert::{AlertInput, AlertManager};
use crate::logic::config::DetectionConfig;
use crate::logic::events::{DetectionEvent, EventEmitter};
use crate::logic::inference::{InferenceBackend, InferenceClient, PredictResult};
use crate::logic::model::{PlayerDetectionState, ViolationScoreEngine, WindowState};
use crate::logic::penalty::{ActionError, FlagContext, KickRecord, ViolationManager};
use crate::logic::scheduler::PeriodicTask;
use super::recording::SessionRecorder;

// ============================================================================
// MESSAGES
// ============================================================================

/// Work posted back onto the tick context
#[derive(Debug, Clone)]
pub enum EngineMessage {
    /// One streamed result
    PredictResult {
        player: Uuid,
        ticket: u64,
        result: PredictResult,
    },
    /// The stream for a submission ended
    PredictFinished { player: Uuid, ticket: u64 },
    /// VL decay timer fired
    DecayViolations { amount: u32 },
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Read-only view of one player for admin surfaces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerSnapshot {
    pub player_uuid: Uuid,
    pub player_name: String,
    pub buffer: f64,
    pub last_probability: f64,
    pub average_probability: f64,
    pub probability_history: Vec<f64>,
    pub high_probability_detections: u32,
    pub violation_level: u32,
    pub window_state: WindowState,
    pub window_len: usize,
    pub in_combat: bool,
    pub pending: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct DetectionEngine {
    config: DetectionConfig,
    players: HashMap<Uuid, PlayerDetectionState>,
    scorer: ViolationScoreEngine,
    violations: ViolationManager,
    alerts: AlertManager,
    events: EventEmitter,

    backend: Option<Arc<dyn InferenceBackend>>,
    client: Option<InferenceClient>,
    recorder: Option<Box<dyn SessionRecorder>>,

    runtime: Handle,
    messages_tx: mpsc::UnboundedSender<EngineMessage>,
    messages_rx: mpsc::UnboundedReceiver<EngineMessage>,
    next_ticket: u64,
    decay_task: PeriodicTask,
}

impl DetectionEngine {
    /// Engine over any backend. Without one, events are still tracked but
    /// nothing is submitted.
    pub fn new(
        config: DetectionConfig,
        backend: Option<Arc<dyn InferenceBackend>>,
        events: EventEmitter,
        runtime: Handle,
    ) -> Self {
        let config = config.sanitize();
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();

        if config.enabled && backend.is_none() {
            log::warn!("Detection enabled but no inference backend; running without submissions");
        }

        let mut engine = Self {
            scorer: ViolationScoreEngine::new(config.buffer.clone()),
            violations: ViolationManager::new(&config, events.clone()),
            alerts: AlertManager::new(&config, events.clone()),
            config,
            players: HashMap::new(),
            events,
            backend,
            client: None,
            recorder: None,
            runtime,
            messages_tx,
            messages_rx,
            next_ticket: 0,
            decay_task: PeriodicTask::new("vl-decay"),
        };
        engine.restart_decay();
        engine
    }

    /// Engine backed by the WebSocket inference client. A bad endpoint or
    /// key disables detection instead of failing.
    pub fn connect(config: DetectionConfig, events: EventEmitter, runtime: Handle) -> Self {
        let mut config = config.sanitize();
        let client = if config.enabled {
            match InferenceClient::from_config(&config, events.clone(), runtime.clone()) {
                Ok(client) => {
                    client.start();
                    Some(client)
                }
                Err(e) => {
                    log::warn!("Detection disabled: {}", e);
                    config.enabled = false;
                    None
                }
            }
        } else {
            log::info!("Detection disabled by configuration");
            None
        };

        let backend = client
            .clone()
            .map(|c| Arc::new(c) as Arc<dyn InferenceBackend>);
        let mut engine = Self::new(config, backend, events, runtime);
        engine.client = client;
        engine
    }

    /// Attach the session recording collaborator
    pub fn with_recorder(mut self, recorder: Box<dyn SessionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn client(&self) -> Option<&InferenceClient> {
        self.client.as_ref()
    }

    // ========================================================================
    // HOST EVENTS
    // ========================================================================

    pub fn on_join(&mut self, player: Uuid, player_name: &str) {
        let state = PlayerDetectionState::new(player_name, self.config.sequence, self.config.step)
            .with_default_granularity(self.config.default_granularity);
        self.players.insert(player, state);
        self.report_online();
    }

    /// Drop everything held for the player; a late result is discarded
    pub fn on_quit(&mut self, player: Uuid) {
        if let Some(state) = self.players.remove(&player) {
            if state.is_pending() {
                log::debug!("{} left with a submission in flight", state.player_name());
            }
        }
        self.violations.remove_player(&player);
        self.alerts.on_quit(&player);
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_quit(player);
        }
        self.report_online();
    }

    /// One rotation sample; may submit the window
    pub fn on_rotation(&mut self, player: Uuid, yaw: f32, pitch: f32) {
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_rotation(player, yaw, pitch);
        }

        let Some(state) = self.players.get_mut(&player) else {
            return;
        };
        state.on_rotation(yaw, pitch);
        let ready = state.should_submit();

        if ready && self.can_submit() {
            self.submit(player);
        }
    }

    pub fn on_attack(&mut self, attacker: Uuid, target: Uuid) {
        if let Some(state) = self.players.get_mut(&attacker) {
            state.on_attack();
            log::trace!("{} attacked {}", state.player_name(), target);
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.on_attack(attacker);
        }
    }

    pub fn on_teleport(&mut self, player: Uuid) {
        if let Some(state) = self.players.get_mut(&player) {
            state.on_teleport();
        }
    }

    /// Client-reported mouse sensitivity (0..1), if known
    pub fn set_sensitivity(&mut self, player: Uuid, sensitivity: Option<f64>) {
        if let Some(state) = self.players.get_mut(&player) {
            state.set_sensitivity(sensitivity);
        }
    }

    /// Apply posted results, advance counters, release the punishment guard
    pub fn on_tick(&mut self) {
        self.drain();
        for state in self.players.values_mut() {
            state.on_tick();
        }
        self.violations.end_tick();
    }

    /// Apply every queued message; returns how many were handled
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.messages_rx.try_recv() {
            self.apply(message);
            handled += 1;
        }
        handled
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    fn can_submit(&self) -> bool {
        self.config.enabled
            && self
                .backend
                .as_ref()
                .is_some_and(|backend| backend.is_available())
    }

    fn submit(&mut self, player: Uuid) {
        let Some(backend) = self.backend.clone() else {
            return;
        };
        let Some(state) = self.players.get_mut(&player) else {
            return;
        };

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let batch = state.begin_submission(ticket);
        let player_name = state.player_name().to_string();
        log::debug!("Submitting {} ticks for {} (ticket {})", batch.len(), player_name, ticket);

        let tx = self.messages_tx.clone();
        self.runtime.spawn(async move {
            let mut results = backend.predict_stream(batch, player, player_name).await;
            while let Some(result) = results.recv().await {
                let message = EngineMessage::PredictResult { player, ticket, result };
                if tx.send(message).is_err() {
                    return;
                }
            }
            let _ = tx.send(EngineMessage::PredictFinished { player, ticket });
        });
    }

    fn apply(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::PredictResult { player, ticket, result } => {
                self.apply_result(player, ticket, result)
            }
            EngineMessage::PredictFinished { player, ticket } => {
                if let Some(state) = self.players.get_mut(&player) {
                    state.finish_submission(ticket);
                }
            }
            EngineMessage::DecayViolations { amount } => {
                self.violations.decay_all(amount);
            }
        }
    }

    fn apply_result(&mut self, player: Uuid, ticket: u64, result: PredictResult) {
        let Some(state) = self.players.get_mut(&player) else {
            log::debug!("Dropping result for departed player {}", player);
            return;
        };
        if state.pending_ticket() != Some(ticket) {
            log::debug!("Dropping stale result (ticket {}) for {}", ticket, state.player_name());
            return;
        }

        if result.is_error() {
            log::warn!(
                "[Inference] Prediction for {} failed: {} {}",
                state.player_name(),
                result.error_code.as_deref().unwrap_or("UNKNOWN"),
                result.error_message.as_deref().unwrap_or("")
            );
            return;
        }

        let probability = result.probability;
        state.record_probability(probability);
        let outcome = self.scorer.score(state.buffer(), probability);
        state.set_buffer(outcome.buffer);

        log::debug!(
            "{} probability {:.3} buffer {:.1} -> {:.1}",
            state.player_name(),
            probability,
            outcome.previous,
            outcome.buffer
        );

        if !outcome.flagged {
            return;
        }

        let player_name = state.player_name().to_string();
        let vl = self.violations.increment(player);
        log::info!(
            "{} flagged (probability {:.2}, buffer {:.1}, VL {})",
            player_name,
            probability,
            outcome.peak,
            vl
        );

        self.events.emit(DetectionEvent::Flag {
            player_uuid: player,
            player_name: player_name.clone(),
            probability,
            buffer: outcome.peak,
            vl,
        });

        if self.alerts.should_alert(probability) {
            self.alerts.send(&AlertInput {
                player_uuid: player,
                player_name: &player_name,
                probability,
                buffer: outcome.peak,
                vl,
                model: result.model.as_deref(),
            });
        }

        let flag = FlagContext {
            player_uuid: player,
            player_name,
            probability,
            buffer: outcome.peak,
            violation_level: vl,
            model: result.model,
        };
        match self.violations.on_flag(&flag) {
            Ok(_) => {}
            Err(ActionError::EmptyCommand) => {
                log::warn!("[Penalty] Empty punishment configured for VL {}", vl)
            }
            Err(e) => log::debug!("[Penalty] No punishment for {}: {}", flag.player_name, e),
        }
    }

    // ========================================================================
    // TIMERS / CONFIG
    // ========================================================================

    fn restart_decay(&mut self) {
        let decay = self.config.vl_decay.clone();
        if !decay.enabled || decay.amount == 0 {
            self.decay_task.stop();
            return;
        }

        let tx = self.messages_tx.clone();
        let amount = decay.amount;
        self.decay_task.start(
            &self.runtime,
            Duration::from_secs(decay.interval_secs.max(1)),
            move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(EngineMessage::DecayViolations { amount });
                }
            },
        );
    }

    fn report_online(&self) {
        if let Some(backend) = self.backend.as_ref() {
            backend.set_online_players(self.players.len());
        }
    }

    /// Swap configuration. Window shape changes rebuild every player's state
    /// (buffers kept, in-flight results become stale); timers restart.
    pub fn reload(&mut self, config: DetectionConfig) {
        let config = config.sanitize();
        let reshape = config.sequence != self.config.sequence
            || config.step != self.config.step
            || config.default_granularity != self.config.default_granularity;

        self.scorer.set_config(config.buffer.clone());
        self.violations.apply_config(&config);
        self.alerts.apply_config(&config);

        if reshape {
            for state in self.players.values_mut() {
                let mut fresh =
                    PlayerDetectionState::new(state.player_name(), config.sequence, config.step)
                        .with_default_granularity(config.default_granularity);
                fresh.set_buffer(state.buffer());
                *state = fresh;
            }
        }

        self.config = config;
        self.restart_decay();
        log::info!("Detection configuration reloaded ({} players)", self.players.len());
    }

    /// Stop timers, abandon in-flight work and close the inference client
    pub async fn shutdown(&mut self) {
        self.decay_task.stop();
        for state in self.players.values_mut() {
            state.full_reset();
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.shutdown();
        }
        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        self.backend = None;
        self.players.clear();
        while self.messages_rx.try_recv().is_ok() {}
        log::info!("Detection engine shut down");
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player(&self, player: &Uuid) -> Option<&PlayerDetectionState> {
        self.players.get(player)
    }

    pub fn snapshot(&self, player: &Uuid) -> Option<PlayerSnapshot> {
        self.players.get(player).map(|state| self.build_snapshot(*player, state))
    }

    /// Every player, ordered by name
    pub fn snapshots(&self) -> Vec<PlayerSnapshot> {
        let mut all: Vec<PlayerSnapshot> = self
            .players
            .iter()
            .map(|(uuid, state)| self.build_snapshot(*uuid, state))
            .collect();
        all.sort_by(|a, b| a.player_name.cmp(&b.player_name));
        all
    }

    /// Players with any result, highest buffer first
    pub fn suspects(&self, limit: usize) -> Vec<PlayerSnapshot> {
        let mut suspects: Vec<PlayerSnapshot> = self
            .snapshots()
            .into_iter()
            .filter(|s| !s.probability_history.is_empty())
            .collect();
        suspects.sort_by(|a, b| {
            b.buffer
                .total_cmp(&a.buffer)
                .then(b.average_probability.total_cmp(&a.average_probability))
        });
        suspects.truncate(limit);
        suspects
    }

    fn build_snapshot(&self, uuid: Uuid, state: &PlayerDetectionState) -> PlayerSnapshot {
        PlayerSnapshot {
            player_uuid: uuid,
            player_name: state.player_name().to_string(),
            buffer: state.buffer(),
            last_probability: state.last_probability(),
            average_probability: state.average_probability(),
            probability_history: state.probability_history(),
            high_probability_detections: state.high_probability_detections(),
            violation_level: self.violations.violation_level(&uuid),
            window_state: state.window_state(),
            window_len: state.window_len(),
            in_combat: state.is_in_combat(),
            pending: state.is_pending(),
        }
    }

    pub fn violation_level(&self, player: &Uuid) -> u32 {
        self.violations.violation_level(player)
    }

    pub fn violations(&self) -> &ViolationManager {
        &self.violations
    }

    pub fn violations_mut(&mut self) -> &mut ViolationManager {
        &mut self.violations
    }

    pub fn alerts_mut(&mut self) -> &mut AlertManager {
        &mut self.alerts
    }

    pub fn kick_history(&self) -> Vec<KickRecord> {
        self.violations.kick_history()
    }
}
