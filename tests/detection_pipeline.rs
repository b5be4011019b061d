//! End-to-end detection: rotations in, punishment events out

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use uuid::Uuid;

use mlsac_core::logic::config::ModelConfig;
use mlsac_core::logic::penalty::ActionKind;
use mlsac_core::{
    DetectionConfig, DetectionEngine, DetectionEvent, EventEmitter, FeatureTuple, InferenceBackend,
    PredictResult,
};

/// Answers each window with the next scripted result
struct Scripted {
    replies: Mutex<VecDeque<PredictResult>>,
}

impl Scripted {
    fn new(replies: Vec<PredictResult>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()) })
    }
}

#[async_trait]
impl InferenceBackend for Scripted {
    async fn predict_stream(
        &self,
        _batch: Vec<FeatureTuple>,
        _player_uuid: Uuid,
        _player_name: String,
    ) -> mpsc::Receiver<PredictResult> {
        let (tx, rx) = mpsc::channel(4);
        if let Some(reply) = self.replies.lock().pop_front() {
            let _ = tx.try_send(reply);
        }
        rx
    }

    fn is_available(&self) -> bool {
        true
    }
}

fn result(probability: f64, model: &str) -> PredictResult {
    PredictResult {
        success: true,
        probability,
        inference_time_ms: 5,
        model: Some(model.to_string()),
        error_code: None,
        error_message: None,
    }
}

fn config() -> DetectionConfig {
    let mut config = DetectionConfig::default();
    config.enabled = true;
    config.console_alerts = false;
    config.punishments.insert(1, "kick: kick {PLAYER} AI aim VL {VL}".to_string());
    config
}

/// One full combat window, then let the result land and tick once more
async fn fight(engine: &mut DetectionEngine, player: Uuid) {
    engine.on_attack(player, Uuid::from_u128(500));
    for i in 0..40 {
        engine.on_rotation(player, (i as f32 * 3.7) % 360.0, (i as f32 * 0.4) - 8.0);
        engine.on_tick();
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    engine.on_tick();
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DetectionEvent>) -> Vec<DetectionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_high_probability_kicks() {
    let events = EventEmitter::new();
    let mut rx = events.init();
    let backend = Scripted::new(vec![result(0.9, "v3")]);
    let mut engine = DetectionEngine::new(config(), Some(backend), events, Handle::current());

    let admin = Uuid::from_u128(7);
    let player = Uuid::from_u128(8);
    engine.alerts_mut().enable(admin);
    engine.on_join(player, "Steve");
    fight(&mut engine, player).await;

    let names: Vec<&str> = drain(&mut rx).iter().map(DetectionEvent::name).collect();
    assert_eq!(
        names,
        vec![
            "detection:flag",
            "detection:alert",
            "penalty:punishment",
            "penalty:kick-recorded"
        ]
    );

    assert_eq!(engine.violation_level(&player), 1);
    let kicks = engine.kick_history();
    assert_eq!(kicks.len(), 1);
    assert_eq!(kicks[0].player_name, "Steve");
    assert_eq!(kicks[0].vl, 1);
    assert!((kicks[0].probability - 0.9).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_punishment_command_rendered() {
    let events = EventEmitter::new();
    let mut rx = events.init();
    let backend = Scripted::new(vec![result(0.95, "v3")]);
    let mut engine = DetectionEngine::new(config(), Some(backend), events, Handle::current());

    let player = Uuid::from_u128(9);
    engine.on_join(player, "Alex");
    fight(&mut engine, player).await;

    let order = drain(&mut rx)
        .into_iter()
        .find_map(|event| match event {
            DetectionEvent::Punishment(order) => Some(order),
            _ => None,
        })
        .unwrap();
    assert_eq!(order.player_uuid, player);
    assert_eq!(order.action.kind, ActionKind::Kick);
    assert_eq!(order.action.command, "kick Alex AI aim VL 1");
}

#[tokio::test(start_paused = true)]
async fn test_flag_below_punishment_minimum_only_alerts() {
    let events = EventEmitter::new();
    let mut rx = events.init();
    // 0.7 × 100 crosses the flag level but stays under the 0.85 minimum
    let backend = Scripted::new(vec![result(0.7, "v3")]);
    let mut engine = DetectionEngine::new(config(), Some(backend), events, Handle::current());

    let player = Uuid::from_u128(10);
    engine.on_join(player, "Herobrine");
    fight(&mut engine, player).await;

    let names: Vec<&str> = drain(&mut rx).iter().map(DetectionEvent::name).collect();
    assert_eq!(names, vec!["detection:flag", "detection:alert"]);
    assert_eq!(engine.violation_level(&player), 1);
    assert!(engine.kick_history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_alert_only_model_never_punishes() {
    let mut config = config();
    config.models.insert(
        "shadow".to_string(),
        ModelConfig { name: "Shadow".to_string(), only_alert: true },
    );
    let events = EventEmitter::new();
    let mut rx = events.init();
    let backend = Scripted::new(vec![result(0.99, "shadow")]);
    let mut engine = DetectionEngine::new(config, Some(backend), events, Handle::current());

    let player = Uuid::from_u128(11);
    engine.on_join(player, "Notch");
    fight(&mut engine, player).await;

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| !matches!(e, DetectionEvent::Punishment(_))));
    let model = events.iter().find_map(|event| match event {
        DetectionEvent::Alert { model, .. } => Some(model.clone()),
        _ => None,
    });
    assert_eq!(model.as_deref(), Some("Shadow"));
}
