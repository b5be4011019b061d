//! Inference Client - connection supervisor
//!
//! Owns the current session and keeps it alive:
//! - connects with exponential backoff and jitter (auth failures stop the loop)
//! - runs the heartbeat and the stats report on restartable timers
//! - replaces the session when the transport closes or the heartbeat gives up
//! - emits ConnectionLost / ConnectionRestored / AuthenticationFailed events,
//!   plus one ConnectionFailing per streak of failed connects

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::{CONNECT_FAILURE_ALERT_ATTEMPTS, SHUTDOWN_TIMEOUT_SECS};
use crate::logic::config::{ConfigError, DetectionConfig};
use crate::logic::events::EventEmitter;
use crate::logic::features::FeatureTuple;
use crate::logic::scheduler::PeriodicTask;
use super::error::InferenceError;
use super::heartbeat::{HeartbeatLoss, HeartbeatScheduler, HeartbeatVerdict};
use super::hub::PredictResult;
use super::session::{plugin_fingerprint, ConnectionState, InferenceSession, SessionSnapshot};
use super::transport::{HubConnector, WebSocketConnector};
use super::InferenceBackend;

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponential backoff with symmetric jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Fraction of the delay added or removed at random (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn nominal(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max {
                return self.max;
            }
        }
        delay.min(self.max)
    }

    /// Delay with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(nominal * factor)
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub fingerprint: String,
    pub heartbeat_interval: Duration,
    pub stats_interval: Duration,
    pub backoff: Backoff,
}

impl ClientConfig {
    pub fn from_detection(config: &DetectionConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            fingerprint: plugin_fingerprint(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            stats_interval: Duration::from_secs(config.report_stats_interval_secs),
            backoff: Backoff::default(),
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Why the current session ended
#[derive(Debug, Clone)]
enum Disruption {
    Lost(String),
    Expired(String),
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn HubConnector>,
    events: EventEmitter,
    runtime: Handle,

    session: RwLock<Option<Arc<InferenceSession>>>,
    state: RwLock<ConnectionState>,
    limit_exceeded: AtomicBool,
    online_players: AtomicU32,
    auth_failed: AtomicBool,

    heartbeat: Mutex<HeartbeatScheduler>,
    stats: Mutex<PeriodicTask>,
    disruption_tx: mpsc::UnboundedSender<Disruption>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared handle to the inference service
#[derive(Clone)]
pub struct InferenceClient {
    shared: Arc<Shared>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
    disruption_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Disruption>>>>,
}

impl InferenceClient {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn HubConnector>,
        events: EventEmitter,
        runtime: Handle,
    ) -> Self {
        let (disruption_tx, disruption_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                events,
                runtime,
                session: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                limit_exceeded: AtomicBool::new(false),
                online_players: AtomicU32::new(0),
                auth_failed: AtomicBool::new(false),
                heartbeat: Mutex::new(HeartbeatScheduler::new()),
                stats: Mutex::new(PeriodicTask::new("report-stats")),
                disruption_tx,
                shutdown_tx,
            }),
            supervisor: Arc::new(Mutex::new(None)),
            disruption_rx: Arc::new(Mutex::new(Some(disruption_rx))),
        }
    }

    /// Client for a configured WebSocket endpoint
    pub fn from_config(
        config: &DetectionConfig,
        events: EventEmitter,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        let endpoint = config.validate_endpoint()?;
        let connector = WebSocketConnector::new(endpoint, config.hub_path.clone(), config.negotiate);
        Ok(Self::new(
            ClientConfig::from_detection(config),
            Arc::new(connector),
            events,
            runtime,
        ))
    }

    /// Spawn the supervisor. Calling again while running is a no-op.
    pub fn start(&self) {
        let Some(disruptions) = self.disruption_rx.lock().take() else {
            log::debug!("[Inference] Client already started");
            return;
        };
        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown_tx.subscribe();
        let handle = self.shared.runtime.spawn(supervise(shared, disruptions, shutdown));
        *self.supervisor.lock() = Some(handle);
    }

    /// Stop timers, close the session, bounded by the shutdown timeout
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        self.shared.heartbeat.lock().stop();
        self.shared.stats.lock().stop();

        let session = self.shared.session.write().take();
        if let Some(session) = session {
            let bound = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
            if tokio::time::timeout(bound, session.transport().close()).await.is_err() {
                log::warn!("[Inference] Session close abandoned after {:?}", bound);
            }
        }

        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        *self.shared.state.write() = ConnectionState::Disconnected;
        log::info!("[Inference] Client shut down");
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    pub fn session(&self) -> Option<SessionSnapshot> {
        self.shared.session.read().as_ref().map(|s| s.snapshot())
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.shared.limit_exceeded.load(Ordering::SeqCst)
    }

    /// Bad credentials stopped the supervisor
    pub fn is_authentication_failed(&self) -> bool {
        self.shared.auth_failed.load(Ordering::SeqCst)
    }

    fn current_session(&self) -> Option<Arc<InferenceSession>> {
        self.shared.session.read().clone()
    }
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    async fn predict_stream(
        &self,
        batch: Vec<FeatureTuple>,
        player_uuid: Uuid,
        player_name: String,
    ) -> mpsc::Receiver<PredictResult> {
        match self.current_session() {
            Some(session) => session.predict_stream(&batch, player_uuid, &player_name).await,
            None => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(PredictResult::from_error(&InferenceError::NotConnected));
                rx
            }
        }
    }

    fn is_available(&self) -> bool {
        let connected = matches!(
            self.connection_state(),
            ConnectionState::Connected | ConnectionState::Degraded
        );
        connected
            && !self.is_limit_exceeded()
            && self.current_session().is_some_and(|s| s.is_valid())
    }

    fn set_online_players(&self, count: usize) {
        self.shared
            .online_players
            .store(count.min(u32::MAX as usize) as u32, Ordering::SeqCst);
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

async fn supervise(
    shared: Arc<Shared>,
    mut disruptions: mpsc::UnboundedReceiver<Disruption>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnecting = false;

    loop {
        let Some(session) = connect_with_backoff(&shared, &mut shutdown).await else {
            return;
        };

        if reconnecting {
            log::info!("[Inference] Connection re-established");
            shared.events.emit_connection_restored(session.snapshot().session_id.unwrap_or_default());
        }
        install(&shared, session.clone());

        let disruption = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            reason = session.transport().closed() => Disruption::Lost(reason),
            next = disruptions.recv() => match next {
                Some(d) => d,
                None => return,
            },
        };

        // Drop anything queued by the old session
        while disruptions.try_recv().is_ok() {}

        let reason = match &disruption {
            Disruption::Lost(r) => r.clone(),
            Disruption::Expired(r) => format!("session expired: {}", r),
        };
        log::warn!("[Inference] Connection lost: {}", reason);

        teardown(&shared).await;
        shared.events.emit_connection_lost(reason);
        reconnecting = true;
    }
}

/// Retry until connected; `None` on shutdown or bad credentials
async fn connect_with_backoff(
    shared: &Arc<Shared>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Arc<InferenceSession>> {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return None;
        }
        *shared.state.write() = ConnectionState::Connecting;

        match connect_once(shared).await {
            Ok(session) => return Some(Arc::new(session)),
            Err(InferenceError::Authentication(message)) => {
                log::error!("[Inference] Authentication failed: {}", message);
                shared.auth_failed.store(true, Ordering::SeqCst);
                *shared.state.write() = ConnectionState::Disconnected;
                shared.events.emit_authentication_failed(message);
                return None;
            }
            Err(e) => {
                let delay = shared.config.backoff.delay(attempt);
                log::warn!(
                    "[Inference] Connect attempt {} failed: {}; retrying in {:.1}s",
                    attempt + 1,
                    e,
                    delay.as_secs_f64()
                );
                *shared.state.write() = ConnectionState::Disconnected;
                attempt = attempt.saturating_add(1);

                if attempt == CONNECT_FAILURE_ALERT_ATTEMPTS {
                    log::error!(
                        "[Inference] Inference service unreachable after {} attempts: {}",
                        attempt,
                        e
                    );
                    shared.events.emit_connection_failing(attempt, e.to_string());
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return None,
                }
            }
        }
    }
}

async fn connect_once(shared: &Arc<Shared>) -> Result<InferenceSession, InferenceError> {
    let transport = shared.connector.connect().await?;
    InferenceSession::establish(transport, &shared.config.api_key, &shared.config.fingerprint).await
}

/// Make a fresh session current and start its timers
fn install(shared: &Arc<Shared>, session: Arc<InferenceSession>) {
    *shared.session.write() = Some(session.clone());
    shared.limit_exceeded.store(false, Ordering::SeqCst);
    *shared.state.write() = ConnectionState::Connected;
    log::info!("[Inference] Connected to inference service");

    let loss_tx = shared.disruption_tx.clone();
    let on_loss = Arc::new(move |loss: HeartbeatLoss| {
        let disruption = match loss {
            HeartbeatLoss::ConnectionLost(r) => Disruption::Lost(r),
            HeartbeatLoss::SessionExpired(r) => Disruption::Expired(r),
        };
        let _ = loss_tx.send(disruption);
    });

    let weak = Arc::downgrade(shared);
    let on_verdict: Arc<dyn Fn(&HeartbeatVerdict) + Send + Sync> = Arc::new(move |verdict: &HeartbeatVerdict| {
        let Some(shared) = weak.upgrade() else { return };
        let mut state = shared.state.write();
        match verdict {
            HeartbeatVerdict::Healthy if !shared.limit_exceeded.load(Ordering::SeqCst) => {
                *state = ConnectionState::Connected;
            }
            HeartbeatVerdict::Tolerated { .. } => *state = ConnectionState::Degraded,
            _ => {}
        }
    });

    shared.heartbeat.lock().start(
        &shared.runtime,
        shared.config.heartbeat_interval,
        session.clone(),
        on_loss,
        Some(on_verdict),
    );

    let weak = Arc::downgrade(shared);
    shared.stats.lock().start(&shared.runtime, shared.config.stats_interval, move || {
        let weak = weak.clone();
        async move {
            let Some(shared) = weak.upgrade() else { return };
            report_stats(&shared).await;
        }
    });
}

async fn report_stats(shared: &Arc<Shared>) {
    let current = shared.session.read().clone();
    let Some(session) = current else { return };
    let online = shared.online_players.load(Ordering::SeqCst);

    match session.report_stats(online).await {
        Ok(report) => {
            let was = shared.limit_exceeded.swap(report.limit_exceeded, Ordering::SeqCst);
            if report.limit_exceeded && !was {
                log::warn!(
                    "[Inference] Online limit exceeded ({} > {}), detection paused",
                    online,
                    report.max_online
                );
                *shared.state.write() = ConnectionState::Degraded;
            } else if !report.limit_exceeded && was {
                log::info!("[Inference] Online limit cleared, detection resumed");
                *shared.state.write() = ConnectionState::Connected;
            }
        }
        Err(e) => log::debug!("[Inference] ReportStats failed: {}", e),
    }
}

/// Stop timers and close the old session
async fn teardown(shared: &Arc<Shared>) {
    shared.heartbeat.lock().stop();
    shared.stats.lock().stop();
    *shared.state.write() = ConnectionState::Disconnected;

    let old = shared.session.write().take();
    if let Some(old) = old {
        let bound = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        let _ = tokio::time::timeout(bound, old.transport().close()).await;
    }
}
