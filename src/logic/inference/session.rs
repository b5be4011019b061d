//! Inference Session
//!
//! An authenticated session on top of one hub transport: `Connect`,
//! `Heartbeat`, `ReportStats` and the streaming `predictStream` call.
//! A session never holds per-player state; every predict call is independent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::constants::{
    APP_VERSION, CONNECT_TIMEOUT_SECS, HEARTBEAT_TIMEOUT_SECS, PREDICT_TIMEOUT_SECS,
    REPORT_STATS_TIMEOUT_SECS,
};
use crate::logging::redact;
use crate::logic::features::{layout_hash, FeatureTuple};
use super::error::{is_session_expired, InferenceError, InferenceResult};
use super::hub::{
    methods, ConnectRequest, ConnectResponse, HeartbeatResponse, PredictRequest, PredictResult,
    ReportStatsRequest, ReportStatsResponse,
};
use super::transport::{HubStream, HubTransport};
use super::wire::encode_batch;

/// Results buffered per predict call
const RESULT_BUFFER: usize = 8;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected but a heartbeat failed or the server limit is exceeded
    Degraded,
}

/// Read-only view of the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub valid: bool,
    pub last_heartbeat_success: Option<DateTime<Utc>>,
    pub last_server_time: i64,
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    valid: bool,
    last_heartbeat_success: Option<DateTime<Utc>>,
    last_server_time: i64,
}

/// Outcome of ReportStats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub limit_exceeded: bool,
    pub max_online: u32,
}

static FINGERPRINT: Lazy<String> = Lazy::new(compute_fingerprint);

/// Identity hash sent on Connect: crate name, version and feature layout
pub fn plugin_fingerprint() -> String {
    FINGERPRINT.clone()
}

fn compute_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_NAME").as_bytes());
    hasher.update([0u8]);
    hasher.update(APP_VERSION.as_bytes());
    hasher.update([0u8]);
    hasher.update(layout_hash().to_le_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// SESSION
// ============================================================================

pub struct InferenceSession {
    transport: Arc<dyn HubTransport>,
    state: RwLock<SessionState>,
    predict_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl InferenceSession {
    /// Call `Connect` on an open transport.
    /// Bad credentials → `Authentication`; no reply in time → `Timeout`;
    /// anything else → `Session`.
    pub async fn establish(
        transport: Arc<dyn HubTransport>,
        api_key: &str,
        fingerprint: &str,
    ) -> InferenceResult<Self> {
        let bound = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        Self::establish_within(transport, api_key, fingerprint, bound).await
    }

    /// [`establish`](Self::establish) with an explicit bound on the Connect reply
    pub async fn establish_within(
        transport: Arc<dyn HubTransport>,
        api_key: &str,
        fingerprint: &str,
        bound: Duration,
    ) -> InferenceResult<Self> {
        let request = ConnectRequest {
            api_key: api_key.to_string(),
            plugin_hash: fingerprint.to_string(),
            plugin_version: APP_VERSION.to_string(),
        };
        log::debug!(
            "[Inference] Connect api_key={} plugin_hash={} version={}",
            redact(api_key),
            redact(fingerprint),
            APP_VERSION
        );

        let argument = serde_json::to_value(&request)
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;
        let raw = timeout(bound, transport.invoke(methods::CONNECT, vec![argument]))
            .await
            .map_err(|_| InferenceError::Timeout(bound.as_millis() as u64))?
            .map_err(|e| match e {
                InferenceError::Authentication(_) => e,
                other => InferenceError::Session(format!("session creation failed: {}", other)),
            })?;

        let response: ConnectResponse = serde_json::from_value(raw)
            .map_err(|e| InferenceError::Session(format!("bad Connect reply: {}", e)))?;
        if response.session_id.is_empty() {
            return Err(InferenceError::Session("empty session id received".to_string()));
        }

        log::info!("[Inference] Session created: {}", redact(&response.session_id));

        Ok(Self {
            transport,
            state: RwLock::new(SessionState {
                session_id: Some(response.session_id),
                valid: true,
                last_heartbeat_success: Some(Utc::now()),
                last_server_time: response.server_time,
            }),
            predict_timeout: Duration::from_secs(PREDICT_TIMEOUT_SECS),
            heartbeat_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
        })
    }

    /// Override the predict bound
    pub fn with_predict_timeout(mut self, bound: Duration) -> Self {
        self.predict_timeout = bound;
        self
    }

    pub fn with_heartbeat_timeout(mut self, bound: Duration) -> Self {
        self.heartbeat_timeout = bound;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().valid && self.transport.is_open()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read();
        SessionSnapshot {
            session_id: state.session_id.as_deref().map(redact),
            valid: state.valid,
            last_heartbeat_success: state.last_heartbeat_success,
            last_server_time: state.last_server_time,
        }
    }

    pub fn transport(&self) -> &Arc<dyn HubTransport> {
        &self.transport
    }

    fn invalidate(&self) {
        self.state.write().valid = false;
    }

    /// Liveness check, returns server time
    pub async fn heartbeat(&self) -> InferenceResult<i64> {
        if !self.is_valid() {
            return Err(InferenceError::NotConnected);
        }

        let bound = self.heartbeat_timeout;
        let raw = match timeout(bound, self.transport.invoke(methods::HEARTBEAT, vec![])).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                if is_session_expired(&e) {
                    self.invalidate();
                }
                return Err(e);
            }
            Err(_) => return Err(InferenceError::Timeout(bound.as_millis() as u64)),
        };

        let response: HeartbeatResponse = serde_json::from_value(raw)
            .map_err(|e| InferenceError::Protocol(format!("bad Heartbeat reply: {}", e)))?;
        let mut state = self.state.write();
        state.last_server_time = response.server_time;
        state.last_heartbeat_success = Some(Utc::now());
        Ok(response.server_time)
    }

    /// Report the online player count, bounded by the stats timeout
    pub async fn report_stats(&self, online_players: u32) -> InferenceResult<StatsReport> {
        if !self.is_valid() {
            return Err(InferenceError::NotConnected);
        }

        let argument = serde_json::to_value(ReportStatsRequest { online_players })
            .map_err(|e| InferenceError::Protocol(e.to_string()))?;
        let bound = Duration::from_secs(REPORT_STATS_TIMEOUT_SECS);

        let raw = match timeout(bound, self.transport.invoke(methods::REPORT_STATS, vec![argument])).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                if is_session_expired(&e) {
                    self.invalidate();
                }
                return Err(e);
            }
            Err(_) => return Err(InferenceError::Timeout(bound.as_millis() as u64)),
        };

        let response: ReportStatsResponse = serde_json::from_value(raw)
            .map_err(|e| InferenceError::Protocol(format!("bad ReportStats reply: {}", e)))?;
        Ok(StatsReport {
            limit_exceeded: response.limit_exceeded,
            max_online: response.max_online,
        })
    }

    /// Submit one window and stream back validated results.
    /// The stream ends after the server completes it, on error, or on timeout.
    pub async fn predict_stream(
        &self,
        batch: &[FeatureTuple],
        player_uuid: Uuid,
        player_name: &str,
    ) -> mpsc::Receiver<PredictResult> {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);

        if !self.is_valid() {
            let _ = tx.try_send(PredictResult::from_error(&InferenceError::NotConnected));
            return rx;
        }

        let request = PredictRequest {
            player_data: STANDARD.encode(encode_batch(batch)),
            player_uuid: player_uuid.to_string(),
            player_name: player_name.to_string(),
        };
        let argument = match serde_json::to_value(&request) {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.try_send(PredictResult::from_error(&InferenceError::Protocol(e.to_string())));
                return rx;
            }
        };

        let stream = match self.transport.stream(methods::PREDICT_STREAM, vec![argument]).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.try_send(PredictResult::from_error(&e));
                return rx;
            }
        };

        tokio::spawn(forward_results(self.transport.clone(), stream, tx, self.predict_timeout));
        rx
    }
}

/// Convert raw stream items until the stream ends or the deadline passes.
/// A stream abandoned early (deadline, consumer gone) is cancelled on the hub.
async fn forward_results(
    transport: Arc<dyn HubTransport>,
    stream: HubStream,
    tx: mpsc::Sender<PredictResult>,
    bound: Duration,
) {
    let HubStream { invocation_id, mut items } = stream;
    let deadline = tokio::time::Instant::now() + bound;
    loop {
        let next = match tokio::time::timeout_at(deadline, items.recv()).await {
            Ok(next) => next,
            Err(_) => {
                log::debug!("[Inference] predictStream {} timed out after {:?}", invocation_id, bound);
                transport.cancel(&invocation_id).await;
                let err = InferenceError::Timeout(bound.as_millis() as u64);
                let _ = tx.send(PredictResult::from_error(&err)).await;
                return;
            }
        };

        let result = match next {
            Some(Ok(item)) => PredictResult::from_item(item),
            Some(Err(e)) => PredictResult::from_error(&e),
            None => return,
        };
        if tx.send(result).await.is_err() {
            transport.cancel(&invocation_id).await;
            return;
        }
    }
}

/// Heartbeat target
#[async_trait]
pub trait HeartbeatTarget: Send + Sync {
    async fn heartbeat(&self) -> InferenceResult<i64>;
}

#[async_trait]
impl HeartbeatTarget for InferenceSession {
    async fn heartbeat(&self) -> InferenceResult<i64> {
        InferenceSession::heartbeat(self).await
    }
}
