//! Inference - remote model service over a streaming hub connection
//!
//! - `wire`: packed little-endian f32 feature batches
//! - `hub`: hub framing and request/response DTOs
//! - `transport`: WebSocket connection with invocation routing
//! - `session`: authenticated session (Connect/Heartbeat/ReportStats/predictStream)
//! - `heartbeat`: liveness checks with failure tolerance
//! - `client`: reconnecting supervisor, the backend used by detection

pub mod client;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod session;
pub mod transport;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::logic::features::FeatureTuple;

// Re-export common types
pub use client::{Backoff, ClientConfig, InferenceClient};
pub use error::{InferenceError, InferenceResult};
pub use heartbeat::{HeartbeatLoss, HeartbeatMonitor, HeartbeatScheduler, HeartbeatVerdict};
pub use hub::PredictResult;
pub use session::{plugin_fingerprint, ConnectionState, InferenceSession, SessionSnapshot};
pub use transport::{HubConnector, HubStream, HubTransport, WebSocketConnector, WebSocketTransport};
pub use wire::{decode_batch, encode_batch, WireError};

/// Where detection sends its windows
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Submit one window; results arrive on the returned channel, which
    /// closes when the stream is finished.
    async fn predict_stream(
        &self,
        batch: Vec<FeatureTuple>,
        player_uuid: Uuid,
        player_name: String,
    ) -> mpsc::Receiver<PredictResult>;

    /// Connected, authenticated and not over the online limit
    fn is_available(&self) -> bool;

    fn set_online_players(&self, _count: usize) {}
}
