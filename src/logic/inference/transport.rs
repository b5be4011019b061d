//! Hub Transport - WebSocket connection to the inference hub
//!
//! `HubTransport` is the seam between the session logic and the socket: a
//! request/response `invoke`, a cancellable `stream`, and close notification.
//! `WebSocketTransport` implements it over tokio-tungstenite with a reader
//! task that routes frames by invocation id and a writer task that owns the
//! sink and sends keep-alive pings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::logic::config::Endpoint;
use super::error::{parse_hub_error, InferenceError, InferenceResult};
use super::hub::{
    check_handshake_response, handshake_frame, parse_frames, split_frames, HubMessage,
    NegotiateResponse, HANDSHAKE_TIMEOUT_SECS, KEEP_ALIVE_INTERVAL_SECS, SERVER_TIMEOUT_SECS,
};

/// Items buffered per open stream
const STREAM_BUFFER: usize = 16;

// ============================================================================
// TRAITS
// ============================================================================

/// Open streaming invocation
#[derive(Debug)]
pub struct HubStream {
    /// Id to pass to [`HubTransport::cancel`]
    pub invocation_id: String,
    pub items: mpsc::Receiver<InferenceResult<Value>>,
}

/// One open hub connection
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Invoke a hub method and wait for its completion
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> InferenceResult<Value>;

    /// Start a streaming invocation
    async fn stream(&self, target: &str, arguments: Vec<Value>) -> InferenceResult<HubStream>;

    /// Abandon an open stream: forget it locally and tell the server to stop.
    /// Unknown or finished ids are ignored.
    async fn cancel(&self, invocation_id: &str);

    /// Close the connection; pending calls fail with `Closed`
    async fn close(&self);

    fn is_open(&self) -> bool;

    /// Resolves once the connection is gone, with the close reason
    async fn closed(&self) -> String;
}

/// Opens new hub connections (used again on every reconnect)
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(&self) -> InferenceResult<Arc<dyn HubTransport>>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// Connector for a real hub endpoint
pub struct WebSocketConnector {
    endpoint: Endpoint,
    hub_path: String,
    negotiate: bool,
    http: reqwest::Client,
}

impl WebSocketConnector {
    pub fn new(endpoint: Endpoint, hub_path: impl Into<String>, negotiate: bool) -> Self {
        Self {
            endpoint,
            hub_path: hub_path.into(),
            negotiate,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    /// POST the negotiate endpoint and return the connection token
    async fn negotiate(&self) -> InferenceResult<Option<String>> {
        let url = self.endpoint.negotiate_url(&self.hub_path);
        log::debug!("[Inference] Negotiating at {}", url);

        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(format!("negotiate failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(InferenceError::Transport(format!(
                "negotiate returned HTTP {}",
                response.status()
            )));
        }

        let body: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Protocol(format!("bad negotiate body: {}", e)))?;

        if let Some(error) = body.error.as_deref() {
            return Err(InferenceError::Session(format!("negotiate rejected: {}", error)));
        }
        Ok(body.token().map(str::to_string))
    }
}

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn connect(&self) -> InferenceResult<Arc<dyn HubTransport>> {
        let token = if self.negotiate { self.negotiate().await? } else { None };
        let url = self.endpoint.hub_url(&self.hub_path, token.as_deref());
        let transport = WebSocketTransport::connect(&url).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum PendingCall {
    Invoke(oneshot::Sender<InferenceResult<Value>>),
    Stream(mpsc::Sender<InferenceResult<Value>>),
}

type PendingMap = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Removes an invoke entry when the caller stops waiting (timeout, drop)
struct PendingEntry<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Open hub connection over WebSocket
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    closed_rx: watch::Receiver<Option<String>>,
}

impl WebSocketTransport {
    /// Connect, run the handshake and start the reader/writer tasks
    pub async fn connect(url: &str) -> InferenceResult<Self> {
        let bound = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

        let (mut ws, _response) = timeout(bound, connect_async(url))
            .await
            .map_err(|_| InferenceError::Timeout(bound.as_millis() as u64))?
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        ws.send(Message::Text(handshake_frame()))
            .await
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        let leftover = timeout(bound, read_handshake(&mut ws))
            .await
            .map_err(|_| InferenceError::Timeout(bound.as_millis() as u64))??;

        log::info!("[Inference] Hub connection established");
        Ok(Self::spawn(ws, leftover))
    }

    fn spawn(ws: WsStream, leftover: Option<String>) -> Self {
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(
            stream,
            leftover,
            pending.clone(),
            outbound_tx.clone(),
            open.clone(),
            closed_tx,
        ));

        Self {
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            open,
            closed_rx,
        }
    }

    fn next_invocation_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn send(&self, message: &HubMessage) -> InferenceResult<()> {
        if !self.is_open() {
            return Err(InferenceError::Closed);
        }
        self.outbound
            .send(Message::Text(message.to_frame()))
            .map_err(|_| InferenceError::Closed)
    }
}

#[async_trait]
impl HubTransport for WebSocketTransport {
    async fn invoke(&self, target: &str, arguments: Vec<Value>) -> InferenceResult<Value> {
        let id = self.next_invocation_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), PendingCall::Invoke(tx));

        let message = HubMessage::Invocation {
            invocation_id: Some(id.clone()),
            target: target.to_string(),
            arguments,
        };
        let _entry = PendingEntry { pending: &self.pending, id };
        self.send(&message)?;

        rx.await.unwrap_or(Err(InferenceError::Closed))
    }

    async fn stream(&self, target: &str, arguments: Vec<Value>) -> InferenceResult<HubStream> {
        let id = self.next_invocation_id();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.pending.lock().insert(id.clone(), PendingCall::Stream(tx));

        let message = HubMessage::StreamInvocation {
            invocation_id: id.clone(),
            target: target.to_string(),
            arguments,
        };
        if let Err(e) = self.send(&message) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        Ok(HubStream { invocation_id: id, items: rx })
    }

    async fn cancel(&self, invocation_id: &str) {
        {
            let mut pending = self.pending.lock();
            if !matches!(pending.get(invocation_id), Some(PendingCall::Stream(_))) {
                return;
            }
            pending.remove(invocation_id);
        }
        log::debug!("[Inference] Cancelling stream {}", invocation_id);
        let cancel = HubMessage::CancelInvocation { invocation_id: invocation_id.to_string() };
        let _ = self.send(&cancel);
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let close = HubMessage::Close { error: None, allow_reconnect: false };
            let _ = self.outbound.send(Message::Text(close.to_frame()));
            let _ = self.outbound.send(Message::Close(None));
            fail_pending(&self.pending);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            let current = rx.borrow().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "connection closed".to_string();
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }
}

// ============================================================================
// TASKS
// ============================================================================

/// Wait for the handshake reply; returns any frames that followed it
async fn read_handshake(ws: &mut WsStream) -> InferenceResult<Option<String>> {
    while let Some(message) = ws.next().await {
        let text = match message.map_err(|e| InferenceError::Transport(e.to_string()))? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let mut frames = split_frames(&text);
        let Some(first) = frames.next() else { continue };
        check_handshake_response(first)?;

        let rest: Vec<&str> = frames.collect();
        if rest.is_empty() {
            return Ok(None);
        }
        let mut leftover = rest.join("\u{1e}");
        leftover.push('\u{1e}');
        return Ok(Some(leftover));
    }
    Err(InferenceError::Session("connection closed during handshake".to_string()))
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let period = Duration::from_secs(KEEP_ALIVE_INTERVAL_SECS);
    let mut keep_alive = interval_at(Instant::now() + period, period);

    loop {
        let message = tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = keep_alive.tick() => Message::Text(HubMessage::Ping.to_frame()),
        };

        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            log::debug!("[Inference] Socket write failed: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    leftover: Option<String>,
    pending: PendingMap,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    closed_tx: watch::Sender<Option<String>>,
) {
    if let Some(text) = leftover {
        dispatch(&text, &pending, &outbound);
    }

    let server_timeout = Duration::from_secs(SERVER_TIMEOUT_SECS);
    let reason = loop {
        let next = match timeout(server_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => break format!("no frame from server for {}s", SERVER_TIMEOUT_SECS),
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let Some(reason) = dispatch(&text, &pending, &outbound) {
                    break reason;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| format!("closed by server: {}", f.reason))
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("socket error: {}", e),
            None => break "socket ended".to_string(),
        }
    };

    let was_open = open.swap(false, Ordering::SeqCst);
    if was_open {
        log::warn!("[Inference] Hub connection lost: {}", reason);
    }
    fail_pending(&pending);
    let _ = outbound.send(Message::Close(None));
    let _ = closed_tx.send(Some(reason));
}

/// Route frames to their callers. Returns a reason when the server closed the hub.
fn dispatch(
    text: &str,
    pending: &PendingMap,
    outbound: &mpsc::UnboundedSender<Message>,
) -> Option<String> {
    for frame in parse_frames(text) {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[Inference] Dropping frame: {}", e);
                continue;
            }
        };

        match message {
            HubMessage::Completion { invocation_id, result, error } => {
                let Some(call) = pending.lock().remove(&invocation_id) else {
                    log::debug!("[Inference] Completion for unknown invocation {}", invocation_id);
                    continue;
                };
                let outcome = match error {
                    Some(error) => Err(parse_hub_error(&error)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                match call {
                    PendingCall::Invoke(tx) => {
                        let _ = tx.send(outcome);
                    }
                    PendingCall::Stream(tx) => {
                        // Normal end of stream closes the channel; errors are delivered first
                        if let Err(e) = outcome {
                            let _ = tx.try_send(Err(e));
                        }
                    }
                }
            }
            HubMessage::StreamItem { invocation_id, item } => {
                let sender = match pending.lock().get(&invocation_id) {
                    Some(PendingCall::Stream(tx)) => tx.clone(),
                    _ => continue,
                };
                if sender.try_send(Ok(item)).is_err() {
                    // Consumer went away or is not keeping up
                    pending.lock().remove(&invocation_id);
                    let cancel = HubMessage::CancelInvocation { invocation_id };
                    let _ = outbound.send(Message::Text(cancel.to_frame()));
                }
            }
            HubMessage::Ping => {}
            HubMessage::Close { error, .. } => {
                return Some(error.unwrap_or_else(|| "server closed the hub".to_string()));
            }
            HubMessage::Invocation { target, .. } | HubMessage::StreamInvocation { target, .. } => {
                log::debug!("[Inference] Ignoring server invocation '{}'", target);
            }
            HubMessage::CancelInvocation { .. } => {}
        }
    }
    None
}

fn fail_pending(pending: &PendingMap) {
    let calls: Vec<PendingCall> = pending.lock().drain().map(|(_, call)| call).collect();
    for call in calls {
        match call {
            PendingCall::Invoke(tx) => {
                let _ = tx.send(Err(InferenceError::Closed));
            }
            PendingCall::Stream(tx) => {
                let _ = tx.try_send(Err(InferenceError::Closed));
            }
        }
    }
}
