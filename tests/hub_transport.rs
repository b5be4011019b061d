//! Hub transport against an in-process WebSocket hub

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use mlsac_core::logic::inference::{
    decode_batch, HeartbeatLoss, HeartbeatScheduler, HubConnector, HubTransport, InferenceError,
    InferenceSession, WebSocketConnector, WebSocketTransport,
};
use mlsac_core::logic::config::Endpoint;
use mlsac_core::AimProcessor;

const RS: char = '\u{1e}';

#[derive(Clone, Copy)]
enum HubScript {
    /// Answer Connect, Heartbeat and predictStream
    Serve,
    /// Reject Connect with a bad key
    RejectKey,
    /// Answer Connect, then close the hub
    CloseAfterConnect,
    /// Answer Connect, never answer Heartbeat
    SilentHeartbeat,
    /// Answer Connect, never answer predictStream
    SilentPredict,
}

/// Invocation ids the client cancelled
type CancelLog = Arc<Mutex<Vec<String>>>;

fn frame(value: Value) -> Message {
    let mut text = value.to_string();
    text.push(RS);
    Message::Text(text)
}

/// Accept one client and play the script; returns the bound port
async fn spawn_hub(script: HubScript) -> u16 {
    spawn_logging_hub(script).await.0
}

/// Like `spawn_hub`, also recording CancelInvocation frames
async fn spawn_logging_hub(script: HubScript) -> (u16, CancelLog) {
    let cancels: CancelLog = Arc::new(Mutex::new(Vec::new()));
    let cancel_log = cancels.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Handshake
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                assert!(text.contains(r#""protocol":"json""#));
                ws.send(Message::Text(format!("{{}}{}", RS))).await.unwrap();
            }
            other => panic!("expected handshake, got {:?}", other),
        }

        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else { continue };
            for raw in text.split(RS).filter(|f| !f.trim().is_empty()) {
                let value: Value = serde_json::from_str(raw).unwrap();
                let kind = value["type"].as_u64().unwrap();
                let id = value["invocationId"].as_str().unwrap_or_default().to_string();
                let target = value["target"].as_str().unwrap_or_default();

                match (kind, target) {
                    (1, "Connect") => {
                        let key = value["arguments"][0]["apiKey"].as_str().unwrap_or_default();
                        if matches!(script, HubScript::RejectKey) || key.is_empty() {
                            ws.send(frame(json!({
                                "type": 3,
                                "invocationId": id,
                                "error": "INVALID_API_KEY: unknown key"
                            })))
                            .await
                            .unwrap();
                            continue;
                        }
                        ws.send(frame(json!({
                            "type": 3,
                            "invocationId": id,
                            "result": {"sessionId": "s-123456789", "serverTime": 1000}
                        })))
                        .await
                        .unwrap();

                        if matches!(script, HubScript::CloseAfterConnect) {
                            ws.send(frame(json!({"type": 7, "error": "maintenance"})))
                                .await
                                .unwrap();
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                    (1, "Heartbeat") if matches!(script, HubScript::SilentHeartbeat) => {}
                    (1, "Heartbeat") => {
                        ws.send(frame(json!({
                            "type": 3,
                            "invocationId": id,
                            "result": {"serverTime": 2000}
                        })))
                        .await
                        .unwrap();
                    }
                    (4, "predictStream") if matches!(script, HubScript::SilentPredict) => {}
                    (4, "predictStream") => {
                        let data = value["arguments"][0]["playerData"].as_str().unwrap();
                        let bytes = STANDARD.decode(data).unwrap();
                        let ticks = decode_batch(&bytes).unwrap().len();

                        // Two items in one payload, then the completion
                        let mut payload = json!({
                            "type": 2,
                            "invocationId": id,
                            "item": {"probability": 0.25, "inferenceTimeMs": ticks, "model": "v3"}
                        })
                        .to_string();
                        payload.push(RS);
                        payload.push_str(
                            &json!({
                                "type": 2,
                                "invocationId": id,
                                "item": {"probability": 0.97, "inferenceTimeMs": ticks, "model": "v3"}
                            })
                            .to_string(),
                        );
                        payload.push(RS);
                        ws.send(Message::Text(payload)).await.unwrap();
                        ws.send(frame(json!({"type": 3, "invocationId": id})))
                            .await
                            .unwrap();
                    }
                    (5, _) => cancel_log.lock().push(id),
                    (6, _) => {}
                    (7, _) => return,
                    _ => {}
                }
            }
        }
    });

    (port, cancels)
}

async fn connected_session(port: u16) -> (Arc<dyn HubTransport>, InferenceSession) {
    let transport: Arc<dyn HubTransport> = Arc::new(
        WebSocketTransport::connect(&format!("ws://127.0.0.1:{}/hub", port))
            .await
            .unwrap(),
    );
    let session = InferenceSession::establish(transport.clone(), "key-1", "fingerprint")
        .await
        .unwrap();
    (transport, session)
}

fn batch(len: usize) -> Vec<mlsac_core::FeatureTuple> {
    let mut aim = AimProcessor::new();
    (0..len).map(|i| aim.process(i as f32 * 1.5, 0.0)).collect()
}

#[tokio::test]
async fn test_session_over_websocket() {
    let port = spawn_hub(HubScript::Serve).await;
    let transport = WebSocketTransport::connect(&format!("ws://127.0.0.1:{}/hub", port))
        .await
        .unwrap();
    let transport: Arc<dyn HubTransport> = Arc::new(transport);
    assert!(transport.is_open());

    let session = InferenceSession::establish(transport.clone(), "key-1", "fingerprint")
        .await
        .unwrap();
    assert_eq!(session.session_id().as_deref(), Some("s-123456789"));
    assert!(session.is_valid());

    assert_eq!(session.heartbeat().await.unwrap(), 2000);
    assert_eq!(session.snapshot().last_server_time, 2000);

    let mut results = session.predict_stream(&batch(40), Uuid::from_u128(1), "Steve").await;
    let first = results.recv().await.unwrap();
    let second = results.recv().await.unwrap();
    assert!(first.success);
    assert_eq!(first.probability, 0.25);
    assert_eq!(first.inference_time_ms, 40);
    assert_eq!(second.probability, 0.97);
    assert_eq!(second.model.as_deref(), Some("v3"));
    assert!(results.recv().await.is_none());

    transport.close().await;
    assert!(!transport.is_open());
    assert!(!session.is_valid());
}

#[tokio::test]
async fn test_rejected_key_is_authentication_error() {
    let port = spawn_hub(HubScript::RejectKey).await;
    let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}", port)).unwrap();
    let connector = WebSocketConnector::new(endpoint, "/hub", false);

    let transport = connector.connect().await.unwrap();
    let err = InferenceSession::establish(transport, "bad", "fingerprint")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, InferenceError::Authentication(_)));
}

#[tokio::test]
async fn test_server_close_resolves_closed() {
    let port = spawn_hub(HubScript::CloseAfterConnect).await;
    let transport: Arc<dyn HubTransport> = Arc::new(
        WebSocketTransport::connect(&format!("ws://127.0.0.1:{}/hub", port))
            .await
            .unwrap(),
    );
    let session = InferenceSession::establish(transport.clone(), "key-1", "fingerprint")
        .await
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), transport.closed())
        .await
        .unwrap();
    assert!(reason.contains("maintenance"), "reason: {}", reason);
    assert!(!transport.is_open());
    assert!(!session.is_valid());

    let err = transport.invoke("Heartbeat", vec![]).await.err().unwrap();
    assert!(matches!(err, InferenceError::Closed));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = WebSocketTransport::connect(&format!("ws://127.0.0.1:{}/hub", port)).await;
    assert!(matches!(result, Err(InferenceError::Transport(_))));
}

#[tokio::test]
async fn test_unanswered_heartbeat_times_out() {
    let port = spawn_hub(HubScript::SilentHeartbeat).await;
    let (transport, session) = connected_session(port).await;
    let session = Arc::new(session.with_heartbeat_timeout(Duration::from_millis(200)));

    let err = tokio::time::timeout(Duration::from_secs(5), session.heartbeat())
        .await
        .expect("heartbeat must not hang")
        .err()
        .unwrap();
    assert_eq!(err, InferenceError::Timeout(200));
    assert!(transport.is_open());

    // Two silent heartbeats in a row are reported as a lost connection
    let (loss_tx, mut loss_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut scheduler = HeartbeatScheduler::new();
    scheduler.start(
        &tokio::runtime::Handle::current(),
        Duration::from_millis(100),
        session.clone(),
        Arc::new(move |loss: HeartbeatLoss| {
            let _ = loss_tx.send(loss);
        }),
        None,
    );

    let loss = tokio::time::timeout(Duration::from_secs(5), loss_rx.recv())
        .await
        .expect("loss must be reported")
        .unwrap();
    assert!(matches!(loss, HeartbeatLoss::ConnectionLost(_)));
    assert!(loss.reason().contains("timed out"), "reason: {}", loss.reason());
    scheduler.stop();
}

#[tokio::test]
async fn test_predict_timeout_sends_cancel_invocation() {
    let (port, cancels) = spawn_logging_hub(HubScript::SilentPredict).await;
    let (transport, session) = connected_session(port).await;
    let session = session.with_predict_timeout(Duration::from_millis(200));

    let mut results = session.predict_stream(&batch(40), Uuid::from_u128(2), "Alex").await;
    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.error_code.as_deref(), Some("TIMEOUT"));
    assert!(results.recv().await.is_none());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cancels.lock().is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Connect used invocation 1, the stream 2
    assert_eq!(*cancels.lock(), vec!["2".to_string()]);

    // The connection survives the abandoned stream
    assert!(transport.is_open());
    assert!(session.is_valid());
}
