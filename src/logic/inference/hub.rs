//! Hub Protocol - JSON hub framing and method payloads
//!
//! Frames are JSON objects terminated by the 0x1E record separator. The
//! numeric `type` field selects the message kind; invocation ids correlate
//! completions and stream items with the request that produced them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use super::error::{InferenceError, InferenceResult};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Frame terminator
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Handshake request body (without separator)
pub const HANDSHAKE_REQUEST: &str = r#"{"protocol":"json","version":1}"#;

/// Client keep-alive ping period
pub const KEEP_ALIVE_INTERVAL_SECS: u64 = 15;

/// Connection is considered dead after this long without any frame
pub const SERVER_TIMEOUT_SECS: u64 = 120;

/// Bound on transport connect + handshake
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 15;

/// Hub method names
pub mod methods {
    pub const CONNECT: &str = "Connect";
    pub const HEARTBEAT: &str = "Heartbeat";
    pub const REPORT_STATS: &str = "ReportStats";
    pub const PREDICT_STREAM: &str = "predictStream";
}

// ============================================================================
// MESSAGES
// ============================================================================

/// One hub frame
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    StreamItem {
        invocation_id: String,
        item: Value,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },
    CancelInvocation {
        invocation_id: String,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

impl HubMessage {
    pub fn type_id(&self) -> u8 {
        match self {
            HubMessage::Invocation { .. } => 1,
            HubMessage::StreamItem { .. } => 2,
            HubMessage::Completion { .. } => 3,
            HubMessage::StreamInvocation { .. } => 4,
            HubMessage::CancelInvocation { .. } => 5,
            HubMessage::Ping => 6,
            HubMessage::Close { .. } => 7,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = json!({ "type": self.type_id() });
        match self {
            HubMessage::Invocation { invocation_id, target, arguments } => {
                if let Some(id) = invocation_id {
                    obj["invocationId"] = json!(id);
                }
                obj["target"] = json!(target);
                obj["arguments"] = json!(arguments);
            }
            HubMessage::StreamItem { invocation_id, item } => {
                obj["invocationId"] = json!(invocation_id);
                obj["item"] = item.clone();
            }
            HubMessage::Completion { invocation_id, result, error } => {
                obj["invocationId"] = json!(invocation_id);
                if let Some(result) = result {
                    obj["result"] = result.clone();
                }
                if let Some(error) = error {
                    obj["error"] = json!(error);
                }
            }
            HubMessage::StreamInvocation { invocation_id, target, arguments } => {
                obj["invocationId"] = json!(invocation_id);
                obj["target"] = json!(target);
                obj["arguments"] = json!(arguments);
            }
            HubMessage::CancelInvocation { invocation_id } => {
                obj["invocationId"] = json!(invocation_id);
            }
            HubMessage::Ping => {}
            HubMessage::Close { error, allow_reconnect } => {
                if let Some(error) = error {
                    obj["error"] = json!(error);
                }
                obj["allowReconnect"] = json!(allow_reconnect);
            }
        }
        obj
    }

    /// JSON text plus record separator
    pub fn to_frame(&self) -> String {
        let mut frame = self.to_json().to_string();
        frame.push(RECORD_SEPARATOR);
        frame
    }

    pub fn from_json(value: &Value) -> InferenceResult<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| InferenceError::Protocol("frame without type".to_string()))?;

        let id = || -> InferenceResult<String> {
            value
                .get("invocationId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| InferenceError::Protocol(format!("type {} frame without invocationId", kind)))
        };
        let target = || value.get("target").and_then(Value::as_str).unwrap_or_default().to_string();
        let arguments = || {
            value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        let error = || value.get("error").and_then(Value::as_str).map(str::to_string);

        Ok(match kind {
            1 => HubMessage::Invocation {
                invocation_id: value.get("invocationId").and_then(Value::as_str).map(str::to_string),
                target: target(),
                arguments: arguments(),
            },
            2 => HubMessage::StreamItem {
                invocation_id: id()?,
                item: value.get("item").cloned().unwrap_or(Value::Null),
            },
            3 => HubMessage::Completion {
                invocation_id: id()?,
                result: value.get("result").cloned(),
                error: error(),
            },
            4 => HubMessage::StreamInvocation {
                invocation_id: id()?,
                target: target(),
                arguments: arguments(),
            },
            5 => HubMessage::CancelInvocation { invocation_id: id()? },
            6 => HubMessage::Ping,
            7 => HubMessage::Close {
                error: error(),
                allow_reconnect: value
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            other => {
                return Err(InferenceError::Protocol(format!("unknown message type {}", other)));
            }
        })
    }
}

/// Split a text payload into its JSON frames
pub fn split_frames(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|f| !f.is_empty())
}

/// Decode every frame in a payload
pub fn parse_frames(payload: &str) -> Vec<InferenceResult<HubMessage>> {
    split_frames(payload)
        .map(|frame| {
            serde_json::from_str::<Value>(frame)
                .map_err(|e| InferenceError::Protocol(format!("bad frame: {}", e)))
                .and_then(|v| HubMessage::from_json(&v))
        })
        .collect()
}

/// Handshake request frame
pub fn handshake_frame() -> String {
    let mut frame = HANDSHAKE_REQUEST.to_string();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Check the handshake reply (`{}` or `{"error": ...}`)
pub fn check_handshake_response(frame: &str) -> InferenceResult<()> {
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| InferenceError::Session(format!("bad handshake reply: {}", e)))?;
    match value.get("error").and_then(Value::as_str) {
        Some(error) => Err(InferenceError::Session(format!("handshake rejected: {}", error))),
        None => Ok(()),
    }
}

// ============================================================================
// NEGOTIATE
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NegotiateResponse {
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub negotiate_version: Option<u32>,
    pub error: Option<String>,
}

impl NegotiateResponse {
    /// Token to put on the socket URL
    pub fn token(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }
}

// ============================================================================
// METHOD PAYLOADS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub api_key: String,
    pub plugin_hash: String,
    pub plugin_version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectResponse {
    pub session_id: String,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatResponse {
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStatsRequest {
    pub online_players: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportStatsResponse {
    pub limit_exceeded: bool,
    pub max_online: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictRequest {
    /// Base64 of the encoded batch
    pub player_data: String,
    pub player_uuid: String,
    pub player_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PredictResponse {
    #[serde(deserialize_with = "lenient_f64")]
    pub probability: f64,
    pub inference_time_ms: u64,
    pub model: Option<String>,
}

/// Numbers, or the named literals some serializers emit for non-finite floats
fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => match s.as_str() {
            "Infinity" | "+Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other.parse().unwrap_or(f64::NAN),
        },
        _ => f64::NAN,
    })
}

// ============================================================================
// PREDICT RESULT
// ============================================================================

/// One streamed inference outcome as seen by the detection logic.
/// `probability` is always finite and within [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResult {
    pub success: bool,
    pub probability: f64,
    pub inference_time_ms: u64,
    pub model: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl PredictResult {
    /// Validate a server reply; non-finite probabilities become INVALID_DATA
    pub fn from_response(response: PredictResponse) -> Self {
        if !response.probability.is_finite() {
            return Self::from_error(&InferenceError::InvalidData(format!(
                "server returned invalid probability: {}",
                response.probability
            )));
        }
        Self {
            success: true,
            probability: response.probability.clamp(0.0, 1.0),
            inference_time_ms: response.inference_time_ms,
            model: response.model.filter(|m| !m.is_empty()),
            error_code: None,
            error_message: None,
        }
    }

    /// Decode a raw stream item
    pub fn from_item(item: Value) -> Self {
        match serde_json::from_value::<PredictResponse>(item) {
            Ok(response) => Self::from_response(response),
            Err(e) => Self::from_error(&InferenceError::Protocol(format!("bad predict item: {}", e))),
        }
    }

    pub fn from_error(error: &InferenceError) -> Self {
        Self {
            success: false,
            probability: 0.0,
            inference_time_ms: 0,
            model: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip_shapes() {
        let msg = HubMessage::Invocation {
            invocation_id: Some("3".to_string()),
            target: methods::HEARTBEAT.to_string(),
            arguments: vec![],
        };
        let frame = msg.to_frame();
        assert!(frame.ends_with(RECORD_SEPARATOR));
        assert!(frame.contains("\"type\":1"));

        let parsed = parse_frames(&frame);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].as_ref().unwrap(), &msg);
    }

    #[test]
    fn test_parse_multiple_frames() {
        let payload = "{\"type\":6}\u{1e}{\"type\":3,\"invocationId\":\"1\",\"result\":{\"serverTime\":5}}\u{1e}";
        let frames = parse_frames(payload);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), &HubMessage::Ping);
        match frames[1].as_ref().unwrap() {
            HubMessage::Completion { invocation_id, result, error } => {
                assert_eq!(invocation_id, "1");
                assert_eq!(result.as_ref().unwrap()["serverTime"], 5);
                assert!(error.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let frames = parse_frames("{\"type\":42}\u{1e}");
        assert!(matches!(frames[0], Err(InferenceError::Protocol(_))));
        let frames = parse_frames("{\"type\":2}\u{1e}");
        assert!(frames[0].is_err());
    }

    #[test]
    fn test_handshake_response() {
        assert!(check_handshake_response("{}").is_ok());
        assert!(matches!(
            check_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#),
            Err(InferenceError::Session(_))
        ));
    }

    #[test]
    fn test_predict_result_clamps() {
        let high = PredictResult::from_item(json!({"probability": 1.7, "inferenceTimeMs": 12, "model": "v3"}));
        assert!(high.success);
        assert_eq!(high.probability, 1.0);
        assert_eq!(high.model.as_deref(), Some("v3"));

        let low = PredictResult::from_item(json!({"probability": -0.2}));
        assert_eq!(low.probability, 0.0);
    }

    #[test]
    fn test_predict_result_rejects_non_finite() {
        for item in [json!({"probability": "NaN"}), json!({"probability": "-Infinity"})] {
            let result = PredictResult::from_item(item);
            assert!(result.is_error());
            assert_eq!(result.error_code.as_deref(), Some("INVALID_DATA"));
            assert_eq!(result.probability, 0.0);
        }
    }

    #[test]
    fn test_payload_casing() {
        let request = serde_json::to_value(ConnectRequest {
            api_key: "k".into(),
            plugin_hash: "h".into(),
            plugin_version: "1.0".into(),
        })
        .unwrap();
        assert!(request.get("apiKey").is_some());
        assert!(request.get("pluginHash").is_some());

        let stats: ReportStatsResponse =
            serde_json::from_value(json!({"limitExceeded": true, "maxOnline": 20})).unwrap();
        assert!(stats.limit_exceeded);
        assert_eq!(stats.max_online, 20);
    }

    #[test]
    fn test_negotiate_token_fallback() {
        let with_token: NegotiateResponse =
            serde_json::from_value(json!({"connectionId": "a", "connectionToken": "b"})).unwrap();
        assert_eq!(with_token.token(), Some("b"));
        let id_only: NegotiateResponse = serde_json::from_value(json!({"connectionId": "a"})).unwrap();
        assert_eq!(id_only.token(), Some("a"));
    }
}
