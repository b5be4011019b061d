//! Inference error taxonomy
//!
//! Every failure on the inference path maps to one of these kinds. None of
//! them ever reaches the tick loop as a panic; they degrade to "skip scoring".

use thiserror::Error;

use crate::logic::config::ConfigError;

pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    /// Connect/socket failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad API key, not retried
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Handshake failed or session invalid
    #[error("session error: {0}")]
    Session(String),

    /// Malformed server frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server sent a non-finite or otherwise unusable value
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("not connected")]
    NotConnected,

    #[error("server limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl InferenceError {
    /// Worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Transport(_)
                | InferenceError::Session(_)
                | InferenceError::Timeout(_)
                | InferenceError::Closed
                | InferenceError::NotConnected
        )
    }

    /// The session must be re-established
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            InferenceError::Session(_) | InferenceError::NotConnected | InferenceError::Closed
        )
    }

    /// Stable error code carried on error results
    pub fn code(&self) -> &'static str {
        match self {
            InferenceError::Transport(_) => "TRANSPORT",
            InferenceError::Authentication(_) => "AUTH_FAILED",
            InferenceError::Session(_) => "SESSION",
            InferenceError::Protocol(_) => "PROTOCOL",
            InferenceError::InvalidData(_) => "INVALID_DATA",
            InferenceError::Timeout(_) => "TIMEOUT",
            InferenceError::NotConnected => "NOT_AUTHENTICATED",
            InferenceError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            InferenceError::Closed => "CLOSED",
            InferenceError::Config(_) => "CONFIG",
        }
    }
}

/// Map a hub error string (`CODE: message` or bare message) into the taxonomy
pub fn parse_hub_error(raw: &str) -> InferenceError {
    let raw = raw.trim();
    let (code, message) = match raw.split_once(':') {
        Some((code, message))
            if !code.is_empty()
                && code.chars().all(|c| c.is_ascii_uppercase() || c == '_') =>
        {
            (code, message.trim())
        }
        _ => ("", raw),
    };

    match code {
        "AUTH_FAILED" | "INVALID_API_KEY" => InferenceError::Authentication(message.to_string()),
        "NOT_AUTHENTICATED" | "SESSION_EXPIRED" | "INVALID_SESSION" => {
            InferenceError::Session(format!("{}: {}", code, message))
        }
        "INVALID_DATA" => InferenceError::InvalidData(message.to_string()),
        "RATE_LIMITED" | "LIMIT_EXCEEDED" => InferenceError::LimitExceeded(message.to_string()),
        "" => {
            let lower = message.to_lowercase();
            if lower.contains("expired") || lower.contains("invalid session") {
                InferenceError::Session(message.to_string())
            } else {
                InferenceError::Protocol(message.to_string())
            }
        }
        other => InferenceError::Protocol(format!("{}: {}", other, message)),
    }
}

/// Heartbeat reply that means the session is gone, not a transient failure
pub fn is_session_expired(err: &InferenceError) -> bool {
    match err {
        InferenceError::NotConnected => true,
        InferenceError::Session(msg) => {
            let lower = msg.to_lowercase();
            lower.contains("expired") || lower.contains("invalid") || lower.contains("not_authenticated")
        }
        _ => false,
    }
}
