//! Central Configuration Constants
//!
//! Single source of truth for all detection defaults.
//! Environment helpers read `MLSAC_*` variables with fallback to these values.

/// Default inference endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.mlsac.wtf";

/// Port used when the endpoint carries neither scheme nor port
pub const DEFAULT_PORT: u16 = 5000;

/// Hub path appended to the endpoint base URL
pub const DEFAULT_HUB_PATH: &str = "/hubs/inference";

/// App version (sent during the hub handshake)
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App name
pub const APP_NAME: &str = "MLSAC";

// ============================================
// Detection defaults
// ============================================

/// Rotation samples per submitted batch
pub const DEFAULT_SEQUENCE: usize = 40;

/// Minimum ticks between two submissions for one player
pub const DEFAULT_STEP: u32 = 10;

/// Probability at or above which the buffer accumulates
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.5;

/// Buffer level that raises a flag
pub const DEFAULT_BUFFER_FLAG: f64 = 50.0;

/// Buffer value restored after a flag
pub const DEFAULT_BUFFER_RESET_ON_FLAG: f64 = 25.0;

/// Probability multiplier applied on accumulation
pub const DEFAULT_BUFFER_MULTIPLIER: f64 = 100.0;

/// Buffer decrease applied on a low-probability result
pub const DEFAULT_BUFFER_DECREASE: f64 = 0.25;

/// Minimum probability for a flag to escalate into a punishment
pub const DEFAULT_PUNISHMENT_MIN_PROBABILITY: f64 = 0.85;

/// Results above this count as high-confidence detections
pub const HIGH_PROBABILITY_THRESHOLD: f64 = 0.8;

/// Probabilities kept per player for display
pub const PROBABILITY_HISTORY_SIZE: usize = 10;

/// Kick records kept per player and globally
pub const KICK_HISTORY_SIZE: usize = 50;

// ============================================
// Timers
// ============================================

pub const DEFAULT_VL_DECAY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_VL_DECAY_AMOUNT: u32 = 1;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REPORT_STATS_INTERVAL_SECS: u64 = 30;

/// Bound on a single predict call (request + streamed results)
pub const PREDICT_TIMEOUT_SECS: u64 = 5;

/// Bound on ReportStats
pub const REPORT_STATS_TIMEOUT_SECS: u64 = 5;

/// Bound on Connect after the socket handshake
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Bound on one Heartbeat call
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 5;

/// Bound on session shutdown during host shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Consecutive heartbeat failures that invalidate the session
pub const MAX_HEARTBEAT_FAILURES: u32 = 2;

/// Consecutive connect failures before admins are alerted
pub const CONNECT_FAILURE_ALERT_ATTEMPTS: u32 = 5;

// ============================================
// Helper functions to read from env with fallback
// ============================================

/// Get inference endpoint from environment or use default
pub fn get_endpoint() -> String {
    std::env::var("MLSAC_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

/// Get API key from environment (empty when unset)
pub fn get_api_key() -> String {
    std::env::var("MLSAC_API_KEY").unwrap_or_default()
}

/// Get heartbeat interval from environment or use default
pub fn get_heartbeat_interval() -> u64 {
    std::env::var("MLSAC_HEARTBEAT_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS)
}

/// Check if detection is enabled
pub fn is_detection_enabled() -> bool {
    std::env::var("MLSAC_ENABLED")
        .map(|s| s.to_lowercase() != "false" && s != "0")
        .unwrap_or(false)
}
