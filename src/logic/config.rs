//! Detection Configuration
//!
//! Read-only configuration surface consumed by the detection core.
//! Loaded from a JSON document or from `MLSAC_*` environment variables
//! (a `.env` file is honoured), then sanitized once before use.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    self, DEFAULT_HUB_PATH, DEFAULT_PORT, DEFAULT_PUNISHMENT_MIN_PROBABILITY,
    DEFAULT_REPORT_STATS_INTERVAL_SECS, DEFAULT_SEQUENCE, DEFAULT_STEP,
    DEFAULT_VL_DECAY_AMOUNT, DEFAULT_VL_DECAY_INTERVAL_SECS,
};
use crate::logic::model::BufferConfig;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("inference endpoint is not configured")]
    MissingEndpoint,

    #[error("API key is not configured")]
    MissingApiKey,

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTIONS
// ============================================================================

/// How the punishment ladder picks an entry for a violation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LadderPolicy {
    /// Only a key equal to the level fires
    #[default]
    Exact,
    /// Highest key not above the level fires
    HighestAtOrBelow,
}

impl FromStr for LadderPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "highest-at-or-below" | "highest" => Ok(Self::HighestAtOrBelow),
            other => Err(ConfigError::Invalid(format!("unknown ladder policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VlDecayConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub amount: u32,
}

impl Default for VlDecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_VL_DECAY_INTERVAL_SECS,
            amount: DEFAULT_VL_DECAY_AMOUNT,
        }
    }
}

/// Per-model display settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name shown in alerts
    pub name: String,
    /// Results from this model never punish
    pub only_alert: bool,
}

// ============================================================================
// DETECTION CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: String,

    /// Log alerts to the console
    pub console_alerts: bool,

    /// Alert threshold and buffer tuning
    pub buffer: BufferConfig,

    /// Samples per submitted batch
    pub sequence: usize,
    /// Minimum ticks between two submissions for one player
    pub step: u32,

    pub punishment_min_probability: f64,
    /// VL → command template
    pub punishments: BTreeMap<u32, String>,
    pub ladder_policy: LadderPolicy,

    pub vl_decay: VlDecayConfig,
    pub report_stats_interval_secs: u64,
    pub heartbeat_interval_secs: u64,

    /// Model key → display settings
    pub models: HashMap<String, ModelConfig>,

    /// Run the HTTP negotiate step before opening the hub socket
    pub negotiate: bool,
    pub hub_path: String,

    /// Fallback GCD granularity (degrees) when a client never reports sensitivity
    pub default_granularity: Option<f64>,

    /// Directory for recorded sessions
    pub output_directory: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: constants::DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            console_alerts: true,
            buffer: BufferConfig::default(),
            sequence: DEFAULT_SEQUENCE,
            step: DEFAULT_STEP,
            punishment_min_probability: DEFAULT_PUNISHMENT_MIN_PROBABILITY,
            punishments: BTreeMap::new(),
            ladder_policy: LadderPolicy::default(),
            vl_decay: VlDecayConfig::default(),
            report_stats_interval_secs: DEFAULT_REPORT_STATS_INTERVAL_SECS,
            heartbeat_interval_secs: constants::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            models: HashMap::new(),
            negotiate: true,
            hub_path: DEFAULT_HUB_PATH.to_string(),
            default_granularity: None,
            output_directory: "data".to_string(),
        }
    }
}

impl DetectionConfig {
    /// Defaults overlaid with `MLSAC_*` environment variables
    pub fn from_env() -> Self {
        // Missing .env is fine
        let _ = dotenvy::dotenv();

        let mut config = Self {
            enabled: constants::is_detection_enabled(),
            endpoint: constants::get_endpoint(),
            api_key: constants::get_api_key(),
            heartbeat_interval_secs: constants::get_heartbeat_interval(),
            ..Default::default()
        };

        if let Some(v) = env_parse("MLSAC_CONSOLE_ALERTS") {
            config.console_alerts = v;
        }
        if let Some(v) = env_parse("MLSAC_ALERT_THRESHOLD") {
            config.buffer.alert_threshold = v;
        }
        if let Some(v) = env_parse("MLSAC_BUFFER_FLAG") {
            config.buffer.flag = v;
        }
        if let Some(v) = env_parse("MLSAC_BUFFER_RESET_ON_FLAG") {
            config.buffer.reset_on_flag = v;
        }
        if let Some(v) = env_parse("MLSAC_BUFFER_MULTIPLIER") {
            config.buffer.multiplier = v;
        }
        if let Some(v) = env_parse("MLSAC_BUFFER_DECREASE") {
            config.buffer.decrease = v;
        }
        if let Some(v) = env_parse("MLSAC_SEQUENCE") {
            config.sequence = v;
        }
        if let Some(v) = env_parse("MLSAC_STEP") {
            config.step = v;
        }
        if let Some(v) = env_parse("MLSAC_PUNISHMENT_MIN_PROBABILITY") {
            config.punishment_min_probability = v;
        }
        if let Some(v) = env_parse("MLSAC_LADDER_POLICY") {
            config.ladder_policy = v;
        }
        if let Some(v) = env_parse("MLSAC_VL_DECAY_ENABLED") {
            config.vl_decay.enabled = v;
        }
        if let Some(v) = env_parse("MLSAC_VL_DECAY_INTERVAL") {
            config.vl_decay.interval_secs = v;
        }
        if let Some(v) = env_parse("MLSAC_VL_DECAY_AMOUNT") {
            config.vl_decay.amount = v;
        }
        if let Some(v) = env_parse("MLSAC_REPORT_STATS_INTERVAL") {
            config.report_stats_interval_secs = v;
        }
        if let Some(v) = env_parse("MLSAC_NEGOTIATE") {
            config.negotiate = v;
        }
        if let Ok(v) = env::var("MLSAC_HUB_PATH") {
            config.hub_path = v;
        }
        if let Some(v) = env_parse("MLSAC_DEFAULT_GRANULARITY") {
            config.default_granularity = Some(v);
        }
        if let Ok(v) = env::var("MLSAC_OUTPUT_DIRECTORY") {
            config.output_directory = v;
        }

        config.sanitize()
    }

    /// Parse a JSON document; absent keys keep their defaults
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config.sanitize())
    }

    /// Clamp out-of-range values, warning for each one touched
    pub fn sanitize(mut self) -> Self {
        self.buffer.alert_threshold =
            clamp_probability(self.buffer.alert_threshold, "alert_threshold");
        self.punishment_min_probability =
            clamp_probability(self.punishment_min_probability, "punishment_min_probability");

        if self.sequence < 1 {
            log::warn!("sequence must be at least 1, using 1");
            self.sequence = 1;
        }
        if self.step < 1 {
            log::warn!("step must be at least 1, using 1");
            self.step = 1;
        }
        if !self.buffer.decrease.is_finite() || self.buffer.decrease < 0.0 {
            log::warn!("buffer.decrease must be non-negative, using 0");
            self.buffer.decrease = 0.0;
        }
        if self.vl_decay.interval_secs == 0 {
            log::warn!("vl_decay.interval_secs must be positive, using {}", DEFAULT_VL_DECAY_INTERVAL_SECS);
            self.vl_decay.interval_secs = DEFAULT_VL_DECAY_INTERVAL_SECS;
        }
        if self.heartbeat_interval_secs == 0 {
            self.heartbeat_interval_secs = constants::DEFAULT_HEARTBEAT_INTERVAL_SECS;
        }
        if self.report_stats_interval_secs == 0 {
            self.report_stats_interval_secs = DEFAULT_REPORT_STATS_INTERVAL_SECS;
        }
        if !self.hub_path.starts_with('/') {
            self.hub_path.insert(0, '/');
        }
        self
    }

    /// Endpoint and key are usable for a session
    pub fn validate_endpoint(&self) -> Result<Endpoint, ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        Endpoint::parse(&self.endpoint)
    }

    /// Display name for a model key
    pub fn model_display_name(&self, model: Option<&str>) -> String {
        let Some(key) = model else {
            return "unknown".to_string();
        };
        match self.models.get(key) {
            Some(m) if !m.name.is_empty() => m.name.clone(),
            _ => key.to_string(),
        }
    }

    pub fn is_model_only_alert(&self, model: Option<&str>) -> bool {
        model
            .and_then(|key| self.models.get(key))
            .map(|m| m.only_alert)
            .unwrap_or(false)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn clamp_probability(value: f64, name: &str) -> f64 {
    if value.is_nan() {
        log::warn!("{} is not a number, using 0.5", name);
        return 0.5;
    }
    if !(0.0..=1.0).contains(&value) {
        let clamped = value.clamp(0.0, 1.0);
        log::warn!("{} {} out of range [0, 1], clamped to {}", name, value, clamped);
        return clamped;
    }
    value
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Parsed inference endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path prefix without trailing slash
    pub base_path: String,
}

impl Endpoint {
    /// Accepts `host`, `host:port` and `http(s)://host[:port][/path]`.
    /// Without a scheme the connection is plain and the port defaults to 5000.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let invalid = || ConfigError::InvalidEndpoint(raw.to_string());

        let (secure, scheme_given, rest) = if let Some(r) = raw.strip_prefix("https://") {
            (true, true, r)
        } else if let Some(r) = raw.strip_prefix("wss://") {
            (true, true, r)
        } else if let Some(r) = raw.strip_prefix("http://") {
            (false, true, r)
        } else if let Some(r) = raw.strip_prefix("ws://") {
            (false, true, r)
        } else if raw.contains("://") {
            return Err(invalid());
        } else {
            (false, false, raw)
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse::<u16>().map_err(|_| invalid())?)),
            None => (authority, None),
        };

        if host.is_empty() || host.chars().any(|c| c.is_whitespace()) {
            return Err(invalid());
        }

        let port = match (port, scheme_given, secure) {
            (Some(p), _, _) => p,
            (None, false, _) => DEFAULT_PORT,
            (None, true, true) => 443,
            (None, true, false) => 80,
        };

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            base_path: path.trim_end_matches('/').to_string(),
        })
    }

    fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `http(s)://host[:port]{base_path}`
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.authority(), self.base_path)
    }

    /// Negotiate URL for a hub path
    pub fn negotiate_url(&self, hub_path: &str) -> String {
        format!("{}{}/negotiate?negotiateVersion=1", self.http_base(), hub_path)
    }

    /// WebSocket URL for a hub path, carrying the negotiated connection token
    pub fn hub_url(&self, hub_path: &str, connection_token: Option<&str>) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = format!("{}://{}{}{}", scheme, self.authority(), self.base_path, hub_path);
        if let Some(token) = connection_token {
            url.push_str("?id=");
            url.push_str(token);
        }
        url
    }
}
