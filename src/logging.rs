//! Logging helpers
//!
//! The crate logs through the `log` facade; hosts without their own logger
//! can call [`init`] once at startup.

/// Install env_logger honouring `RUST_LOG`, default filter `info`.
/// Safe to call more than once.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Shorten a secret or session id for log output
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    if prefix.len() < value.len() {
        format!("{}...", prefix)
    } else {
        prefix
    }
}
