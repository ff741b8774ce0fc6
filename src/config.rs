//! Environment-driven configuration (spec §6.3).
//!
//! Mirrors the constants scattered through the component specs in §4 so
//! they can be tuned without a rebuild, with sanity ranges enforced at
//! startup rather than silently clamped.

use crate::error::ConfigError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: Option<String>,
    pub default_shell: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub debounce_window: Duration,
    pub idle_flush: Duration,
    pub max_buf_bytes: usize,
    pub max_osc_payload_bytes: usize,
    pub max_osc_partial_bytes: usize,
    pub send_queue_len: usize,
    pub rec_queue_len: usize,
    pub grace: Duration,
    pub child_kill_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            db_path: None,
            default_shell: default_shell(),
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(10),
            debounce_window: Duration::from_millis(100),
            idle_flush: Duration::from_millis(25),
            max_buf_bytes: 4096,
            max_osc_payload_bytes: 8192,
            max_osc_partial_bytes: 64 * 1024,
            send_queue_len: 64,
            rec_queue_len: 256,
            grace: Duration::from_secs(10),
            child_kill_grace: Duration::from_secs(3),
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

fn parse_range(
    field: &'static str,
    raw: &str,
    min: i64,
    max: i64,
) -> Result<i64, ConfigError> {
    let value: i64 = raw
        .parse()
        .map_err(|source| ConfigError::Parse { field, source })?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

impl Config {
    /// Load configuration from the process environment, applying defaults
    /// for anything unset and rejecting out-of-range overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(raw) = std::env::var("PORT") {
            cfg.port = parse_range("PORT", &raw, 0, 65535)? as u16;
        }
        if let Ok(raw) = std::env::var("DB_PATH") {
            cfg.db_path = Some(raw);
        }
        if let Ok(raw) = std::env::var("DEFAULT_SHELL") {
            cfg.default_shell = raw;
        }
        if let Ok(raw) = std::env::var("PING_INTERVAL_MS") {
            let ms = parse_range("PING_INTERVAL_MS", &raw, 1_000, 600_000)?;
            cfg.ping_interval = Duration::from_millis(ms as u64);
        }
        if let Ok(raw) = std::env::var("DEBOUNCE_WINDOW_MS") {
            let ms = parse_range("DEBOUNCE_WINDOW_MS", &raw, 10, 1000)?;
            cfg.debounce_window = Duration::from_millis(ms as u64);
        }
        if let Ok(raw) = std::env::var("MAX_BUF_BYTES") {
            cfg.max_buf_bytes = parse_range("MAX_BUF_BYTES", &raw, 256, 1 << 20)? as usize;
        }
        if let Ok(raw) = std::env::var("MAX_OSC_PAYLOAD_BYTES") {
            cfg.max_osc_payload_bytes =
                parse_range("MAX_OSC_PAYLOAD_BYTES", &raw, 64, 1 << 20)? as usize;
        }

        Ok(cfg)
    }
}
