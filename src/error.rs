//! Error kinds surfaced across the session core (spec §7).

use thiserror::Error;

/// Errors a [`crate::pty::PtySession`] can produce.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to create pty session: {0}")]
    Create(#[from] anyhow::Error),
    #[error("operation attempted on a closed session")]
    Closed,
    #[error("requested size out of bounds: {cols}x{rows}")]
    Bounds { cols: u16, rows: u16 },
    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors a [`crate::ws::WsFramer`] can produce.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("framer is closed")]
    Closed,
    #[error("send queue full, message dropped")]
    BackpressureDropped,
    #[error("no frames received within the keepalive window")]
    KeepaliveLost,
    #[error("websocket io error: {0}")]
    Io(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors arising from malformed or out-of-policy client protocol usage.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("too many consecutive malformed frames ({0})")]
    TooManyMalformed(u32),
}

/// An OSC envelope exceeded the configured payload cap; handled fail-open.
#[derive(Debug, Error)]
#[error("osc envelope exceeded max payload ({len} bytes)")]
pub struct OscOverflow {
    pub len: usize,
}

/// Configuration load/validation failure (spec §6.3).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be in range {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("{field} is not a valid integer: {source}")]
    Parse {
        field: &'static str,
        #[source]
        source: std::num::ParseIntError,
    },
}
