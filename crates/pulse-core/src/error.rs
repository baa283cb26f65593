//! Typed error definitions for the Pulse telemetry system.
//!
//! [`PulseError`] covers the failures each layer handles locally (transport,
//! decode, fallback pull, probe). Application boundaries wrap it in
//! `anyhow::Result`.

use thiserror::Error;

/// Domain-specific errors for the Pulse telemetry system.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// A frame or payload that does not match the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// REST fallback request failure (HTTP error, timeout, bad body).
    #[error("fallback error: {0}")]
    Fallback(String),

    /// Health probe failure.
    #[error("probe error: {0}")]
    Probe(String),

    /// Broker actor is gone or rejected the request.
    #[error("broker error: {0}")]
    Broker(String),
}

impl PulseError {
    /// Shorthand for a protocol error from anything displayable.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}
