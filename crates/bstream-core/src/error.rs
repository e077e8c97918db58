//! Typed error definitions for the stream client.
//!
//! [`StreamError`] is what `send()` and `close()` callers observe. All variants
//! implement `std::error::Error` via `thiserror`, so they integrate with
//! `anyhow::Result` in application code.

use thiserror::Error;

/// Errors surfaced by [`StreamConnection`](crate::ws::StreamConnection) and
/// the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Operation attempted before `connect()` or after `close()`.
    #[error("stream {uri} is not connected or never connected")]
    NotConnected { uri: String },

    /// The server answered a correlated request with an error payload.
    #[error("subscribe error {code}: {message}")]
    Subscribe { code: i64, message: String },

    /// Inbound text frame was not valid JSON.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The socket terminated before the request was answered.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The retry policy gave up reconnecting.
    #[error("retry exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// Handshake or transport failure while opening the socket.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),
}

impl StreamError {
    /// Build a [`StreamError::Subscribe`] from a Binance `error` object
    /// (`{"code": -1, "msg": "..."}`). Missing fields default to `0` / `""`.
    pub fn from_error_payload(payload: &serde_json::Value) -> Self {
        Self::Subscribe {
            code: payload.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
            message: payload
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// `true` for the variants produced by losing the socket.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::RetryExhausted { .. } | Self::WebSocket(_)
        )
    }
}
