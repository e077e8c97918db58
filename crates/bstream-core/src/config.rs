//! Configuration parsing for the stream client.
//!
//! Everything is read from a single JSON file. Only `subscriptions` is
//! mandatory; every other field falls back to a default through the
//! `effective_*` accessors.
//!
//! # Example config
//!
//! ```json
//! {
//!   "log": { "module_name": "bstream", "log_path": "/tmp/log" },
//!   "stream": {
//!     "uri": "wss://stream.binance.com/stream",
//!     "timeout_ms": 5000,
//!     "close_code": 4999,
//!     "retry": { "kind": "exponential", "initial_ms": 100, "max_ms": 30000 }
//!   },
//!   "subscriptions": ["btcusdt@ticker", "ethusdt@kline_1m"]
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::StreamError;
use crate::retry::{ExponentialBackoff, FixedBackoff, RetryPolicy};
use crate::ws::ConnectionOptions;

/// Default combined-stream endpoint.
pub const DEFAULT_STREAM_URI: &str = "wss://stream.binance.com/stream";

/// Read timeout after which a keepalive ping is sent.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code used when `close()` is called without one.
pub const DEFAULT_STREAM_CLOSE_CODE: u16 = 4999;

/// How long `close()` waits for the server to acknowledge the close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logging metadata (module name, log path).
    pub log: Option<LogConfig>,

    /// Connection settings. Defaults apply if the block is missing.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Stream names to subscribe, e.g. `"btcusdt@ticker"`.
    pub subscriptions: Vec<String>,
}

impl AppConfig {
    pub fn module_name(&self) -> String {
        self.log
            .as_ref()
            .and_then(|l| l.module_name.clone())
            .unwrap_or_else(|| "bstream".to_string())
    }

    pub fn log_path(&self) -> Option<String> {
        self.log.as_ref().and_then(|l| l.log_path.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub module_name: Option<String>,
    pub log_path: Option<String>,
}

/// Connection block of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamConfig {
    /// Label used as the log prefix.
    pub label: Option<String>,

    /// WebSocket endpoint.
    pub uri: Option<String>,

    /// Read timeout in milliseconds; a ping is sent when it expires.
    pub timeout_ms: Option<u64>,

    /// Close code sent by `close()` when none is supplied.
    pub close_code: Option<u16>,

    /// Close handshake timeout in milliseconds.
    pub close_timeout_ms: Option<u64>,

    /// Reconnect strategy.
    pub retry: Option<RetryConfig>,

    /// Extra HTTP headers for the WebSocket handshake.
    pub extra_headers: Option<HashMap<String, String>>,
}

impl StreamConfig {
    pub fn effective_uri(&self) -> String {
        self.uri.clone().unwrap_or_else(|| DEFAULT_STREAM_URI.to_string())
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_STREAM_TIMEOUT)
    }

    pub fn effective_close_code(&self) -> u16 {
        self.close_code.unwrap_or(DEFAULT_STREAM_CLOSE_CODE)
    }

    pub fn effective_close_timeout(&self) -> Duration {
        self.close_timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }

    /// Validate and convert into [`ConnectionOptions`].
    pub fn connection_options(&self) -> Result<ConnectionOptions, StreamError> {
        let uri = self.effective_uri();
        if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
            return Err(StreamError::Config(format!("uri must use ws:// or wss://, got {uri}")));
        }
        let timeout = self.effective_timeout();
        if timeout.is_zero() {
            return Err(StreamError::Config("timeout_ms must be greater than 0".into()));
        }

        Ok(ConnectionOptions {
            label: self.label.clone().unwrap_or_else(|| "stream".to_string()),
            uri,
            timeout,
            close_code: self.effective_close_code(),
            close_timeout: self.effective_close_timeout(),
            extra_headers: self.extra_headers.clone().unwrap_or_default(),
        })
    }

    /// Build the configured retry policy (exponential 100ms → 30s by default).
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        match &self.retry {
            Some(retry) => retry.build(),
            None => Arc::new(ExponentialBackoff::default()),
        }
    }
}

/// Retry strategy selection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryConfig {
    Fixed {
        delay_ms: u64,
        max_attempts: Option<u32>,
    },
    Exponential {
        initial_ms: Option<u64>,
        max_ms: Option<u64>,
        max_attempts: Option<u32>,
    },
}

impl RetryConfig {
    pub fn build(&self) -> Arc<dyn RetryPolicy> {
        match *self {
            Self::Fixed { delay_ms, max_attempts } => Arc::new(FixedBackoff {
                delay: Duration::from_millis(delay_ms),
                max_attempts,
            }),
            Self::Exponential { initial_ms, max_ms, max_attempts } => {
                let defaults = ExponentialBackoff::default();
                Arc::new(ExponentialBackoff {
                    initial: initial_ms.map(Duration::from_millis).unwrap_or(defaults.initial),
                    max: max_ms.map(Duration::from_millis).unwrap_or(defaults.max),
                    max_attempts,
                })
            }
        }
    }
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}
