//! # bstream-core
//!
//! Core crate for the market stream client, providing:
//!
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): `StreamError` via thiserror
//! - **Logging** (`logging`): tracing-based structured logging
//! - **Retry** (`retry`): pluggable reconnect policies
//! - **WebSocket** (`ws`): stream connection with request correlation and auto-reconnect

pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod ws;

pub use error::StreamError;
