//! WebSocket stream connection with request/response correlation and
//! auto-reconnect.

pub mod connection;
pub mod request;

#[cfg(test)]
pub(crate) mod mock_server;

pub use connection::{
    ConnState, ConnectionOptions, OnConnectedCallback, OnMessageCallback, StreamConnection,
    StreamConnectionBuilder, on_connected_fn, on_message_fn,
};
pub use request::Request;
