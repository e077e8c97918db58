//! Outbound request frames.
//!
//! ```json
//! { "method": "SUBSCRIBE", "params": ["btcusdt@aggTrade"], "id": 1 }
//! ```
//!
//! The caller supplies `method` and `params`; the connection stamps `id`.

use serde::Serialize;

/// A request sent over the stream socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub params: Vec<String>,
}

#[derive(Serialize)]
struct Frame<'a> {
    method: &'a str,
    params: &'a [String],
    id: u64,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<String>) -> Self {
        Self { method: method.into(), params }
    }

    pub fn subscribe(params: Vec<String>) -> Self {
        Self::new("SUBSCRIBE", params)
    }

    pub fn unsubscribe(params: Vec<String>) -> Self {
        Self::new("UNSUBSCRIBE", params)
    }

    pub fn list_subscriptions() -> Self {
        Self::new("LIST_SUBSCRIPTIONS", Vec::new())
    }

    /// Serialize with the given id stamped into the frame.
    pub fn to_frame(&self, id: u64) -> serde_json::Result<String> {
        serde_json::to_string(&Frame { method: &self.method, params: &self.params, id })
    }
}
