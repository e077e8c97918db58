//! In-process WebSocket server used by the connection tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) struct MockServer {
    pub uri: String,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Bind an ephemeral port on localhost and start accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                if tx.send(ServerConn { ws }).is_err() {
                    break;
                }
            }
        });

        Self { uri: format!("ws://{addr}"), accepted, task }
    }

    /// Next accepted client; panics if none arrives in time.
    pub async fn accept(&mut self) -> ServerConn {
        self.try_accept(WAIT).await.expect("no client connected")
    }

    pub async fn try_accept(&mut self, within: Duration) -> Option<ServerConn> {
        tokio::time::timeout(within, self.accepted.recv()).await.ok().flatten()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Server side of one accepted socket.
pub(crate) struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Next frame of any kind, `None` once the socket is closed.
    pub async fn next_message(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.ws.next()).await.ok().flatten().and_then(Result::ok)
    }

    /// Next text frame parsed as JSON, skipping control frames.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.next_message().await.expect("socket closed") {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }
}
