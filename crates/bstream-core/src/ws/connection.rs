//! Long-lived stream connection with request/response correlation.
//!
//! A `StreamConnection` runs one background tokio task that:
//! 1. Connects to the WebSocket endpoint.
//! 2. Publishes the open socket to `send()` callers waiting for it and spawns
//!    the on-connected callback.
//! 3. Reads frames with a bounded wait, sending a ping whenever the wait
//!    expires. Frames whose `id` matches a pending request resolve that
//!    request; everything else goes to the on-message callback.
//! 4. On socket termination asks the [`RetryPolicy`] for a delay and
//!    reconnects, unless the termination was caused by `close()`.
//!
//! Request ids come from a per-connection counter that is never reset, so
//! ids are not reused across reconnects.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ahash::AHashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::request::Request;
use crate::config::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_STREAM_CLOSE_CODE, DEFAULT_STREAM_TIMEOUT};
use crate::error::StreamError;
use crate::retry::{ExponentialBackoff, RetryDecision, RetryPolicy, RetryState};

/// Callback invoked for every inbound frame that does not answer a pending
/// request. The decoded JSON is handed over by value.
pub type OnMessageCallback =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback spawned once per successful (re)connection. It receives a handle
/// to the connection so it can issue requests, e.g. re-subscribe.
pub type OnConnectedCallback =
    Arc<dyn Fn(StreamConnection) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as an [`OnMessageCallback`].
pub fn on_message_fn<F, Fut>(f: F) -> OnMessageCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |value: Value| -> BoxFuture<'static, anyhow::Result<()>> { f(value).boxed() })
}

/// Wrap an async closure as an [`OnConnectedCallback`].
pub fn on_connected_fn<F, Fut>(f: F) -> OnConnectedCallback
where
    F: Fn(StreamConnection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |conn: StreamConnection| -> BoxFuture<'static, anyhow::Result<()>> {
        f(conn).boxed()
    })
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Settings for a single stream connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Log prefix.
    pub label: String,
    /// Full WebSocket URL (e.g. `wss://stream.binance.com/stream`).
    pub uri: String,
    /// Read timeout; a ping is sent each time it expires without a frame.
    pub timeout: Duration,
    /// Close code used by [`StreamConnection::close`].
    pub close_code: u16,
    /// Upper bound on waiting for the server's close acknowledgement.
    pub close_timeout: Duration,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
}

impl ConnectionOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            label: "stream".to_string(),
            uri: uri.into(),
            timeout: DEFAULT_STREAM_TIMEOUT,
            close_code: DEFAULT_STREAM_CLOSE_CODE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            extra_headers: HashMap::new(),
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type PendingSlot = oneshot::Sender<Result<Value, StreamError>>;

/// Socket availability as seen by `send()`. `Open` carries the writer of the
/// current socket; a new writer is created for every connection, so frames
/// queued for a dead socket are never replayed on the next one.
#[derive(Clone)]
enum Link {
    Disconnected,
    Connecting,
    Open(mpsc::Sender<Message>),
    Closing,
    /// The retry policy gave up; `send()` reports the carried error.
    Exhausted(StreamError),
}

impl Link {
    fn state(&self) -> ConnState {
        match self {
            Self::Disconnected => ConnState::Disconnected,
            Self::Connecting => ConnState::Connecting,
            Self::Open(_) => ConnState::Open,
            Self::Closing => ConnState::Closing,
            Self::Exhausted(_) => ConnState::Disconnected,
        }
    }
}

struct Inner {
    options: ConnectionOptions,
    retry_policy: Arc<dyn RetryPolicy>,
    on_message: OnMessageCallback,
    on_connected: Option<OnConnectedCallback>,
    next_id: AtomicU64,
    pending: Mutex<AHashMap<u64, PendingSlot>>,
    link: watch::Sender<Link>,
    /// `Some(code)` once `close()` has been requested.
    shutdown: watch::Sender<Option<u16>>,
    conn_task: Mutex<Option<JoinHandle<()>>>,
    connected_task: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`StreamConnection`].
pub struct StreamConnectionBuilder {
    options: ConnectionOptions,
    on_message: Option<OnMessageCallback>,
    on_connected: Option<OnConnectedCallback>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl StreamConnectionBuilder {
    pub fn on_message(mut self, callback: OnMessageCallback) -> Self {
        self.on_message = Some(callback);
        self
    }

    pub fn on_connected(mut self, callback: OnConnectedCallback) -> Self {
        self.on_connected = Some(callback);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> StreamConnection {
        let (link, _) = watch::channel(Link::Disconnected);
        let (shutdown, _) = watch::channel(None);
        StreamConnection {
            inner: Arc::new(Inner {
                options: self.options,
                retry_policy: self
                    .retry_policy
                    .unwrap_or_else(|| Arc::new(ExponentialBackoff::default())),
                on_message: self.on_message.unwrap_or_else(|| Arc::new(discard_event)),
                on_connected: self.on_connected,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(AHashMap::new()),
                link,
                shutdown,
                conn_task: Mutex::new(None),
                connected_task: Mutex::new(None),
            }),
        }
    }
}

fn discard_event(_event: Value) -> BoxFuture<'static, anyhow::Result<()>> {
    Box::pin(async { Ok(()) })
}

/// A resilient duplex stream client. Cheap to clone; all clones share the
/// same socket, pending-request table and id counter.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl StreamConnection {
    pub fn builder(options: ConnectionOptions) -> StreamConnectionBuilder {
        StreamConnectionBuilder {
            options,
            on_message: None,
            on_connected: None,
            retry_policy: None,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnState {
        self.inner.link.borrow().state()
    }

    /// Start the connection task in the background and return immediately.
    ///
    /// Calling it again while the task is alive is a no-op. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> &Self {
        let label = &self.inner.options.label;
        let mut task = lock(&self.inner.conn_task);

        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("[{label}] connect() ignored, connection task already running");
            return self;
        }
        if self.state() == ConnState::Closing {
            warn!("[{label}] connect() ignored while closing");
            return self;
        }

        self.inner.shutdown.send_replace(None);
        let shutdown_rx = self.inner.shutdown.subscribe();
        self.inner.link.send_replace(Link::Connecting);
        *task = Some(tokio::spawn(connection_loop(Arc::clone(&self.inner), shutdown_rx)));
        self
    }

    /// Send a request and wait for its correlated response.
    ///
    /// Waits for the in-flight connection attempt if the socket is not open
    /// yet. Resolves to the `result` field on success, or fails with
    /// [`StreamError::Subscribe`] when the server answers with `error`. The
    /// request is never retried by the connection: if the socket drops first,
    /// the caller gets [`StreamError::ConnectionLost`].
    pub async fn send(&self, request: Request) -> Result<Value, StreamError> {
        let outbound = self.wait_open().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = request
            .to_frame(id)
            .map_err(|e| StreamError::MalformedFrame(format!("cannot encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        let _slot = PendingGuard { pending: &self.inner.pending, id };

        debug!("[{}] -> {frame}", self.inner.options.label);
        outbound.send(Message::Text(frame.into())).await.map_err(|_| {
            StreamError::ConnectionLost("socket closed before the request was written".into())
        })?;

        rx.await
            .unwrap_or_else(|_| Err(StreamError::ConnectionLost("request abandoned".into())))
    }

    /// `SUBSCRIBE` to the given stream names.
    pub async fn subscribe(&self, params: Vec<String>) -> Result<Value, StreamError> {
        self.send(Request::subscribe(params)).await
    }

    /// `UNSUBSCRIBE` from the given stream names.
    pub async fn unsubscribe(&self, params: Vec<String>) -> Result<Value, StreamError> {
        self.send(Request::unsubscribe(params)).await
    }

    /// Stream names the server currently has subscribed for this socket.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>, StreamError> {
        let result = self.send(Request::list_subscriptions()).await?;
        Ok(result
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    /// Close with the configured default close code.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.close_with_code(self.inner.options.close_code).await
    }

    /// Stop the connection task and, if a socket is open, close it with
    /// `code`. Both are awaited before returning. Requests still pending fail
    /// with [`StreamError::ConnectionLost`]. The connection can be
    /// reconnected afterwards.
    pub async fn close_with_code(&self, code: u16) -> Result<(), StreamError> {
        let label = &self.inner.options.label;
        let task = lock(&self.inner.conn_task).take();
        let Some(mut task) = task else {
            return Err(self.not_connected());
        };

        info!("[{label}] closing with code {code}");
        self.inner.link.send_replace(Link::Closing);
        self.inner.shutdown.send_replace(Some(code));

        // The loop owns the socket; give it time to finish the close handshake.
        let grace = self.inner.options.close_timeout + Duration::from_secs(1);
        let joined = tokio::time::timeout(grace, &mut task).await;
        match joined {
            Ok(Err(e)) if !e.is_cancelled() => error!("[{label}] connection task failed: {e}"),
            Ok(_) => {}
            Err(_) => {
                warn!("[{label}] connection task did not stop within {grace:?}, aborting");
                task.abort();
                let _ = task.await;
            }
        }

        self.inner.cancel_on_connected().await;
        self.inner
            .fail_pending(|| StreamError::ConnectionLost("connection closed by user".into()));
        self.inner.link.send_replace(Link::Disconnected);
        info!("[{label}] closed");
        Ok(())
    }

    async fn wait_open(&self) -> Result<mpsc::Sender<Message>, StreamError> {
        let mut link = self.inner.link.subscribe();
        loop {
            match &*link.borrow_and_update() {
                Link::Open(outbound) => return Ok(outbound.clone()),
                Link::Connecting => {}
                Link::Exhausted(err) => return Err(err.clone()),
                Link::Disconnected | Link::Closing => return Err(self.not_connected()),
            }
            if link.changed().await.is_err() {
                return Err(self.not_connected());
            }
        }
    }

    fn not_connected(&self) -> StreamError {
        StreamError::NotConnected { uri: self.inner.options.uri.clone() }
    }
}

/// Removes a pending slot when the `send()` future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<AHashMap<u64, PendingSlot>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// What an inbound frame turned out to be.
enum Inbound {
    Resolved,
    /// Matches a pending id but carries neither `result` nor `error`.
    Incomplete(u64),
    Event(Value),
}

impl Inner {
    /// Move the link to `next` unless `close()` already took over.
    fn advance(&self, next: Link) {
        self.link.send_if_modified(|current| {
            if matches!(current, Link::Closing) {
                return false;
            }
            *current = next;
            true
        });
    }

    fn fail_pending(&self, make_error: impl Fn() -> StreamError) {
        let drained: Vec<PendingSlot> = lock(&self.pending).drain().map(|(_, slot)| slot).collect();
        if !drained.is_empty() {
            warn!("[{}] failing {} pending request(s)", self.options.label, drained.len());
        }
        for slot in drained {
            let _ = slot.send(Err(make_error()));
        }
    }

    fn correlate(&self, mut value: Value) -> Inbound {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            return Inbound::Event(value);
        };

        let mut pending = lock(&self.pending);
        if !pending.contains_key(&id) {
            return Inbound::Event(value);
        }

        let outcome = match value.as_object_mut() {
            Some(obj) if obj.contains_key("result") => Ok(obj.remove("result").unwrap_or_default()),
            Some(obj) if obj.contains_key("error") => Err(StreamError::from_error_payload(&obj["error"])),
            _ => return Inbound::Incomplete(id),
        };

        if let Some(slot) = pending.remove(&id) {
            let _ = slot.send(outcome);
        }
        Inbound::Resolved
    }

    async fn handle_text(&self, text: &str) {
        let label = &self.options.label;
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                let err = StreamError::MalformedFrame(format!("{text:?} is invalid JSON: {e}"));
                error!("[{label}] {err}");
                return;
            }
        };

        match self.correlate(value) {
            Inbound::Resolved => {}
            Inbound::Incomplete(id) => {
                warn!("[{label}] response {id} has neither result nor error, still waiting");
            }
            Inbound::Event(event) => {
                let delivered = AssertUnwindSafe(async { (self.on_message)(event).await })
                    .catch_unwind()
                    .await;
                match delivered {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("[{label}] on_message callback failed: {e:#}"),
                    Err(_) => error!("[{label}] on_message callback panicked, frame dropped"),
                }
            }
        }
    }

    fn spawn_on_connected(self: &Arc<Self>) {
        let Some(callback) = self.on_connected.clone() else {
            return;
        };
        let handle = StreamConnection { inner: Arc::clone(self) };
        let label = self.options.label.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = callback(handle).await {
                error!("[{label}] on_connected callback failed: {e:#}");
            }
        });

        if let Some(previous) = lock(&self.connected_task).replace(task) {
            previous.abort();
        }
    }

    /// Cancel the on-connected task and wait for it, ignoring its outcome.
    async fn cancel_on_connected(&self) {
        let task = lock(&self.connected_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

enum SessionEnd {
    /// `close()` was requested; the socket has been closed.
    Closed,
    /// The socket terminated on its own.
    Lost(StreamError),
}

/// Main connection loop: connect, read, reconnect until closed or the retry
/// policy gives up.
async fn connection_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<Option<u16>>) {
    let label = inner.options.label.clone();
    let mut retry = RetryState::default();

    loop {
        if shutdown_rx.borrow().is_some() {
            break;
        }

        info!("[{label}] connecting to {}", inner.options.uri);
        let connected = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            res = connect_ws(&inner.options) => res,
        };

        let failure = match connected {
            Ok(ws) => {
                retry.reset();
                info!("[{label}] connected");
                let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(64);
                inner.advance(Link::Open(outbound_tx));
                inner.spawn_on_connected();

                match run_session(&inner, ws, outbound_rx, &mut shutdown_rx).await {
                    SessionEnd::Closed => break,
                    SessionEnd::Lost(err) => err,
                }
            }
            Err(err) => err,
        };

        if shutdown_rx.borrow().is_some() {
            break;
        }

        let failures = retry.record_failure(failure.clone());

        // Reconnecting cannot repair a bad handshake configuration.
        let decision = if failure.is_connection_error() {
            inner.retry_policy.next_delay(failures, &failure)
        } else {
            RetryDecision::Stop
        };

        match decision {
            RetryDecision::Stop => {
                error!("[{label}] giving up after {failures} failure(s): {failure}");
                let exhausted = StreamError::RetryExhausted {
                    attempts: failures,
                    last_error: failure.to_string(),
                };
                inner.fail_pending(|| exhausted.clone());
                inner.advance(Link::Exhausted(exhausted));
                break;
            }
            RetryDecision::RetryAfter(delay) => {
                error!("[{label}] socket error {failure}, reconnecting {failures} in {delay:?}...");
                inner.advance(Link::Connecting);
                inner.fail_pending(|| StreamError::ConnectionLost(failure.to_string()));
                inner.retry_policy.on_before_retry(&failure, failures);
                inner.cancel_on_connected().await;
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    inner.cancel_on_connected().await;
    debug!("[{label}] connection loop exited");
}

/// Drive one open socket until it terminates or `close()` is requested.
async fn run_session(
    inner: &Inner,
    ws: WsStream,
    mut outbound: mpsc::Receiver<Message>,
    shutdown_rx: &mut watch::Receiver<Option<u16>>,
) -> SessionEnd {
    let label = &inner.options.label;
    let timeout = inner.options.timeout;
    let (mut ws_write, mut ws_read) = ws.split();

    let idle = tokio::time::sleep(timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                let code = (*shutdown_rx.borrow()).unwrap_or(inner.options.close_code);
                close_socket(&mut ws_write, &mut ws_read, code, inner.options.close_timeout, label).await;
                return SessionEnd::Closed;
            }

            Some(msg) = outbound.recv() => {
                if let Err(e) = ws_write.send(msg).await {
                    return SessionEnd::Lost(StreamError::ConnectionLost(format!("send failed: {e}")));
                }
            }

            frame = ws_read.next() => {
                idle.as_mut().reset(Instant::now() + timeout);
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("[{label}] received close frame: {frame:?}");
                        return SessionEnd::Lost(StreamError::ConnectionLost("closed by server".into()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!("[{label}] ignoring {} byte binary frame", data.len());
                    }
                    Some(Ok(_)) => {} // Pong, raw Frame
                    Some(Err(e)) => {
                        warn!("[{label}] read error: {e}");
                        return SessionEnd::Lost(StreamError::ConnectionLost(e.to_string()));
                    }
                    None => {
                        warn!("[{label}] stream ended");
                        return SessionEnd::Lost(StreamError::ConnectionLost("stream ended".into()));
                    }
                }
            }

            _ = &mut idle => {
                debug!("[{label}] no frame within {timeout:?}, sending ping");
                if let Err(e) = ws_write.send(Message::Ping(Vec::new().into())).await {
                    return SessionEnd::Lost(StreamError::ConnectionLost(format!("ping failed: {e}")));
                }
                idle.as_mut().reset(Instant::now() + timeout);
            }
        }
    }
}

/// Send a close frame and wait (bounded) for the server to acknowledge it.
async fn close_socket(write: &mut WsWrite, read: &mut WsRead, code: u16, wait: Duration, label: &str) {
    let frame = CloseFrame { code: CloseCode::from(code), reason: "".into() };
    if let Err(e) = write.send(Message::Close(Some(frame))).await {
        warn!("[{label}] close frame send failed: {e}");
        return;
    }

    let drained = tokio::time::timeout(wait, async {
        while let Some(Ok(_)) = read.next().await {}
    })
    .await;
    if drained.is_err() {
        warn!("[{label}] close handshake not acknowledged within {wait:?}");
    }
}

/// Open the WebSocket, adding any extra handshake headers.
async fn connect_ws(options: &ConnectionOptions) -> Result<WsStream, StreamError> {
    let mut request = options
        .uri
        .as_str()
        .into_client_request()
        .map_err(|e| StreamError::WebSocket(e.to_string()))?;

    for (key, value) in &options.extra_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| StreamError::Config(format!("header name {key:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| StreamError::Config(format!("header value for {key:?}: {e}")))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| StreamError::WebSocket(e.to_string()))?;
    Ok(stream)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
