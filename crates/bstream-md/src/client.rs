//! `StreamClient`: a [`StreamConnection`] wired to a [`Dispatcher`].
//!
//! Consumers are registered per [`SubscriptionKey`]. The client keeps the
//! server-side subscriptions in line with the registered keys: a new key is
//! subscribed right away when the socket is open, and every (re)connection
//! re-subscribes all keys from the on-connected callback.

use std::sync::Arc;

use bstream_core::StreamError;
use bstream_core::retry::RetryPolicy;
use bstream_core::ws::{ConnState, ConnectionOptions, StreamConnection, on_connected_fn};
use tracing::info;

use crate::decoder::Decoder;
use crate::dispatcher::{Consumer, Dispatcher};
use crate::key::SubscriptionKey;

pub struct StreamClient {
    connection: StreamConnection,
    dispatcher: Arc<Dispatcher>,
}

impl StreamClient {
    pub fn new(
        options: ConnectionOptions,
        retry_policy: Arc<dyn RetryPolicy>,
        decoder: impl Decoder + 'static,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(decoder));
        let registry = Arc::clone(&dispatcher);

        let connection = StreamConnection::builder(options)
            .on_message(dispatcher.inbound_callback())
            .on_connected(on_connected_fn(move |conn| {
                let registry = Arc::clone(&registry);
                async move {
                    resubscribe(&conn, &registry).await?;
                    Ok(())
                }
            }))
            .retry_policy(retry_policy)
            .build();

        Self { connection, dispatcher }
    }

    pub fn connection(&self) -> &StreamConnection {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connect(&self) -> &Self {
        self.connection.connect();
        self
    }

    pub async fn close(&self) -> Result<(), StreamError> {
        self.connection.close().await
    }

    /// Register `consumer` for `key`, subscribing on the server if the key
    /// is new and the socket is open. Otherwise the subscription is sent on
    /// the next connection.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), StreamError> {
        let stream_name = key.stream_name();
        let is_new = self.dispatcher.register(key, consumer);
        if is_new && self.connection.state() == ConnState::Open {
            self.connection.subscribe(vec![stream_name.clone()]).await?;
            info!("[{}] subscribed {stream_name}", self.connection.options().label);
        }
        Ok(())
    }

    /// Drop every consumer of `key` and unsubscribe it on the server.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), StreamError> {
        let existed = self.dispatcher.remove(key);
        if existed && self.connection.state() == ConnState::Open {
            self.connection.unsubscribe(vec![key.stream_name()]).await?;
            info!("[{}] unsubscribed {key}", self.connection.options().label);
        }
        Ok(())
    }

    /// Subscriptions as reported by the server.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>, StreamError> {
        self.connection.list_subscriptions().await
    }
}

async fn resubscribe(conn: &StreamConnection, dispatcher: &Dispatcher) -> Result<(), StreamError> {
    let params = dispatcher.subscription_params();
    if params.is_empty() {
        return Ok(());
    }
    let count = params.len();
    conn.subscribe(params).await?;
    info!("[{}] subscribed {count} stream(s)", conn.options().label);
    Ok(())
}
