//! Fan-out of decoded events to per-subscription consumers.
//!
//! The [`Dispatcher`] owns a [`Decoder`] and a map from [`SubscriptionKey`]
//! to the consumers registered for it. Every inbound event is decoded once;
//! each resulting record is then delivered to all consumers of its key
//! concurrently. A consumer that fails or panics is logged and counted, the
//! remaining consumers still receive the record.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use ahash::AHashMap;
use anyhow::Result;
use async_trait::async_trait;
use bstream_core::ws::{OnMessageCallback, on_message_fn};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, error};

use crate::decoder::Decoder;
use crate::key::SubscriptionKey;
use crate::records::Record;

/// Receiver of decoded records.
///
/// Synchronous consumers simply return without awaiting anything; the
/// dispatcher awaits every consumer the same way.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn deliver(&self, key: &SubscriptionKey, record: &Record) -> Result<()>;
}

/// Adapter turning a plain closure into a [`Consumer`].
pub struct FnConsumer<F>(F);

#[async_trait]
impl<F> Consumer for FnConsumer<F>
where
    F: Fn(&SubscriptionKey, &Record) -> Result<()> + Send + Sync,
{
    async fn deliver(&self, key: &SubscriptionKey, record: &Record) -> Result<()> {
        (self.0)(key, record)
    }
}

/// Wrap a synchronous closure as a shareable consumer.
pub fn consumer_fn<F>(f: F) -> Arc<dyn Consumer>
where
    F: Fn(&SubscriptionKey, &Record) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnConsumer(f))
}

/// Outcome counters of one [`Dispatcher::handle_inbound`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records produced by the decoder.
    pub records: usize,
    /// Successful consumer deliveries.
    pub delivered: usize,
    /// Deliveries that returned an error or panicked.
    pub failed: usize,
}

type ConsumerMap = AHashMap<SubscriptionKey, Vec<Arc<dyn Consumer>>>;

pub struct Dispatcher {
    decoder: Arc<dyn Decoder>,
    consumers: RwLock<ConsumerMap>,
}

impl Dispatcher {
    pub fn new(decoder: impl Decoder + 'static) -> Self {
        Self { decoder: Arc::new(decoder), consumers: RwLock::new(AHashMap::new()) }
    }

    /// Add `consumer` to the set for `key`. Registering the same consumer
    /// twice is a no-op. Returns `true` if `key` had no consumers before.
    pub fn register(&self, key: SubscriptionKey, consumer: Arc<dyn Consumer>) -> bool {
        let mut map = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        let set = map.entry(key).or_default();
        let is_new = set.is_empty();
        if !set.iter().any(|c| Arc::ptr_eq(c, &consumer)) {
            set.push(consumer);
        }
        is_new
    }

    /// Remove one consumer. Returns `true` if `key` has no consumers left.
    pub fn unregister(&self, key: &SubscriptionKey, consumer: &Arc<dyn Consumer>) -> bool {
        let mut map = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = map.get_mut(key) else {
            return false;
        };
        set.retain(|c| !Arc::ptr_eq(c, consumer));
        if set.is_empty() {
            map.remove(key);
            return true;
        }
        false
    }

    /// Drop every consumer of `key`. Returns `true` if the key was registered.
    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Sorted stream names of all registered keys, as `SUBSCRIBE` params.
    pub fn subscription_params(&self) -> Vec<String> {
        let mut params: Vec<String> = self.keys().iter().map(SubscriptionKey::stream_name).collect();
        params.sort();
        params
    }

    fn consumers_for(&self, key: &SubscriptionKey) -> Vec<Arc<dyn Consumer>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Decode `event` and deliver every record to the consumers of its key.
    ///
    /// A decoder panic is logged and the event counts as decoding to nothing.
    pub async fn handle_inbound(&self, event: Value) -> DispatchReport {
        let decoded = match panic::catch_unwind(AssertUnwindSafe(|| self.decoder.decode(&event))) {
            Ok(decoded) => decoded,
            Err(panic) => {
                error!("[dispatch] decoder panicked: {}", panic_message(&*panic));
                return DispatchReport::default();
            }
        };
        let mut report = DispatchReport { records: decoded.len(), ..Default::default() };
        if decoded.is_empty() {
            debug!("[dispatch] event decoded to no records");
            return report;
        }

        let mut deliveries = Vec::new();
        for (key, record) in &decoded {
            let consumers = self.consumers_for(key);
            if consumers.is_empty() {
                debug!("[dispatch] no consumer for {key}");
                continue;
            }
            for consumer in consumers {
                deliveries.push(async move {
                    let outcome = AssertUnwindSafe(consumer.deliver(key, record)).catch_unwind().await;
                    (key, outcome)
                });
            }
        }

        for (key, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    error!("[dispatch] consumer for {key} failed: {e:#}");
                }
                Err(panic) => {
                    report.failed += 1;
                    error!("[dispatch] consumer for {key} panicked: {}", panic_message(&*panic));
                }
            }
        }
        report
    }

    /// Callback feeding inbound connection events into this dispatcher.
    pub fn inbound_callback(self: &Arc<Self>) -> OnMessageCallback {
        let dispatcher = Arc::clone(self);
        on_message_fn(move |event| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher.handle_inbound(event).await;
                Ok(())
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::bail;
    use serde_json::json;

    use super::*;
    use crate::decoder::BinanceDecoder;

    fn trade_event(symbol: &str) -> Value {
        json!({
            "stream": format!("{}@trade", symbol.to_lowercase()),
            "data": {"e": "trade", "E": 1, "s": symbol, "t": 7, "p": "100.5", "q": "2",
                     "T": 1, "m": false}
        })
    }

    fn trade_key() -> SubscriptionKey {
        "btcusdt@trade".parse().unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn Consumer>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let consumer = consumer_fn(move |_key, _record| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, consumer)
    }

    /// Collects symbols after yielding to the runtime.
    struct SlowCollector {
        symbols: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Consumer for SlowCollector {
        async fn deliver(&self, _key: &SubscriptionKey, record: &Record) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.symbols.lock().unwrap().push(record.symbol().to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Consumer for Failing {
        async fn deliver(&self, key: &SubscriptionKey, _record: &Record) -> Result<()> {
            bail!("cannot handle {key}")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Consumer for Panicking {
        async fn deliver(&self, _key: &SubscriptionKey, _record: &Record) -> Result<()> {
            panic!("consumer blew up")
        }
    }

    #[tokio::test]
    async fn delivers_to_sync_and_async_consumers() {
        let dispatcher = Dispatcher::new(BinanceDecoder);
        let (count, sync_consumer) = counter();
        let collector = Arc::new(SlowCollector { symbols: Mutex::new(Vec::new()) });

        assert!(dispatcher.register(trade_key(), sync_consumer));
        assert!(!dispatcher.register(trade_key(), collector.clone()));

        let report = dispatcher.handle_inbound(trade_event("BTCUSDT")).await;
        assert_eq!(report, DispatchReport { records: 1, delivered: 2, failed: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*collector.symbols.lock().unwrap(), vec!["BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn failures_do_not_poison_other_consumers() {
        let dispatcher = Dispatcher::new(BinanceDecoder);
        let (count, consumer) = counter();
        dispatcher.register(trade_key(), Arc::new(Failing));
        dispatcher.register(trade_key(), Arc::new(Panicking));
        dispatcher.register(trade_key(), consumer);

        let report = dispatcher.handle_inbound(trade_event("BTCUSDT")).await;
        assert_eq!(report, DispatchReport { records: 1, delivered: 1, failed: 2 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let dispatcher = Dispatcher::new(BinanceDecoder);
        let (count, consumer) = counter();
        dispatcher.register(trade_key(), consumer.clone());
        dispatcher.register(trade_key(), consumer.clone());

        let report = dispatcher.handle_inbound(trade_event("BTCUSDT")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(dispatcher.unregister(&trade_key(), &consumer));
        assert!(dispatcher.keys().is_empty());
    }

    #[tokio::test]
    async fn unmatched_and_undecodable_events() {
        let dispatcher = Dispatcher::new(BinanceDecoder);
        let (count, consumer) = counter();
        dispatcher.register(trade_key(), consumer);

        let report = dispatcher.handle_inbound(trade_event("ETHUSDT")).await;
        assert_eq!(report, DispatchReport { records: 1, delivered: 0, failed: 0 });

        let report = dispatcher.handle_inbound(json!({"result": null, "id": 3})).await;
        assert_eq!(report, DispatchReport::default());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    /// Panics on anything carrying a `boom` field, otherwise defers to Binance.
    struct ExplodingDecoder;

    impl Decoder for ExplodingDecoder {
        fn decode(&self, event: &Value) -> Vec<(SubscriptionKey, Record)> {
            if event.get("boom").is_some() {
                panic!("decoder cannot handle {event}");
            }
            BinanceDecoder.decode(event)
        }
    }

    #[tokio::test]
    async fn decoder_panic_is_isolated() {
        let dispatcher = Dispatcher::new(ExplodingDecoder);
        let (count, consumer) = counter();
        dispatcher.register(trade_key(), consumer);

        let report = dispatcher.handle_inbound(json!({"boom": 1})).await;
        assert_eq!(report, DispatchReport::default());

        let report = dispatcher.handle_inbound(trade_event("BTCUSDT")).await;
        assert_eq!(report, DispatchReport { records: 1, delivered: 1, failed: 0 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_params_are_sorted() {
        let dispatcher = Dispatcher::new(BinanceDecoder);
        let (_, consumer) = counter();
        for key in ["ethusdt@ticker", "btcusdt@kline_1m", "btcusdt@depth"] {
            dispatcher.register(key.parse().unwrap(), consumer.clone());
        }
        assert_eq!(
            dispatcher.subscription_params(),
            ["btcusdt@depth", "btcusdt@kline_1m", "ethusdt@ticker"]
        );
        assert!(dispatcher.remove(&"btcusdt@depth".parse().unwrap()));
        assert!(!dispatcher.remove(&"btcusdt@depth".parse().unwrap()));
        assert_eq!(dispatcher.keys().len(), 2);
    }
}
