//! # bstream-md
//!
//! Market data layer on top of the `bstream-core` stream connection.
//!
//! ## Architecture
//!
//! Inbound events that do not answer a request are handed to the
//! [`dispatcher::Dispatcher`]. It decodes them with a [`decoder::Decoder`]
//! into typed [`records::Record`]s and fans each record out to the consumers
//! registered for its [`key::SubscriptionKey`].
//!
//! - [`key`]: subscription keys and stream types
//! - [`records`]: typed market data records
//! - [`decoder`]: Binance event decoding
//! - [`dispatcher`]: per-key consumer fan-out
//! - [`client`]: connection + dispatcher facade
//! - [`json_util`]: JSON parsing helpers

pub mod client;
pub mod decoder;
pub mod dispatcher;
pub mod json_util;
pub mod key;
pub mod records;

pub use client::StreamClient;
pub use decoder::{BinanceDecoder, Decoder};
pub use dispatcher::{Consumer, DispatchReport, Dispatcher, consumer_fn};
pub use key::{KlineInterval, StreamType, SubscriptionKey};
pub use records::Record;
