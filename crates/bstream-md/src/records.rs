//! Typed market data records decoded from stream events.
//!
//! Field names are spelled out (`trade_time`, `best_bid_price`, ...) instead
//! of the single-letter keys used on the wire. Timestamps stay in exchange
//! milliseconds.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::key::{KlineInterval, StreamType, SubscriptionKey};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub event_time: u64,
    pub symbol: String,
    pub trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    /// Only present on older payloads.
    pub buyer_order_id: Option<u64>,
    pub seller_order_id: Option<u64>,
    pub trade_time: u64,
    pub is_buyer_maker: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggTrade {
    pub event_time: u64,
    pub symbol: String,
    pub agg_trade_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub first_trade_id: u64,
    pub last_trade_id: u64,
    pub trade_time: u64,
    pub is_buyer_maker: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Diff order book update. A level with zero quantity removes the price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookUpdate {
    pub event_time: u64,
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kline {
    pub event_time: u64,
    pub symbol: String,
    pub interval: KlineInterval,
    pub open_time: u64,
    pub close_time: u64,
    /// `-1` when no trade happened in the interval.
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub taker_volume: f64,
    pub taker_quote_volume: f64,
    pub total_trades: u64,
    pub is_closed: bool,
}

/// Rolling 24h statistics, reduced set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiniTicker {
    pub event_time: u64,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
}

/// Rolling 24h statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker {
    pub event_time: u64,
    pub symbol: String,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub weighted_average_price: f64,
    pub first_trade_price: f64,
    pub last_price: f64,
    pub last_quantity: f64,
    pub best_bid_price: f64,
    pub best_bid_quantity: f64,
    pub best_ask_price: f64,
    pub best_ask_quantity: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub stat_open_time: u64,
    pub stat_close_time: u64,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    pub total_trades: u64,
}

/// A decoded record of any supported stream type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Trade(Trade),
    AggTrade(AggTrade),
    OrderBook(OrderBookUpdate),
    Kline(Kline),
    MiniTicker(MiniTicker),
    Ticker(Ticker),
}

impl Record {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade(r) => &r.symbol,
            Self::AggTrade(r) => &r.symbol,
            Self::OrderBook(r) => &r.symbol,
            Self::Kline(r) => &r.symbol,
            Self::MiniTicker(r) => &r.symbol,
            Self::Ticker(r) => &r.symbol,
        }
    }

    pub fn event_time(&self) -> u64 {
        match self {
            Self::Trade(r) => r.event_time,
            Self::AggTrade(r) => r.event_time,
            Self::OrderBook(r) => r.event_time,
            Self::Kline(r) => r.event_time,
            Self::MiniTicker(r) => r.event_time,
            Self::Ticker(r) => r.event_time,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            Self::Trade(_) => StreamType::Trade,
            Self::AggTrade(_) => StreamType::AggTrade,
            Self::OrderBook(_) => StreamType::Depth,
            Self::Kline(k) => StreamType::Kline(k.interval),
            Self::MiniTicker(_) => StreamType::MiniTicker,
            Self::Ticker(_) => StreamType::Ticker,
        }
    }

    /// Key of the subscription this record belongs to.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.symbol(), self.stream_type())
    }

    /// Flatten into a column map: `type`, every record field, and `index`.
    ///
    /// The index is always supplied by the caller; rows from different calls
    /// never share a default.
    pub fn to_row(&self, index: Option<u64>) -> serde_json::Result<Map<String, Value>> {
        let mut row = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        row.insert("index".to_string(), index.map(Value::from).unwrap_or(Value::Null));
        Ok(row)
    }
}
