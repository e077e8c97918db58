//! Decoding of raw stream events into typed records.
//!
//! A [`Decoder`] receives one already-parsed JSON event and returns zero or
//! more `(key, record)` pairs. It never fails: anything it does not
//! recognise (subscription acks, unknown event types, missing fields)
//! decodes to an empty list.

use serde_json::Value;

use crate::json_util::{
    bool_field, parse_f64_field, parse_i64_field, parse_levels, parse_u64_field, str_field,
};
use crate::key::SubscriptionKey;
use crate::records::{AggTrade, Kline, MiniTicker, OrderBookUpdate, Record, Ticker, Trade};

/// Stateless event decoder.
pub trait Decoder: Send + Sync {
    fn decode(&self, event: &Value) -> Vec<(SubscriptionKey, Record)>;
}

/// Decoder for Binance spot market streams.
///
/// Accepts raw payloads (`{"e": "trade", ...}`), combined-stream envelopes
/// (`{"stream": "btcusdt@trade", "data": {...}}`) and arrays of payloads
/// (`!miniTicker@arr`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceDecoder;

impl Decoder for BinanceDecoder {
    fn decode(&self, event: &Value) -> Vec<(SubscriptionKey, Record)> {
        let payload = event.get("data").unwrap_or(event);
        match payload {
            Value::Array(items) => items.iter().filter_map(decode_payload).collect(),
            _ => decode_payload(payload).into_iter().collect(),
        }
    }
}

fn decode_payload(v: &Value) -> Option<(SubscriptionKey, Record)> {
    let record = match str_field(v, "e")? {
        "trade" => parse_trade(v),
        "aggTrade" => parse_agg_trade(v),
        "depthUpdate" => parse_depth_update(v),
        "kline" => parse_kline(v),
        "24hrMiniTicker" => parse_mini_ticker(v),
        "24hrTicker" => parse_ticker(v),
        _ => None,
    }?;
    Some((record.key(), record))
}

// ---------------------------------------------------------------------------
// Individual parsers
// ---------------------------------------------------------------------------

fn parse_trade(v: &Value) -> Option<Record> {
    Some(Record::Trade(Trade {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s")?.to_string(),
        trade_id: parse_u64_field(v, "t")?,
        price: parse_f64_field(v, "p")?,
        quantity: parse_f64_field(v, "q")?,
        buyer_order_id: parse_u64_field(v, "b"),
        seller_order_id: parse_u64_field(v, "a"),
        trade_time: parse_u64_field(v, "T")?,
        is_buyer_maker: bool_field(v, "m")?,
    }))
}

fn parse_agg_trade(v: &Value) -> Option<Record> {
    Some(Record::AggTrade(AggTrade {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s")?.to_string(),
        agg_trade_id: parse_u64_field(v, "a")?,
        price: parse_f64_field(v, "p")?,
        quantity: parse_f64_field(v, "q")?,
        first_trade_id: parse_u64_field(v, "f")?,
        last_trade_id: parse_u64_field(v, "l")?,
        trade_time: parse_u64_field(v, "T")?,
        is_buyer_maker: bool_field(v, "m")?,
    }))
}

fn parse_depth_update(v: &Value) -> Option<Record> {
    Some(Record::OrderBook(OrderBookUpdate {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s")?.to_string(),
        first_update_id: parse_u64_field(v, "U")?,
        last_update_id: parse_u64_field(v, "u")?,
        bids: parse_levels(v.get("b")?.as_array()?),
        asks: parse_levels(v.get("a")?.as_array()?),
    }))
}

fn parse_kline(v: &Value) -> Option<Record> {
    // OHLC fields live in the nested "k" object; event time stays outside.
    let k = v.get("k")?;
    Some(Record::Kline(Kline {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s").or_else(|| str_field(k, "s"))?.to_string(),
        interval: str_field(k, "i")?.parse().ok()?,
        open_time: parse_u64_field(k, "t")?,
        close_time: parse_u64_field(k, "T")?,
        first_trade_id: parse_i64_field(k, "f").unwrap_or(-1),
        last_trade_id: parse_i64_field(k, "L").unwrap_or(-1),
        open: parse_f64_field(k, "o")?,
        high: parse_f64_field(k, "h")?,
        low: parse_f64_field(k, "l")?,
        close: parse_f64_field(k, "c")?,
        volume: parse_f64_field(k, "v")?,
        quote_volume: parse_f64_field(k, "q")?,
        taker_volume: parse_f64_field(k, "V").unwrap_or(0.0),
        taker_quote_volume: parse_f64_field(k, "Q").unwrap_or(0.0),
        total_trades: parse_u64_field(k, "n").unwrap_or(0),
        is_closed: bool_field(k, "x").unwrap_or(false),
    }))
}

fn parse_mini_ticker(v: &Value) -> Option<Record> {
    Some(Record::MiniTicker(MiniTicker {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s")?.to_string(),
        open: parse_f64_field(v, "o")?,
        high: parse_f64_field(v, "h")?,
        low: parse_f64_field(v, "l")?,
        close: parse_f64_field(v, "c")?,
        volume: parse_f64_field(v, "v")?,
        quote_volume: parse_f64_field(v, "q")?,
    }))
}

fn parse_ticker(v: &Value) -> Option<Record> {
    Some(Record::Ticker(Ticker {
        event_time: parse_u64_field(v, "E").unwrap_or(0),
        symbol: str_field(v, "s")?.to_string(),
        price_change: parse_f64_field(v, "p")?,
        price_change_percent: parse_f64_field(v, "P")?,
        weighted_average_price: parse_f64_field(v, "w")?,
        first_trade_price: parse_f64_field(v, "x").unwrap_or(0.0),
        last_price: parse_f64_field(v, "c")?,
        last_quantity: parse_f64_field(v, "Q").unwrap_or(0.0),
        best_bid_price: parse_f64_field(v, "b")?,
        best_bid_quantity: parse_f64_field(v, "B")?,
        best_ask_price: parse_f64_field(v, "a")?,
        best_ask_quantity: parse_f64_field(v, "A")?,
        open: parse_f64_field(v, "o")?,
        high: parse_f64_field(v, "h")?,
        low: parse_f64_field(v, "l")?,
        volume: parse_f64_field(v, "v")?,
        quote_volume: parse_f64_field(v, "q")?,
        stat_open_time: parse_u64_field(v, "O")?,
        stat_close_time: parse_u64_field(v, "C")?,
        first_trade_id: parse_i64_field(v, "F").unwrap_or(-1),
        last_trade_id: parse_i64_field(v, "L").unwrap_or(-1),
        total_trades: parse_u64_field(v, "n").unwrap_or(0),
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::key::{KlineInterval, StreamType};

    fn decode(v: Value) -> Vec<(SubscriptionKey, Record)> {
        BinanceDecoder.decode(&v)
    }

    #[test]
    fn decode_trade() {
        let out = decode(json!({
            "e": "trade", "E": 1672515782136u64, "s": "BNBBTC", "t": 12345,
            "p": "0.001", "q": "100", "T": 1672515782136u64, "m": true, "M": true
        }));
        assert_eq!(out.len(), 1);
        let (key, record) = &out[0];
        assert_eq!(key.to_string(), "bnbbtc@trade");
        match record {
            Record::Trade(t) => {
                assert_eq!(t.trade_id, 12345);
                assert!((t.price - 0.001).abs() < 1e-12);
                assert_eq!(t.buyer_order_id, None);
                assert!(t.is_buyer_maker);
            }
            other => panic!("expected Trade, got {other:?}"),
        }
    }

    #[test]
    fn decode_agg_trade_in_envelope() {
        let out = decode(json!({
            "stream": "btcusdt@aggTrade",
            "data": {"e":"aggTrade","E":1672515782136u64,"s":"BTCUSDT","a":123456789,"p":"16500.50",
                     "q":"0.001","f":100,"l":105,"T":1672515782136u64,"m":true}
        }));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.to_string(), "btcusdt@aggTrade");
        match &out[0].1 {
            Record::AggTrade(a) => {
                assert_eq!(a.agg_trade_id, 123456789);
                assert_eq!((a.first_trade_id, a.last_trade_id), (100, 105));
            }
            other => panic!("expected AggTrade, got {other:?}"),
        }
    }

    #[test]
    fn decode_depth_update() {
        let out = decode(json!({
            "e": "depthUpdate", "E": 123456789, "s": "BNBBTC", "U": 157, "u": 160,
            "b": [["0.0024", "10"]], "a": [["0.0026", "100"], ["0.0027", "0"]]
        }));
        let (key, record) = &out[0];
        assert_eq!(key.stream, StreamType::Depth);
        match record {
            Record::OrderBook(book) => {
                assert_eq!(book.bids.len(), 1);
                assert_eq!(book.asks.len(), 2);
                assert_eq!(book.asks[1].quantity, 0.0);
            }
            other => panic!("expected OrderBook, got {other:?}"),
        }
    }

    #[test]
    fn decode_kline() {
        let out = decode(json!({
            "e": "kline", "E": 123456789, "s": "BNBBTC",
            "k": {"t": 123400000, "T": 123460000, "s": "BNBBTC", "i": "1m", "f": 100, "L": 200,
                  "o": "0.0010", "c": "0.0020", "h": "0.0025", "l": "0.0015", "v": "1000",
                  "n": 100, "x": false, "q": "1.0000", "V": "500", "Q": "0.500", "B": "123456"}
        }));
        let (key, record) = &out[0];
        assert_eq!(key.stream, StreamType::Kline(KlineInterval::M1));
        match record {
            Record::Kline(k) => {
                assert_eq!(k.event_time, 123456789);
                assert_eq!(k.total_trades, 100);
                assert!((k.high - 0.0025).abs() < 1e-12);
                assert!(!k.is_closed);
            }
            other => panic!("expected Kline, got {other:?}"),
        }
    }

    #[test]
    fn decode_mini_ticker_array() {
        let out = decode(json!([
            {"e":"24hrMiniTicker","E":1,"s":"BNBBTC","c":"0.0025","o":"0.0010","h":"0.0025","l":"0.0010","v":"10000","q":"18"},
            {"e":"24hrMiniTicker","E":1,"s":"ETHBTC","c":"0.05","o":"0.04","h":"0.06","l":"0.03","v":"100","q":"5"}
        ]));
        let keys: Vec<String> = out.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["bnbbtc@miniTicker", "ethbtc@miniTicker"]);
    }

    #[test]
    fn decode_ticker() {
        let out = decode(json!({
            "e":"24hrTicker","E":123456789,"s":"BNBBTC","p":"0.0015","P":"250.00","w":"0.0018",
            "x":"0.0009","c":"0.0025","Q":"10","b":"0.0024","B":"10","a":"0.0026","A":"100",
            "o":"0.0010","h":"0.0025","l":"0.0010","v":"10000","q":"18","O":0,"C":86400000,
            "F":0,"L":18150,"n":18151
        }));
        match &out[0].1 {
            Record::Ticker(t) => {
                assert!((t.price_change_percent - 250.0).abs() < 1e-9);
                assert_eq!(t.total_trades, 18151);
                assert_eq!(t.stat_close_time, 86_400_000);
            }
            other => panic!("expected Ticker, got {other:?}"),
        }
    }

    #[test]
    fn unknown_or_malformed_events_decode_to_nothing() {
        assert!(decode(json!({"id": 1, "result": null})).is_empty());
        assert!(decode(json!({"e": "bookTicker", "s": "BTCUSDT"})).is_empty());
        assert!(decode(json!({"e": "trade", "s": "BTCUSDT"})).is_empty());
        assert!(decode(json!("just a string")).is_empty());
        assert!(decode(json!({"e": "kline", "s": "X", "k": {"i": "7m"}})).is_empty());
    }
}
