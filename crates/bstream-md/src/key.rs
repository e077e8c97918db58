//! Subscription keys: `<symbol>@<stream type>`, e.g. `btcusdt@kline_1m`.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("subscription key {0:?} has no '@' separator")]
    MissingSeparator(String),
    #[error("empty symbol in {0:?}")]
    EmptySymbol(String),
    #[error("unknown stream type {0:?}")]
    UnknownStream(String),
    #[error("unknown kline interval {0:?}")]
    UnknownInterval(String),
}

/// Kline (candlestick) interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KlineInterval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl KlineInterval {
    pub const ALL: [KlineInterval; 15] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for KlineInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for KlineInterval {
    type Err = KeyError;

    // Case-sensitive: "1m" is one minute, "1M" one month.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| KeyError::UnknownInterval(s.to_string()))
    }
}

/// Stream type suffix of a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Trade,
    AggTrade,
    /// Diff order book (`depthUpdate` events).
    Depth,
    Kline(KlineInterval),
    MiniTicker,
    Ticker,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trade => f.write_str("trade"),
            Self::AggTrade => f.write_str("aggTrade"),
            Self::Depth => f.write_str("depth"),
            Self::Kline(interval) => write!(f, "kline_{interval}"),
            Self::MiniTicker => f.write_str("miniTicker"),
            Self::Ticker => f.write_str("ticker"),
        }
    }
}

impl FromStr for StreamType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(Self::Trade),
            "aggTrade" => Ok(Self::AggTrade),
            "depth" => Ok(Self::Depth),
            "miniTicker" => Ok(Self::MiniTicker),
            "ticker" => Ok(Self::Ticker),
            other => match other.strip_prefix("kline_") {
                Some(interval) => Ok(Self::Kline(interval.parse()?)),
                None => Err(KeyError::UnknownStream(other.to_string())),
            },
        }
    }
}

/// `symbol` + stream type. Symbols are stored lowercase, the way Binance
/// names its streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub stream: StreamType,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, stream: StreamType) -> Self {
        Self { symbol: symbol.to_lowercase(), stream }
    }

    /// Stream name as sent in `SUBSCRIBE` params.
    pub fn stream_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.stream)
    }
}

impl FromStr for SubscriptionKey {
    type Err = KeyError;

    /// Accepts `btcusdt@depth` as well as `btcusdt@depth@100ms`; the update
    /// speed suffix does not change the key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('@');
        let symbol = parts.next().unwrap_or_default();
        let stream = parts.next().ok_or_else(|| KeyError::MissingSeparator(s.to_string()))?;
        if symbol.is_empty() {
            return Err(KeyError::EmptySymbol(s.to_string()));
        }
        Ok(Self::new(symbol, stream.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip_display() {
        let key: SubscriptionKey = "BTCUSDT@kline_1M".parse().unwrap();
        assert_eq!(key.symbol, "btcusdt");
        assert_eq!(key.stream, StreamType::Kline(KlineInterval::Mo1));
        assert_eq!(key.to_string(), "btcusdt@kline_1M");
    }

    #[test]
    fn update_speed_suffix_is_ignored() {
        let key: SubscriptionKey = "ethusdt@depth@100ms".parse().unwrap();
        assert_eq!(key, SubscriptionKey::new("ETHUSDT", StreamType::Depth));
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!(
            "btcusdt".parse::<SubscriptionKey>(),
            Err(KeyError::MissingSeparator("btcusdt".into()))
        );
        assert_eq!(
            "@ticker".parse::<SubscriptionKey>(),
            Err(KeyError::EmptySymbol("@ticker".into()))
        );
        assert_eq!(
            "btcusdt@bookTicker".parse::<SubscriptionKey>(),
            Err(KeyError::UnknownStream("bookTicker".into()))
        );
        assert_eq!(
            "btcusdt@kline_2m".parse::<SubscriptionKey>(),
            Err(KeyError::UnknownInterval("2m".into()))
        );
    }

    #[test]
    fn minute_and_month_intervals_differ() {
        assert_eq!("1m".parse::<KlineInterval>().unwrap(), KlineInterval::M1);
        assert_eq!("1M".parse::<KlineInterval>().unwrap(), KlineInterval::Mo1);
    }
}
