//! JSON field helpers shared by the decoders.
//!
//! Binance encodes prices and quantities as strings (`"30000.5"`) and ids as
//! numbers; these helpers accept either representation.

use serde_json::Value;

use crate::records::PriceLevel;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a JSON value (string or number) as `i64`.
#[inline]
pub fn parse_str_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_i64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

#[inline]
pub fn parse_u64_field(v: &Value, key: &str) -> Option<u64> {
    parse_str_u64(v.get(key))
}

#[inline]
pub fn parse_i64_field(v: &Value, key: &str) -> Option<i64> {
    parse_str_i64(v.get(key))
}

#[inline]
pub fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)?.as_str()
}

#[inline]
pub fn bool_field(v: &Value, key: &str) -> Option<bool> {
    v.get(key)?.as_bool()
}

/// Parse `[["price", "qty"], ...]` level arrays. Malformed levels are skipped.
pub fn parse_levels(levels: &[Value]) -> Vec<PriceLevel> {
    levels
        .iter()
        .filter_map(|level| {
            let arr = level.as_array()?;
            Some(PriceLevel {
                price: parse_str_f64(arr.first())?,
                quantity: parse_str_f64(arr.get(1))?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numbers_from_strings_or_numbers() {
        let v = json!({"p": "16500.50", "q": 0.25, "t": "42", "f": -1});
        assert_eq!(parse_f64_field(&v, "p"), Some(16500.5));
        assert_eq!(parse_f64_field(&v, "q"), Some(0.25));
        assert_eq!(parse_u64_field(&v, "t"), Some(42));
        assert_eq!(parse_i64_field(&v, "f"), Some(-1));
        assert_eq!(parse_f64_field(&v, "missing"), None);
    }

    #[test]
    fn levels_skip_malformed_entries() {
        let levels = json!([["0.0024", "10"], ["bad"], "x", ["0.0026", "100"]]);
        let parsed = parse_levels(levels.as_array().unwrap());
        assert_eq!(
            parsed,
            vec![
                PriceLevel { price: 0.0024, quantity: 10.0 },
                PriceLevel { price: 0.0026, quantity: 100.0 },
            ]
        );
    }
}
