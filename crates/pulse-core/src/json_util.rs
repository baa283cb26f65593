//! Lenient JSON helpers shared by the wire decoders and the REST fallback.
//!
//! Backend payloads are loosely typed: numeric values arrive either as JSON
//! numbers (`30000.5`) or as strings (`"30000.5"`), and list endpoints may
//! return a bare array or wrap it in `{"data": [...]}`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s.trim()).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `i64`.
#[inline]
pub fn parse_str_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.trim().parse().ok()
    } else {
        v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
    }
}

/// `deserialize_with` adapter: number or numeric string → `f64`.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    parse_str_f64(Some(&v))
        .ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}")))
}

/// `deserialize_with` adapter for optional numeric fields; `null` maps to `None`.
pub fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_str_f64(Some(&v))
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected number, got {v}"))),
    }
}

/// `deserialize_with` adapter: number or numeric string → `i64` timestamp.
pub fn de_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    parse_str_i64(Some(&v))
        .ok_or_else(|| serde::de::Error::custom(format!("expected integer, got {v}")))
}

/// `deserialize_with` adapter: string or number → `String` (ids are sent both ways).
pub fn de_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string id, got {other}"))),
    }
}

/// Return the list inside a response body: either the body itself when it is
/// an array, or its `data` / `items` field.
pub fn unwrap_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "de_f64")]
        px: f64,
        #[serde(default, deserialize_with = "de_opt_f64")]
        pnl: Option<f64>,
        #[serde(deserialize_with = "de_i64")]
        ts: i64,
        #[serde(deserialize_with = "de_string")]
        id: String,
    }

    #[test]
    fn numbers_and_strings() {
        let a: Probe = serde_json::from_value(json!({"px": "30000.5", "pnl": 1.5, "ts": "17", "id": 42})).unwrap();
        assert!((a.px - 30000.5).abs() < 1e-9);
        assert_eq!(a.pnl, Some(1.5));
        assert_eq!(a.ts, 17);
        assert_eq!(a.id, "42");

        let b: Probe = serde_json::from_value(json!({"px": 1, "pnl": null, "ts": 5, "id": "P1"})).unwrap();
        assert_eq!(b.pnl, None);
        assert_eq!(b.id, "P1");
    }

    #[test]
    fn rejects_garbage_number() {
        let r: Result<Probe, _> = serde_json::from_value(json!({"px": "abc", "ts": 1, "id": "x"}));
        assert!(r.is_err());
    }

    #[test]
    fn unwrap_list_shapes() {
        assert_eq!(unwrap_list(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(unwrap_list(json!({"data": [1]})).unwrap().len(), 1);
        assert!(unwrap_list(json!({"error": "nope"})).is_none());
    }
}
