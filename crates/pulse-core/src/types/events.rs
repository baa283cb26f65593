//! Domain events carried in the `data` field of channel events.
//!
//! Field names follow the backend's camelCase JSON. Numeric fields accept
//! numbers or numeric strings; unknown fields are ignored.

use serde::{Deserialize, Serialize};

use super::enums::PositionStatus;
use crate::error::PulseError;
use crate::json_util::{de_f64, de_i64, de_opt_f64, de_string};

/// A position lifecycle event on the `positions` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionEvent {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
    #[serde(deserialize_with = "de_string")]
    pub trader_id: String,
    pub symbol: String,
    #[serde(default)]
    pub action: String,
    #[serde(deserialize_with = "de_f64")]
    pub quantity: f64,
    #[serde(deserialize_with = "de_f64")]
    pub entry_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub current_price: f64,
    #[serde(rename = "unrealizedPnL", alias = "unrealizedPnl", deserialize_with = "de_f64")]
    pub unrealized_pnl: f64,
    #[serde(
        rename = "realizedPnL",
        alias = "realizedPnl",
        default,
        deserialize_with = "de_opt_f64"
    )]
    pub realized_pnl: Option<f64>,
    pub status: PositionStatus,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(deserialize_with = "de_i64")]
    pub timestamp: i64,
}

fn default_true() -> bool {
    true
}

impl PositionEvent {
    /// Decode a `positions` payload, normalizing `isActive` for closed positions.
    pub fn from_slice(payload: &[u8]) -> Result<Self, PulseError> {
        let mut event: PositionEvent = serde_json::from_slice(payload)
            .map_err(|e| PulseError::protocol(format!("bad position event: {e}")))?;
        if event.status == PositionStatus::Closed {
            event.is_active = false;
        }
        Ok(event)
    }

    /// `true` when this event ends the position's life.
    pub fn is_terminal(&self) -> bool {
        self.status == PositionStatus::Closed || !self.is_active
    }
}

/// A trader lifecycle transition on the `trader-status` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderStatusEvent {
    #[serde(deserialize_with = "de_string")]
    pub trader_id: String,
    #[serde(default, alias = "name")]
    pub trader_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(deserialize_with = "de_i64")]
    pub timestamp: i64,
}

/// A risk alert on the `risk-alerts` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlertEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub trader_id: Option<String>,
    #[serde(default = "default_severity", alias = "level")]
    pub severity: String,
    pub message: String,
    #[serde(deserialize_with = "de_i64")]
    pub timestamp: i64,
}

fn default_severity() -> String {
    "INFO".to_string()
}

/// A candlestick update on the `market-data` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleEvent {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(alias = "interval")]
    pub timeframe: String,
    #[serde(alias = "time", alias = "openTime", deserialize_with = "de_i64")]
    pub timestamp: i64,
    #[serde(deserialize_with = "de_f64")]
    pub open: f64,
    #[serde(deserialize_with = "de_f64")]
    pub high: f64,
    #[serde(deserialize_with = "de_f64")]
    pub low: f64,
    #[serde(deserialize_with = "de_f64")]
    pub close: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub volume: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_event_decodes_and_normalizes_closed() {
        let json = br#"{
            "id": "P1", "traderId": 7, "symbol": "BTCUSDT", "action": "BUY",
            "quantity": "0.5", "entryPrice": 30000, "currentPrice": 30100.5,
            "unrealizedPnL": 50.25, "status": "CLOSED", "isActive": true,
            "timestamp": 1700000000000, "exchange": "binance"
        }"#;
        let ev = PositionEvent::from_slice(json).unwrap();
        assert_eq!(ev.trader_id, "7");
        assert!((ev.quantity - 0.5).abs() < 1e-12);
        assert_eq!(ev.realized_pnl, None);
        assert_eq!(ev.status, PositionStatus::Closed);
        assert!(!ev.is_active);
        assert!(ev.is_terminal());
    }

    #[test]
    fn position_event_missing_field_is_error() {
        assert!(PositionEvent::from_slice(br#"{"id":"P1","status":"OPEN"}"#).is_err());
    }

    #[test]
    fn candle_event_aliases() {
        let c: CandleEvent = serde_json::from_str(
            r#"{"interval":"1m","time":60000,"open":"1","high":"2","low":"0.5","close":"1.5"}"#,
        )
        .unwrap();
        assert_eq!(c.timeframe, "1m");
        assert_eq!(c.timestamp, 60_000);
        assert_eq!(c.volume, 0.0);
    }
}
