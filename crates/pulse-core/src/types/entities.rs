//! Normalized, client-facing value objects.
//!
//! These are independent of the wire format. The same structs deserialize the
//! REST fallback snapshots, so field aliases cover the backend's spellings.

use serde::{Deserialize, Serialize};

use super::enums::{PositionStatus, Side};
use super::events::{CandleEvent, PositionEvent, RiskAlertEvent, TraderStatusEvent};
use crate::json_util::{de_f64, de_i64, de_string};

/// Entities stored in keyed collections.
pub trait Keyed {
    fn key(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OpenPosition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPosition {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
    #[serde(default, alias = "traderId", deserialize_with = "de_string")]
    pub trader_name: String,
    pub symbol: String,
    #[serde(alias = "quantity", deserialize_with = "de_f64")]
    pub size: f64,
    #[serde(deserialize_with = "de_f64")]
    pub entry_price: f64,
    #[serde(alias = "currentPrice", deserialize_with = "de_f64")]
    pub mark_price: f64,
    #[serde(alias = "unrealizedPnL", alias = "unrealizedPnl", deserialize_with = "de_f64")]
    pub pnl: f64,
    #[serde(default = "default_open")]
    pub status: PositionStatus,
}

fn default_open() -> PositionStatus {
    PositionStatus::Open
}

impl OpenPosition {
    /// Normalize a push event; `trader_name` is resolved by the caller.
    pub fn from_event(event: &PositionEvent, trader_name: String) -> Self {
        Self {
            id: event.id.clone(),
            trader_name,
            symbol: event.symbol.clone(),
            size: event.quantity,
            entry_price: event.entry_price,
            mark_price: event.current_price,
            pnl: event.unrealized_pnl,
            status: event.status,
        }
    }
}

impl Keyed for OpenPosition {
    fn key(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// TradeRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    #[serde(deserialize_with = "de_string")]
    pub id: String,
    #[serde(default, alias = "traderId", deserialize_with = "de_string")]
    pub trader_name: String,
    pub symbol: String,
    pub side: Side,
    #[serde(alias = "quantity", deserialize_with = "de_f64")]
    pub qty: f64,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(default, alias = "realizedPnL", deserialize_with = "de_f64")]
    pub pnl: f64,
    #[serde(deserialize_with = "de_i64")]
    pub timestamp: i64,
}

impl TradeRecord {
    /// The completed trade implied by a closing position event.
    ///
    /// Returns `None` when the event's `action` carries no direction.
    pub fn from_closed_position(event: &PositionEvent, trader_name: String) -> Option<Self> {
        Some(Self {
            id: event.id.clone(),
            trader_name,
            symbol: event.symbol.clone(),
            side: Side::from_action(&event.action)?,
            qty: event.quantity,
            price: event.current_price,
            pnl: event.realized_pnl.unwrap_or(event.unrealized_pnl),
            timestamp: event.timestamp,
        })
    }
}

impl Keyed for TradeRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

// ---------------------------------------------------------------------------
// Candlestick
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candlestick {
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

impl From<&CandleEvent> for Candlestick {
    fn from(ev: &CandleEvent) -> Self {
        Self {
            timestamp: ev.timestamp,
            open: ev.open,
            high: ev.high,
            low: ev.low,
            close: ev.close,
            volume: ev.volume,
        }
    }
}

// ---------------------------------------------------------------------------
// Trader status / risk alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraderState {
    pub trader_id: String,
    pub trader_name: String,
    pub status: String,
    pub message: Option<String>,
    pub timestamp: i64,
}

impl From<&TraderStatusEvent> for TraderState {
    fn from(ev: &TraderStatusEvent) -> Self {
        Self {
            trader_id: ev.trader_id.clone(),
            trader_name: ev.trader_name.clone().unwrap_or_else(|| ev.trader_id.clone()),
            status: ev.status.clone(),
            message: ev.message.clone(),
            timestamp: ev.timestamp,
        }
    }
}

impl Keyed for TraderState {
    fn key(&self) -> &str {
        &self.trader_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlert {
    pub id: String,
    pub trader_id: Option<String>,
    pub severity: String,
    pub message: String,
    pub timestamp: i64,
}

impl From<&RiskAlertEvent> for RiskAlert {
    fn from(ev: &RiskAlertEvent) -> Self {
        // Alerts without an id are keyed by trader + time so replays collapse.
        let id = ev.id.clone().unwrap_or_else(|| {
            format!("{}@{}", ev.trader_id.as_deref().unwrap_or("-"), ev.timestamp)
        });
        Self {
            id,
            trader_id: ev.trader_id.clone(),
            severity: ev.severity.clone(),
            message: ev.message.clone(),
            timestamp: ev.timestamp,
        }
    }
}

impl Keyed for RiskAlert {
    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_position_from_rest_spellings() {
        let p: OpenPosition = serde_json::from_str(
            r#"{"id":1,"traderId":"alpha","symbol":"ETHUSDT","quantity":"2",
                "entryPrice":"1800","currentPrice":1810,"unrealizedPnL":"20"}"#,
        )
        .unwrap();
        assert_eq!(p.id, "1");
        assert_eq!(p.trader_name, "alpha");
        assert_eq!(p.status, PositionStatus::Open);
        assert!((p.pnl - 20.0).abs() < 1e-12);
    }

    #[test]
    fn trade_from_closed_position_uses_realized_pnl() {
        let ev = PositionEvent::from_slice(
            br#"{"id":"P9","traderId":"t","symbol":"BTCUSDT","action":"SELL","quantity":1,
                "entryPrice":100,"currentPrice":90,"unrealizedPnL":-10,"realizedPnL":12,
                "status":"CLOSED","timestamp":5}"#,
        )
        .unwrap();
        let trade = TradeRecord::from_closed_position(&ev, "Trader T".into()).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.pnl, 12.0);
        assert_eq!(trade.trader_name, "Trader T");
    }

    #[test]
    fn risk_alert_without_id_gets_stable_key() {
        let ev = RiskAlertEvent {
            id: None,
            trader_id: Some("t1".into()),
            severity: "HIGH".into(),
            message: "drawdown".into(),
            timestamp: 10,
        };
        assert_eq!(RiskAlert::from(&ev).key(), "t1@10");
    }
}
