//! Normalized client state.
//!
//! [`StateStore`] is plain single-owner data: the aggregator task owns it and
//! every method runs to completion without suspending. Each mutation reports
//! which collections changed so the owner republishes only those.

use std::sync::Arc;

use ahash::AHashMap;
use pulse_core::dedup::{Admit, TimestampGate};
use pulse_core::error::PulseError;
use pulse_core::{
    CandleEvent, Candlestick, Channel, OpenPosition, PositionEvent, PositionStatus, RiskAlert,
    RiskAlertEvent, TradeRecord, TraderState, TraderStatusEvent,
};
use tracing::debug;

use crate::collections::{CandleSeries, KeyedCollection, Order};

/// Which observed collections a mutation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub positions: bool,
    pub trades: bool,
    pub traders: bool,
    pub alerts: bool,
    /// Timeframe whose candle series changed.
    pub candles: Option<String>,
    /// A position closed; trade history should be re-pulled.
    pub refresh_trades: bool,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct StateStore {
    limit: usize,
    positions: KeyedCollection<OpenPosition>,
    trades: KeyedCollection<TradeRecord>,
    traders: KeyedCollection<TraderState>,
    alerts: KeyedCollection<RiskAlert>,
    candles: AHashMap<String, CandleSeries>,
    gate: TimestampGate,
}

impl StateStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            positions: KeyedCollection::new(limit, Order::OldestFirst),
            trades: KeyedCollection::new(limit, Order::NewestFirst),
            traders: KeyedCollection::new(limit, Order::OldestFirst),
            alerts: KeyedCollection::new(limit, Order::NewestFirst),
            candles: AHashMap::new(),
            gate: TimestampGate::new(),
        }
    }

    /// Route one push payload to its handler.
    pub fn apply_sample(&mut self, channel: Channel, payload: &[u8]) -> Result<Changes, PulseError> {
        match channel {
            Channel::Positions => Ok(self.apply_position(&PositionEvent::from_slice(payload)?)),
            Channel::MarketData => {
                let event: CandleEvent = decode(payload, "candle")?;
                Ok(self.merge_candle(&event))
            }
            Channel::TraderStatus => {
                let event: TraderStatusEvent = decode(payload, "trader status")?;
                Ok(self.apply_trader(&event))
            }
            Channel::RiskAlerts => {
                let event: RiskAlertEvent = decode(payload, "risk alert")?;
                Ok(self.apply_alert(&event))
            }
        }
    }

    fn trader_name(&self, trader_id: &str) -> String {
        self.traders
            .get(trader_id)
            .map(|t| t.trader_name.clone())
            .unwrap_or_else(|| trader_id.to_string())
    }

    /// `OPEN` inserts, `UPDATED` replaces, a terminal event removes the
    /// position and records the completed trade.
    pub fn apply_position(&mut self, event: &PositionEvent) -> Changes {
        let mut changes = Changes::default();
        match self.gate.admit(&event.id, event.timestamp) {
            Admit::Accept => {}
            Admit::Stale => {
                debug!("[state] stale {:?} for position {} dropped", event.status, event.id);
                return changes;
            }
            Admit::Closed => {
                debug!("[state] event for closed position {} dropped", event.id);
                return changes;
            }
        }

        let name = self.trader_name(&event.trader_id);
        if event.is_terminal() {
            self.gate.close(&event.id);
            changes.positions = self.positions.remove(&event.id).is_some();
            if let Some(trade) = TradeRecord::from_closed_position(event, name) {
                self.trades.insert_ranked(trade, |t| t.timestamp);
                changes.trades = true;
            }
            changes.refresh_trades = true;
            return changes;
        }

        match event.status {
            PositionStatus::Open | PositionStatus::Updated => {
                self.positions.upsert(OpenPosition::from_event(event, name));
                changes.positions = true;
            }
            PositionStatus::Closed => {}
        }
        changes
    }

    pub fn merge_candle(&mut self, event: &CandleEvent) -> Changes {
        self.series_mut(&event.timeframe).merge(Candlestick::from(event));
        Changes { candles: Some(event.timeframe.clone()), ..Changes::default() }
    }

    pub fn apply_trader(&mut self, event: &TraderStatusEvent) -> Changes {
        if self.traders.get(&event.trader_id).is_some_and(|t| t.timestamp > event.timestamp) {
            return Changes::default();
        }
        self.traders.upsert(TraderState::from(event));
        Changes { traders: true, ..Changes::default() }
    }

    pub fn apply_alert(&mut self, event: &RiskAlertEvent) -> Changes {
        self.alerts.push_newest(RiskAlert::from(event));
        Changes { alerts: true, ..Changes::default() }
    }

    /// Overwrite positions with a fallback snapshot. Ids already closed stay
    /// closed.
    pub fn replace_positions(&mut self, snapshot: Vec<OpenPosition>) -> Changes {
        let live: Vec<OpenPosition> = snapshot
            .into_iter()
            .filter(|p| !self.gate.is_closed(&p.id))
            .collect();
        self.positions.replace_all(live);
        self.gate.retain_ids(self.positions.keys());
        Changes { positions: true, ..Changes::default() }
    }

    /// Overwrite trade history, newest timestamp first whatever the server
    /// order.
    pub fn replace_trades(&mut self, mut snapshot: Vec<TradeRecord>) -> Changes {
        snapshot.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.trades.replace_all(snapshot);
        Changes { trades: true, ..Changes::default() }
    }

    pub fn replace_candles(&mut self, timeframe: &str, snapshot: Vec<Candlestick>) -> Changes {
        self.series_mut(timeframe).replace_all(snapshot);
        Changes { candles: Some(timeframe.to_string()), ..Changes::default() }
    }

    fn series_mut(&mut self, timeframe: &str) -> &mut CandleSeries {
        let limit = self.limit;
        self.candles
            .entry(timeframe.to_string())
            .or_insert_with(|| CandleSeries::new(limit))
    }

    pub fn positions(&self) -> Arc<Vec<OpenPosition>> {
        self.positions.snapshot()
    }

    pub fn trades(&self) -> Arc<Vec<TradeRecord>> {
        self.trades.snapshot()
    }

    pub fn traders(&self) -> Arc<Vec<TraderState>> {
        self.traders.snapshot()
    }

    pub fn alerts(&self) -> Arc<Vec<RiskAlert>> {
        self.alerts.snapshot()
    }

    pub fn candles(&self, timeframe: &str) -> Arc<Vec<Candlestick>> {
        self.candles
            .get(timeframe)
            .map(CandleSeries::snapshot)
            .unwrap_or_default()
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8], what: &str) -> Result<T, PulseError> {
    serde_json::from_slice(payload).map_err(|e| PulseError::protocol(format!("bad {what} event: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn position(id: &str, status: &str, pnl: f64, ts: i64) -> Vec<u8> {
        json!({
            "id": id, "traderId": "t1", "symbol": "BTCUSDT", "action": "BUY",
            "quantity": 1, "entryPrice": 100, "currentPrice": 100 + pnl as i64,
            "unrealizedPnL": pnl, "status": status, "timestamp": ts
        })
        .to_string()
        .into_bytes()
    }

    fn apply(store: &mut StateStore, channel: Channel, payload: Vec<u8>) -> Changes {
        store.apply_sample(channel, &payload).unwrap()
    }

    #[test]
    fn open_then_updated_leaves_one_position_with_latest_pnl() {
        let mut store = StateStore::new(100);
        apply(&mut store, Channel::Positions, position("P1", "OPEN", 0.0, 1));
        apply(&mut store, Channel::Positions, position("P1", "UPDATED", 50.0, 2));

        let positions = store.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].pnl, 50.0);
    }

    #[test]
    fn close_removes_position_records_trade_and_tombstones_id() {
        let mut store = StateStore::new(100);
        apply(&mut store, Channel::Positions, position("P1", "OPEN", 0.0, 1));
        let changes = apply(&mut store, Channel::Positions, position("P1", "CLOSED", 25.0, 2));

        assert!(changes.positions && changes.trades && changes.refresh_trades);
        assert!(store.positions().is_empty());
        assert_eq!(store.trades()[0].id, "P1");

        let late = apply(&mut store, Channel::Positions, position("P1", "UPDATED", 30.0, 3));
        assert!(late.is_empty());
        assert!(store.positions().is_empty());

        store.replace_positions(vec![OpenPosition {
            id: "P1".into(),
            trader_name: "t1".into(),
            symbol: "BTCUSDT".into(),
            size: 1.0,
            entry_price: 100.0,
            mark_price: 100.0,
            pnl: 0.0,
            status: PositionStatus::Open,
        }]);
        assert!(store.positions().is_empty());
    }

    #[test]
    fn inactive_flag_is_terminal() {
        let mut store = StateStore::new(100);
        apply(&mut store, Channel::Positions, position("P1", "OPEN", 0.0, 1));
        let payload = json!({
            "id": "P1", "traderId": "t1", "symbol": "BTCUSDT", "quantity": 1,
            "entryPrice": 100, "currentPrice": 101, "unrealizedPnL": 1,
            "status": "UPDATED", "isActive": false, "timestamp": 2
        });
        apply(&mut store, Channel::Positions, payload.to_string().into_bytes());
        assert!(store.positions().is_empty());
    }

    #[test]
    fn stale_update_is_dropped() {
        let mut store = StateStore::new(100);
        apply(&mut store, Channel::Positions, position("P1", "OPEN", 0.0, 5));
        apply(&mut store, Channel::Positions, position("P1", "UPDATED", 10.0, 7));
        apply(&mut store, Channel::Positions, position("P1", "UPDATED", 3.0, 6));
        assert_eq!(store.positions()[0].pnl, 10.0);
    }

    #[test]
    fn trades_are_bounded_newest_first() {
        let mut store = StateStore::new(100);
        for i in 0..150 {
            apply(&mut store, Channel::Positions, position(&format!("P{i}"), "CLOSED", 1.0, i));
        }
        let trades = store.trades();
        assert_eq!(trades.len(), 100);
        assert_eq!(trades[0].id, "P149");
        assert_eq!(trades[99].id, "P50");
    }

    #[test]
    fn late_close_with_old_timestamp_does_not_evict_newer_trades() {
        let mut store = StateStore::new(100);
        for ts in 1000..1100 {
            apply(&mut store, Channel::Positions, position(&format!("P{ts}"), "CLOSED", 1.0, ts));
        }
        apply(&mut store, Channel::Positions, position("late", "CLOSED", 1.0, 1));

        let trades = store.trades();
        assert_eq!(trades.len(), 100);
        assert_eq!(trades[0].timestamp, 1099);
        assert_eq!(trades[99].timestamp, 1000);
        assert!(trades.iter().all(|t| t.id != "late"));
    }

    #[test]
    fn trade_snapshot_is_ordered_newest_first() {
        let mut store = StateStore::new(2);
        let trade = |id: &str, ts: i64| TradeRecord {
            id: id.into(),
            trader_name: "t1".into(),
            symbol: "BTCUSDT".into(),
            side: pulse_core::Side::Buy,
            qty: 1.0,
            price: 100.0,
            pnl: 0.0,
            timestamp: ts,
        };
        store.replace_trades(vec![trade("old", 1), trade("new", 3), trade("mid", 2)]);
        let ids: Vec<_> = store.trades().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, ["new", "mid"]);
    }

    #[test]
    fn trader_name_resolves_for_positions() {
        let mut store = StateStore::new(100);
        let trader = json!({"traderId": "t1", "traderName": "Alice", "status": "RUNNING", "timestamp": 1});
        apply(&mut store, Channel::TraderStatus, trader.to_string().into_bytes());
        apply(&mut store, Channel::Positions, position("P1", "OPEN", 0.0, 1));
        assert_eq!(store.positions()[0].trader_name, "Alice");
        assert_eq!(store.traders()[0].status, "RUNNING");
    }

    #[test]
    fn candles_and_alerts_route_by_channel() {
        let mut store = StateStore::new(100);
        let candle = json!({"timeframe": "1h", "timestamp": 10, "open": 1, "high": 2, "low": 0.5, "close": 1.5});
        let changes = apply(&mut store, Channel::MarketData, candle.to_string().into_bytes());
        assert_eq!(changes.candles.as_deref(), Some("1h"));
        assert_eq!(store.candles("1h").len(), 1);
        assert!(store.candles("4h").is_empty());

        let alert = json!({"id": "A1", "severity": "HIGH", "message": "drawdown", "timestamp": 3});
        apply(&mut store, Channel::RiskAlerts, alert.to_string().into_bytes());
        assert_eq!(store.alerts()[0].severity, "HIGH");
    }

    #[test]
    fn malformed_payload_is_an_error_and_changes_nothing() {
        let mut store = StateStore::new(100);
        assert!(store.apply_sample(Channel::Positions, b"{\"id\":").is_err());
        assert!(store.apply_sample(Channel::MarketData, b"{}").is_err());
        assert!(store.positions().is_empty());
    }
}
