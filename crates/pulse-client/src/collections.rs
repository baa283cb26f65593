//! Bounded collections backing the observed state.
//!
//! Every collection holds at most `limit` entries and evicts the oldest end
//! first, so the newest entry always survives a trim.

use std::sync::Arc;

use pulse_core::{Candlestick, Keyed};

/// Which end of the list holds the newest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Insertion order; new keys are appended, the front is evicted.
    OldestFirst,
    /// History order; new keys are prepended, the tail is evicted.
    NewestFirst,
}

/// Ordered, bounded list with at most one entry per key.
#[derive(Debug, Clone)]
pub struct KeyedCollection<T> {
    items: Vec<T>,
    limit: usize,
    order: Order,
}

impl<T: Keyed + Clone> KeyedCollection<T> {
    pub fn new(limit: usize, order: Order) -> Self {
        Self { items: Vec::new(), limit: limit.max(1), order }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    /// Replace in place if the key exists, otherwise add at the newest end.
    pub fn upsert(&mut self, item: T) {
        if let Some(idx) = self.position(item.key()) {
            self.items[idx] = item;
            return;
        }
        match self.order {
            Order::OldestFirst => self.items.push(item),
            Order::NewestFirst => self.items.insert(0, item),
        }
        self.trim();
    }

    /// Move `item` to the newest end, dropping any previous entry for its key.
    pub fn push_newest(&mut self, item: T) {
        if let Some(idx) = self.position(item.key()) {
            self.items.remove(idx);
        }
        match self.order {
            Order::OldestFirst => self.items.push(item),
            Order::NewestFirst => self.items.insert(0, item),
        }
        self.trim();
    }

    /// Insert `item` at its place in a list kept in descending `rank` order,
    /// dropping any previous entry for its key. Ties go ahead of existing
    /// entries. An item that ranks below a full list is trimmed right away.
    pub fn insert_ranked<K: Ord>(&mut self, item: T, rank: impl Fn(&T) -> K) {
        if let Some(idx) = self.position(item.key()) {
            self.items.remove(idx);
        }
        let k = rank(&item);
        let idx = self.items.partition_point(|existing| rank(existing) > k);
        self.items.insert(idx, item);
        self.items.truncate(self.limit);
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.position(key).map(|idx| self.items.remove(idx))
    }

    /// Overwrite with a snapshot. Later duplicates of a key are dropped.
    pub fn replace_all(&mut self, items: Vec<T>) {
        let mut seen = ahash::AHashSet::with_capacity(items.len());
        self.items = items
            .into_iter()
            .filter(|item| seen.insert(item.key().to_string()))
            .collect();
        self.trim();
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(Keyed::key)
    }

    pub fn snapshot(&self) -> Arc<Vec<T>> {
        Arc::new(self.items.clone())
    }

    fn trim(&mut self) {
        if self.items.len() <= self.limit {
            return;
        }
        match self.order {
            Order::OldestFirst => {
                let excess = self.items.len() - self.limit;
                self.items.drain(..excess);
            }
            Order::NewestFirst => self.items.truncate(self.limit),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

/// Candles of one timeframe, sorted ascending by timestamp, unique per
/// timestamp, newest `limit` kept.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    candles: Vec<Candlestick>,
    limit: usize,
}

impl CandleSeries {
    pub fn new(limit: usize) -> Self {
        Self { candles: Vec::new(), limit: limit.max(1) }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Replace the candle with the same timestamp or insert in order.
    pub fn merge(&mut self, candle: Candlestick) {
        match self.candles.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
            Ok(idx) => self.candles[idx] = candle,
            Err(idx) => self.candles.insert(idx, candle),
        }
        self.trim();
    }

    /// Overwrite with a snapshot in any order; the last duplicate wins.
    pub fn replace_all(&mut self, mut candles: Vec<Candlestick>) {
        // Stable sort keeps input order among equal timestamps.
        candles.sort_by_key(|c| c.timestamp);
        let mut out: Vec<Candlestick> = Vec::with_capacity(candles.len());
        for candle in candles {
            match out.last_mut() {
                Some(last) if last.timestamp == candle.timestamp => *last = candle,
                _ => out.push(candle),
            }
        }
        self.candles = out;
        self.trim();
    }

    pub fn snapshot(&self) -> Arc<Vec<Candlestick>> {
        Arc::new(self.candles.clone())
    }

    fn trim(&mut self) {
        if self.candles.len() > self.limit {
            let excess = self.candles.len() - self.limit;
            self.candles.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String, u32);

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.0
        }
    }

    fn item(key: &str, v: u32) -> Item {
        Item(key.to_string(), v)
    }

    fn candle(ts: i64, close: f64) -> Candlestick {
        Candlestick { timestamp: ts, open: 1.0, high: 2.0, low: 0.5, close, volume: 0.0 }
    }

    #[test]
    fn newest_first_prepends_and_truncates_tail() {
        let mut c = KeyedCollection::new(3, Order::NewestFirst);
        for i in 0..5 {
            c.upsert(item(&format!("t{i}"), i));
        }
        let keys: Vec<_> = c.keys().collect();
        assert_eq!(keys, ["t4", "t3", "t2"]);
    }

    #[test]
    fn oldest_first_appends_and_evicts_front() {
        let mut c = KeyedCollection::new(2, Order::OldestFirst);
        c.upsert(item("a", 1));
        c.upsert(item("b", 1));
        c.upsert(item("a", 2));
        assert_eq!(c.get("a"), Some(&item("a", 2)));
        c.upsert(item("c", 1));
        let keys: Vec<_> = c.keys().collect();
        assert_eq!(keys, ["b", "c"]);
    }

    #[test]
    fn push_newest_moves_existing_key() {
        let mut c = KeyedCollection::new(10, Order::NewestFirst);
        c.upsert(item("a", 1));
        c.upsert(item("b", 1));
        c.push_newest(item("a", 2));
        let keys: Vec<_> = c.keys().collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn replace_all_dedups_and_bounds() {
        let mut c = KeyedCollection::new(2, Order::NewestFirst);
        c.replace_all(vec![item("x", 1), item("x", 2), item("y", 1), item("z", 1)]);
        assert_eq!(c.snapshot().as_slice(), &[item("x", 1), item("y", 1)]);
        assert!(c.remove("x").is_some());
        assert!(c.remove("x").is_none());
    }

    #[test]
    fn ranked_insert_keeps_highest_ranks() {
        let mut c = KeyedCollection::new(3, Order::NewestFirst);
        for (key, v) in [("a", 5), ("b", 9), ("c", 7)] {
            c.insert_ranked(item(key, v), |i| i.1);
        }
        c.insert_ranked(item("d", 1), |i| i.1);
        assert_eq!(c.keys().collect::<Vec<_>>(), ["b", "c", "a"]);

        c.insert_ranked(item("e", 8), |i| i.1);
        c.insert_ranked(item("b", 6), |i| i.1);
        assert_eq!(c.keys().collect::<Vec<_>>(), ["e", "c", "b"]);
    }

    #[test]
    fn candles_stay_sorted_unique_and_bounded() {
        let mut s = CandleSeries::new(100);
        for ts in (0..150).rev() {
            s.merge(candle(ts, ts as f64));
        }
        s.merge(candle(149, 999.0));
        let snap = s.snapshot();
        assert_eq!(snap.len(), 100);
        assert_eq!(snap.first().unwrap().timestamp, 50);
        assert_eq!(snap.last().unwrap().close, 999.0);
        assert!(snap.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn candle_snapshot_is_sorted_and_last_duplicate_wins() {
        let mut s = CandleSeries::new(2);
        s.replace_all(vec![candle(3, 1.0), candle(1, 1.0), candle(3, 7.0), candle(2, 1.0)]);
        let snap = s.snapshot();
        assert_eq!(snap.iter().map(|c| c.timestamp).collect::<Vec<_>>(), [2, 3]);
        assert_eq!(snap[1].close, 7.0);
    }
}
