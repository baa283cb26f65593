//! Deduplication of replayed and out-of-order telemetry.
//!
//! A reconnecting consumer resubscribes and the broker flushes its replay
//! buffer again, so the same event can arrive twice. Two gates filter that
//! out before anything reaches client state:
//!
//! 1. [`SeqDedup`] — per-channel broker sequence numbers, reset when the broker
//!    epoch changes (broker restart).
//! 2. [`TimestampGate`] — per-entity last applied timestamp, with tombstones for
//!    closed ids so a closed position can never be resurrected.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};

// ---------------------------------------------------------------------------
// SeqDedup — monotonic sequence-based
// ---------------------------------------------------------------------------

/// Deduplicator based on a per-channel monotonically increasing sequence.
///
/// A message is accepted only if its sequence is strictly greater than the
/// last accepted one for that channel.
///
/// # Thread safety
///
/// Not thread-safe. Each decode loop owns its own instance.
#[derive(Debug, Default)]
pub struct SeqDedup {
    epoch: Option<String>,
    last_seq: AHashMap<String, u64>,
}

impl SeqDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `seq` is new for `channel` under broker `epoch`.
    ///
    /// A different epoch than the one last seen clears all state first.
    /// Returns `true` if the message should be forwarded.
    #[inline]
    pub fn check_and_update(&mut self, epoch: Option<&str>, channel: &str, seq: u64) -> bool {
        if let Some(epoch) = epoch {
            if self.epoch.as_deref() != Some(epoch) {
                self.last_seq.clear();
                self.epoch = Some(epoch.to_string());
            }
        }
        match self.last_seq.get_mut(channel) {
            Some(last) if seq <= *last => false,
            Some(last) => {
                *last = seq;
                true
            }
            None => {
                self.last_seq.insert(channel.to_string(), seq);
                true
            }
        }
    }

    #[cfg(test)]
    fn last_seq(&self, channel: &str) -> Option<u64> {
        self.last_seq.get(channel).copied()
    }
}

// ---------------------------------------------------------------------------
// TimestampGate — per-entity staleness + tombstones
// ---------------------------------------------------------------------------

/// Default number of closed ids remembered.
const DEFAULT_TOMBSTONES: usize = 4096;

/// Verdict for an incoming entity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    /// Apply the event.
    Accept,
    /// Older than the last applied event for this id.
    Stale,
    /// The id was closed; it may not come back.
    Closed,
}

/// Per-id staleness gate.
///
/// Events with a timestamp older than the last applied one for the same id are
/// rejected. Equal timestamps are accepted because replace-in-place is
/// idempotent. Once an id is [`close`](Self::close)d, every later event for it
/// is rejected; the tombstone set is bounded, oldest forgotten first.
#[derive(Debug)]
pub struct TimestampGate {
    last_ts: AHashMap<String, i64>,
    closed: AHashSet<String>,
    closed_order: VecDeque<String>,
    max_tombstones: usize,
}

impl TimestampGate {
    pub fn new() -> Self {
        Self::with_tombstones(DEFAULT_TOMBSTONES)
    }

    pub fn with_tombstones(max_tombstones: usize) -> Self {
        Self {
            last_ts: AHashMap::new(),
            closed: AHashSet::new(),
            closed_order: VecDeque::new(),
            max_tombstones: max_tombstones.max(1),
        }
    }

    /// Check an event for `id` at `ts` and record it if accepted.
    pub fn admit(&mut self, id: &str, ts: i64) -> Admit {
        if self.closed.contains(id) {
            return Admit::Closed;
        }
        match self.last_ts.get_mut(id) {
            Some(last) if ts < *last => Admit::Stale,
            Some(last) => {
                *last = ts;
                Admit::Accept
            }
            None => {
                self.last_ts.insert(id.to_string(), ts);
                Admit::Accept
            }
        }
    }

    /// Tombstone `id`: no further events for it are admitted.
    pub fn close(&mut self, id: &str) {
        self.last_ts.remove(id);
        if self.closed.insert(id.to_string()) {
            self.closed_order.push_back(id.to_string());
            while self.closed_order.len() > self.max_tombstones {
                if let Some(old) = self.closed_order.pop_front() {
                    self.closed.remove(&old);
                }
            }
        }
    }

    pub fn is_closed(&self, id: &str) -> bool {
        self.closed.contains(id)
    }

    /// Forget timestamps for ids not in `live`, keeping tombstones.
    ///
    /// Called after a wholesale snapshot replaces the collection.
    pub fn retain_ids<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let keep: AHashSet<&str> = live.into_iter().collect();
        self.last_ts.retain(|id, _| keep.contains(id.as_str()));
    }
}

impl Default for TimestampGate {
    fn default() -> Self {
        Self::new()
    }
}
