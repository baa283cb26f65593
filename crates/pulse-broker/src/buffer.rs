//! Bounded per-channel replay ring.

use std::collections::VecDeque;

use pulse_core::ServerMessage;

/// The most recent `capacity` events of one channel, oldest first.
///
/// Entries are stored with their publish sequence so a resubscribing
/// connection can be replayed only what it has not seen.
#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<(u64, ServerMessage)>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { entries: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append an event, evicting the oldest one on overflow.
    pub fn push(&mut self, seq: u64, msg: ServerMessage) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, msg));
    }

    /// Buffered events with a sequence greater than `after`, oldest first.
    pub fn after(&self, after: u64) -> impl Iterator<Item = &(u64, ServerMessage)> {
        self.entries.iter().filter(move |(seq, _)| *seq > after)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(seq: u64) -> ServerMessage {
        ServerMessage::event("positions", json!({ "n": seq }), seq, "e")
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut buf = ReplayBuffer::new(3);
        for seq in 1..=5 {
            buf.push(seq, msg(seq));
        }
        assert_eq!(buf.len(), 3);
        let seqs: Vec<u64> = buf.after(0).map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn after_filters_seen() {
        let mut buf = ReplayBuffer::new(10);
        for seq in 1..=4 {
            buf.push(seq, msg(seq));
        }
        let seqs: Vec<u64> = buf.after(2).map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(buf.after(4).count(), 0);
    }
}
