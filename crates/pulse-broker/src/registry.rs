//! Connection and subscription registry with non-blocking fan-out.
//!
//! [`BrokerCore`] is plain single-owner state: the broker task owns it and
//! every method runs to completion without suspending. Delivery to a
//! connection is a `try_send` into that connection's bounded queue, so a slow
//! reader loses messages for itself only and never stalls the broker.

use ahash::{AHashMap, AHashSet};
use pulse_core::error::PulseError;
use pulse_core::{Action, Channel, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::ReplayBuffer;

/// Opaque id of one logical client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough to tell connections apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: usize,
    /// `(channel, buffered events, subscribers)` in channel order.
    pub channels: Vec<(Channel, usize, usize)>,
    /// Messages dropped because a connection's queue was full.
    pub dropped: u64,
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub seq: u64,
    pub delivered: usize,
    pub dropped: usize,
}

struct Subscriber {
    tx: mpsc::Sender<ServerMessage>,
    channels: AHashSet<Channel>,
    /// Highest sequence handed to this connection per channel. Survives
    /// unsubscribe so a resubscribe never replays an event twice.
    delivered: AHashMap<Channel, u64>,
    dropped: u64,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

impl Subscriber {
    fn deliver(&mut self, id: ConnectionId, msg: ServerMessage) -> Delivery {
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % 100 == 0 {
                    warn!("[broker] conn-{id} queue full, dropped {} message(s)", self.dropped);
                }
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Broker state: replay rings, per-channel sequences, and subscribers.
pub struct BrokerCore {
    epoch: String,
    allowed: AHashSet<Channel>,
    buffer_size: usize,
    queue_size: usize,
    buffers: AHashMap<Channel, ReplayBuffer>,
    next_seq: AHashMap<Channel, u64>,
    subscribers: AHashMap<ConnectionId, Subscriber>,
    dropped_total: u64,
}

impl BrokerCore {
    /// Create a broker accepting subscriptions to `channels`.
    pub fn new(channels: &[Channel], buffer_size: usize, queue_size: usize) -> Self {
        Self {
            epoch: Uuid::new_v4().to_string(),
            allowed: channels.iter().copied().collect(),
            buffer_size,
            queue_size,
            buffers: AHashMap::new(),
            next_seq: AHashMap::new(),
            subscribers: AHashMap::new(),
            dropped_total: 0,
        }
    }

    /// Broker instance id stamped on every event.
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Register a connection. The receiver yields everything addressed to it.
    pub fn connect(&mut self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                channels: AHashSet::new(),
                delivered: AHashMap::new(),
                dropped: 0,
            },
        );
        info!("[broker] conn-{id} registered ({} active)", self.subscribers.len());
        (id, rx)
    }

    /// Subscribe `id` to `channel`, flushing unseen replay first.
    ///
    /// Replayed events are queued oldest first with `replay=true`, followed by
    /// an `ack`. Already-subscribed is a no-op apart from the `ack`. Rejections
    /// are reported to the connection as an `error` message and returned.
    ///
    /// Returns the number of events replayed.
    pub fn subscribe(&mut self, id: ConnectionId, channel: &str) -> Result<usize, PulseError> {
        let ch = match self.check_channel(id, channel) {
            Ok(ch) => ch,
            Err(e) => {
                self.reject(id, channel, &e);
                return Err(e);
            }
        };
        let Some(sub) = self.subscribers.get_mut(&id) else {
            return Err(PulseError::Broker(format!("unknown connection {id}")));
        };

        let mut replayed = 0;
        if sub.channels.insert(ch) {
            let seen = sub.delivered.get(&ch).copied().unwrap_or(0);
            let mut last = seen;
            if let Some(buf) = self.buffers.get(&ch) {
                for (seq, msg) in buf.after(seen) {
                    if let Delivery::Dropped = sub.deliver(id, msg.as_replay()) {
                        self.dropped_total += 1;
                    }
                    last = *seq;
                    replayed += 1;
                }
            }
            sub.delivered.insert(ch, last);
            debug!("[broker] conn-{id} subscribed to {ch}, replayed {replayed}");
        }
        sub.deliver(id, ServerMessage::ack(Action::Subscribe, ch.as_str()));
        Ok(replayed)
    }

    /// Stop delivering `channel` to `id`. Other connections are unaffected.
    pub fn unsubscribe(&mut self, id: ConnectionId, channel: &str) -> Result<(), PulseError> {
        let ch = match self.check_channel(id, channel) {
            Ok(ch) => ch,
            Err(e) => {
                self.reject(id, channel, &e);
                return Err(e);
            }
        };
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.channels.remove(&ch);
            sub.deliver(id, ServerMessage::ack(Action::Unsubscribe, ch.as_str()));
            debug!("[broker] conn-{id} unsubscribed from {ch}");
        }
        Ok(())
    }

    /// Buffer an event and fan it out to every current subscriber.
    ///
    /// Publishing to a channel without subscribers still buffers the event.
    pub fn publish(&mut self, channel: Channel, data: Value) -> PublishReport {
        let seq = {
            let next = self.next_seq.entry(channel).or_insert(0);
            *next += 1;
            *next
        };
        let msg = ServerMessage::event(channel.as_str(), data, seq, &self.epoch);
        self.buffers
            .entry(channel)
            .or_insert_with(|| ReplayBuffer::new(self.buffer_size))
            .push(seq, msg.clone());

        let mut report = PublishReport { seq, delivered: 0, dropped: 0 };
        let mut closed = Vec::new();
        for (id, sub) in self.subscribers.iter_mut() {
            if !sub.channels.contains(&channel) {
                continue;
            }
            sub.delivered.insert(channel, seq);
            match sub.deliver(*id, msg.clone()) {
                Delivery::Sent => report.delivered += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Closed => closed.push(*id),
            }
        }
        self.dropped_total += report.dropped as u64;
        for id in closed {
            self.disconnect(id);
        }
        report
    }

    /// Send a heartbeat to every connection regardless of subscriptions.
    pub fn heartbeat(&mut self) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();
        for (id, sub) in self.subscribers.iter_mut() {
            match sub.deliver(*id, ServerMessage::heartbeat()) {
                Delivery::Sent => sent += 1,
                Delivery::Dropped => self.dropped_total += 1,
                Delivery::Closed => closed.push(*id),
            }
        }
        for id in closed {
            self.disconnect(id);
        }
        sent
    }

    /// Queue an `error` message for one connection.
    pub fn send_error(&mut self, id: ConnectionId, channel: Option<&str>, reason: &str) {
        if let Some(sub) = self.subscribers.get_mut(&id) {
            sub.deliver(id, ServerMessage::error(channel, reason));
        }
    }

    /// Remove a connection from every registry. Replay buffers are untouched.
    pub fn disconnect(&mut self, id: ConnectionId) {
        if let Some(sub) = self.subscribers.remove(&id) {
            info!(
                "[broker] conn-{id} removed ({} channel(s), {} dropped, {} active)",
                sub.channels.len(),
                sub.dropped,
                self.subscribers.len()
            );
        }
    }

    #[cfg(test)]
    fn is_subscribed(&self, id: ConnectionId, channel: Channel) -> bool {
        self.subscribers.get(&id).is_some_and(|s| s.channels.contains(&channel))
    }

    pub fn stats(&self) -> BrokerStats {
        let mut channels: Vec<Channel> = self.allowed.iter().copied().collect();
        channels.sort();
        BrokerStats {
            connections: self.subscribers.len(),
            channels: channels
                .into_iter()
                .map(|ch| {
                    let buffered = self.buffers.get(&ch).map_or(0, ReplayBuffer::len);
                    let subs =
                        self.subscribers.values().filter(|s| s.channels.contains(&ch)).count();
                    (ch, buffered, subs)
                })
                .collect(),
            dropped: self.dropped_total,
        }
    }

    fn check_channel(&self, id: ConnectionId, channel: &str) -> Result<Channel, PulseError> {
        if !self.subscribers.contains_key(&id) {
            return Err(PulseError::Broker(format!("unknown connection {id}")));
        }
        match Channel::parse(channel) {
            Some(ch) if self.allowed.contains(&ch) => Ok(ch),
            _ => Err(PulseError::Broker(format!("channel `{channel}` is not subscribable"))),
        }
    }

    fn reject(&mut self, id: ConnectionId, channel: &str, err: &PulseError) {
        self.send_error(id, Some(channel), &err.to_string());
    }
}
