//! Broker task and its cloneable handle.
//!
//! The task owns [`BrokerCore`] exclusively; everything else talks to it via
//! commands. Heartbeats are scheduled inside the same task, so a heartbeat is
//! never interleaved with a half-finished subscribe flush.

use pulse_core::config::BrokerConfig;
use pulse_core::error::PulseError;
use pulse_core::{Channel, ServerMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::registry::{BrokerCore, BrokerStats, ConnectionId, PublishReport};

const COMMAND_QUEUE: usize = 1024;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<(ConnectionId, mpsc::Receiver<ServerMessage>)>),
    Subscribe(ConnectionId, String, Reply<Result<usize, PulseError>>),
    Unsubscribe(ConnectionId, String, Reply<Result<(), PulseError>>),
    Publish(Channel, Value, Reply<PublishReport>),
    SendError(ConnectionId, String),
    Disconnect(ConnectionId),
    Stats(Reply<BrokerStats>),
    Shutdown,
}

/// Cloneable handle to a running broker task.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
}

/// Spawn the broker task.
pub fn spawn_broker(config: &BrokerConfig) -> BrokerHandle {
    let core = BrokerCore::new(
        &config.channels,
        config.replay_buffer_size,
        config.subscriber_queue_size,
    );
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let heartbeat = config.heartbeat_interval();
    info!(
        "[broker] starting — epoch={}, channels={:?}, replay={}, heartbeat={heartbeat:?}",
        core.epoch(),
        config.channels,
        config.replay_buffer_size,
    );
    tokio::spawn(run_broker(core, rx, heartbeat));
    BrokerHandle { tx }
}

async fn run_broker(
    mut core: BrokerCore,
    mut rx: mpsc::Receiver<Command>,
    heartbeat: std::time::Duration,
) {
    let mut hb = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Connect(reply) => {
                        let _ = reply.send(core.connect());
                    }
                    Command::Subscribe(id, channel, reply) => {
                        let _ = reply.send(core.subscribe(id, &channel));
                    }
                    Command::Unsubscribe(id, channel, reply) => {
                        let _ = reply.send(core.unsubscribe(id, &channel));
                    }
                    Command::Publish(channel, data, reply) => {
                        let _ = reply.send(core.publish(channel, data));
                    }
                    Command::SendError(id, reason) => core.send_error(id, None, &reason),
                    Command::Disconnect(id) => core.disconnect(id),
                    Command::Stats(reply) => {
                        let _ = reply.send(core.stats());
                    }
                    Command::Shutdown => break,
                }
            }
            _ = hb.tick() => {
                let sent = core.heartbeat();
                debug!("[broker] heartbeat → {sent} connection(s)");
            }
        }
    }
    info!("[broker] stopped");
}

impl BrokerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, PulseError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| PulseError::Broker("broker task is gone".into()))?;
        reply_rx.await.map_err(|_| PulseError::Broker("broker dropped the request".into()))
    }

    /// Register a new logical connection.
    pub async fn connect(
        &self,
    ) -> Result<(ConnectionId, mpsc::Receiver<ServerMessage>), PulseError> {
        self.request(Command::Connect).await
    }

    /// Subscribe; returns the number of replayed events.
    pub async fn subscribe(&self, id: ConnectionId, channel: &str) -> Result<usize, PulseError> {
        let channel = channel.to_string();
        self.request(|r| Command::Subscribe(id, channel, r)).await?
    }

    pub async fn unsubscribe(&self, id: ConnectionId, channel: &str) -> Result<(), PulseError> {
        let channel = channel.to_string();
        self.request(|r| Command::Unsubscribe(id, channel, r)).await?
    }

    /// Publish an event; returns the sequence assigned to it.
    pub async fn publish(&self, channel: Channel, data: Value) -> Result<u64, PulseError> {
        let report = self.request(|r| Command::Publish(channel, data, r)).await?;
        Ok(report.seq)
    }

    /// Queue an `error` message for one connection.
    pub async fn send_error(&self, id: ConnectionId, reason: impl Into<String>) {
        let _ = self.tx.send(Command::SendError(id, reason.into())).await;
    }

    pub async fn disconnect(&self, id: ConnectionId) {
        let _ = self.tx.send(Command::Disconnect(id)).await;
    }

    pub async fn stats(&self) -> Result<BrokerStats, PulseError> {
        self.request(Command::Stats).await
    }

    /// Stop the broker task. Outstanding connection queues close.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::MessageType;
    use serde_json::json;
    use std::time::Duration;

    fn config(heartbeat_ms: u64) -> BrokerConfig {
        BrokerConfig {
            replay_buffer_size: 2,
            heartbeat_interval_ms: heartbeat_ms,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_then_subscribe_replays() {
        let broker = spawn_broker(&config(60_000));
        broker.publish(Channel::Positions, json!({ "n": 1 })).await.unwrap();
        broker.publish(Channel::Positions, json!({ "n": 2 })).await.unwrap();
        broker.publish(Channel::Positions, json!({ "n": 3 })).await.unwrap();

        let (id, mut rx) = broker.connect().await.unwrap();
        assert_eq!(broker.subscribe(id, "positions").await.unwrap(), 2);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.replay && second.replay);
        assert_eq!(first.data, Some(json!({ "n": 2 })));
        assert_eq!(second.data, Some(json!({ "n": 3 })));
        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_on_interval() {
        let broker = spawn_broker(&config(15_000));
        let (_id, mut rx) = broker.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(14_000)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.kind, MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn subscribe_error_surfaces() {
        let broker = spawn_broker(&config(60_000));
        let (id, _rx) = broker.connect().await.unwrap();
        assert!(broker.subscribe(id, "nope").await.is_err());
        let stats = broker.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
    }
}
