//! Telemetry consumer: one WebSocket connection to the broker with bounded
//! auto-reconnect and heartbeat liveness.
//!
//! The consumer runs as a tokio task that:
//! 1. Connects to the broker (bearer token on the handshake, if configured).
//! 2. Subscribes to every configured channel.
//! 3. Decodes frames, drops duplicates by `(epoch, channel, seq)` and
//!    broadcasts each event as a [`TelemetrySample`].
//! 4. Treats silence longer than twice the heartbeat interval as a dead link.
//! 5. Reconnects with exponential backoff, giving up after
//!    `max_reconnect_attempts` consecutive failures until the next `start()`.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pulse_core::config::ClientConfig;
use pulse_core::dedup::SeqDedup;
use pulse_core::error::PulseError;
use pulse_core::{ClientRequest, ConnectionStatus, MessageType, ServerMessage, TelemetrySample};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::aggregator::LivenessSource;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NEVER: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// ConsumerLink
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LinkState {
    base: Instant,
    open: AtomicBool,
    /// Milliseconds since `base` of the last heartbeat/event, or `NEVER`.
    last_seen_ms: AtomicU64,
    running: AtomicBool,
    exhausted: AtomicBool,
    liveness_timeout: Duration,
}

/// Shared, read-only view of the consumer's transport state.
///
/// Cheap to clone; handed to the aggregator so it can reconcile push health
/// without owning the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerLink {
    state: Arc<LinkState>,
}

impl ConsumerLink {
    fn new(liveness_timeout: Duration) -> Self {
        Self {
            state: Arc::new(LinkState {
                base: Instant::now(),
                open: AtomicBool::new(false),
                last_seen_ms: AtomicU64::new(NEVER),
                running: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
                liveness_timeout,
            }),
        }
    }

    /// `true` only while the socket is open and a heartbeat or event arrived
    /// within the liveness timeout.
    pub fn is_connected(&self) -> bool {
        if !self.state.open.load(Ordering::Acquire) {
            return false;
        }
        let seen = self.state.last_seen_ms.load(Ordering::Acquire);
        if seen == NEVER {
            return false;
        }
        let now = self.state.base.elapsed().as_millis() as u64;
        now.saturating_sub(seen) <= self.state.liveness_timeout.as_millis() as u64
    }

    /// `true` once the reconnect budget is spent; cleared by the next `start()`.
    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted.load(Ordering::Acquire)
    }

    /// Connected, still trying, or stopped/exhausted.
    pub fn status(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Connected
        } else if self.state.running.load(Ordering::Acquire) && !self.is_exhausted() {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    fn mark_seen(&self) {
        let now = self.state.base.elapsed().as_millis() as u64;
        self.state.last_seen_ms.store(now, Ordering::Release);
    }

    fn set_open(&self, open: bool) {
        if open {
            // A fresh socket must prove liveness on its own.
            self.state.last_seen_ms.store(NEVER, Ordering::Release);
        }
        self.state.open.store(open, Ordering::Release);
    }

    fn set_running(&self, running: bool) {
        self.state.running.store(running, Ordering::Release);
    }

    fn set_exhausted(&self, exhausted: bool) {
        self.state.exhausted.store(exhausted, Ordering::Release);
    }
}

impl LivenessSource for ConsumerLink {
    fn is_connected(&self) -> bool {
        ConsumerLink::is_connected(self)
    }

    fn status(&self) -> ConnectionStatus {
        ConsumerLink::status(self)
    }

    fn is_exhausted(&self) -> bool {
        ConsumerLink::is_exhausted(self)
    }
}

// ---------------------------------------------------------------------------
// TelemetryConsumer
// ---------------------------------------------------------------------------

/// Owns the connection task. Samples are fanned out through a broadcast
/// channel; every receiver sees every sample in arrival order.
pub struct TelemetryConsumer {
    config: ClientConfig,
    link: ConsumerLink,
    sample_tx: broadcast::Sender<TelemetrySample>,
    /// Survives restarts so a fresh subscription's replay is not re-emitted.
    dedup: Arc<Mutex<SeqDedup>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryConsumer {
    pub fn new(config: ClientConfig) -> Self {
        let (sample_tx, _) = broadcast::channel(config.sample_capacity.max(1));
        let link = ConsumerLink::new(config.liveness_timeout());
        Self {
            config,
            link,
            sample_tx,
            dedup: Arc::new(Mutex::new(SeqDedup::new())),
            shutdown_tx: None,
            task: None,
        }
    }

    /// Start the connection task. No-op while a task is already running;
    /// an exhausted task counts as finished.
    pub fn start(&mut self) {
        let running = self.task.as_ref().is_some_and(|t| !t.is_finished());
        if running && !self.link.is_exhausted() {
            debug!("[consumer] start ignored: already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.link.set_exhausted(false);
        self.link.set_running(true);

        let config = self.config.clone();
        let link = self.link.clone();
        let sample_tx = self.sample_tx.clone();
        let dedup = self.dedup.clone();
        let task = tokio::spawn(async move {
            let end = connection_loop(config, link.clone(), sample_tx, dedup, shutdown_rx).await;
            link.set_open(false);
            link.set_running(false);
            // Last write of this task; `start()` may replace it from here on.
            if end == LoopEnd::Exhausted {
                link.set_exhausted(true);
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
    }

    /// Stop the connection task and wait for it to finish. No-op when not
    /// started.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[consumer] connection task panicked: {e}");
            }
        }
        self.link.set_open(false);
        self.link.set_running(false);
    }

    /// A new receiver of decoded samples.
    pub fn samples(&self) -> broadcast::Receiver<TelemetrySample> {
        self.sample_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn link(&self) -> ConsumerLink {
        self.link.clone()
    }
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    Lost(String),
}

#[derive(Debug, PartialEq, Eq)]
enum LoopEnd {
    Shutdown,
    Exhausted,
}

async fn connection_loop(
    config: ClientConfig,
    link: ConsumerLink,
    sample_tx: broadcast::Sender<TelemetrySample>,
    dedup: Arc<Mutex<SeqDedup>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> LoopEnd {
    let mut backoff = config.initial_backoff();
    let max_backoff = config.max_backoff();
    let mut retries: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            info!("[consumer] shutdown requested");
            return LoopEnd::Shutdown;
        }

        info!("[consumer] connecting to {}", config.ws_url);
        let connected = tokio::select! {
            _ = shutdown_rx.changed() => return LoopEnd::Shutdown,
            result = connect_ws(&config) => result,
        };
        let failure = match connected {
            Ok(ws) => {
                info!("[consumer] connected");
                retries = 0;
                backoff = config.initial_backoff();
                match run_session(ws, &config, &link, &sample_tx, &dedup, &mut shutdown_rx)
                    .await
                {
                    SessionEnd::Shutdown => return LoopEnd::Shutdown,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };
        link.set_open(false);

        if retries >= config.max_reconnect_attempts {
            error!(
                "[consumer] {failure}; giving up after {} reconnect attempts",
                config.max_reconnect_attempts
            );
            return LoopEnd::Exhausted;
        }
        retries += 1;
        warn!(
            "[consumer] {failure}; reconnect {retries}/{} in {backoff:?}",
            config.max_reconnect_attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {},
            _ = shutdown_rx.changed() => return LoopEnd::Shutdown,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// Establish the WebSocket connection, bounded by the request timeout.
async fn connect_ws(config: &ClientConfig) -> Result<WsStream, PulseError> {
    let mut request = config
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| PulseError::WebSocket(format!("bad url {}: {e}", config.ws_url)))?;

    if let Some(token) = &config.auth_token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| PulseError::WebSocket(format!("bad auth token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let connect = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(config.request_timeout(), connect).await {
        Ok(Ok((stream, _resp))) => Ok(stream),
        Ok(Err(e)) => Err(PulseError::WebSocket(format!("connect failed: {e}"))),
        Err(_) => Err(PulseError::WebSocket(format!(
            "connect timed out after {:?}",
            config.request_timeout()
        ))),
    }
}

async fn run_session(
    ws: WsStream,
    config: &ClientConfig,
    link: &ConsumerLink,
    sample_tx: &broadcast::Sender<TelemetrySample>,
    dedup: &Mutex<SeqDedup>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut ws_write, mut ws_read) = ws.split();

    for channel in &config.channels {
        let request = ClientRequest::subscribe(channel.as_str()).to_json();
        debug!("[consumer] subscribing: {request}");
        if let Err(e) = ws_write.send(Message::Text(request.into())).await {
            return SessionEnd::Lost(format!("subscribe send failed: {e}"));
        }
    }
    link.set_open(true);

    let timeout = config.liveness_timeout();
    let silence = tokio::time::sleep(timeout);
    tokio::pin!(silence);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("[consumer] shutdown signal received");
                let _ = ws_write.close().await;
                return SessionEnd::Shutdown;
            }

            _ = &mut silence => {
                let _ = ws_write.close().await;
                return SessionEnd::Lost(format!("no heartbeat for {timeout:?}"));
            }

            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&text, link, sample_tx, dedup) {
                            silence.as_mut().reset(Instant::now() + timeout);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Lost("received close frame".into()),
                    Some(Err(e)) => return SessionEnd::Lost(format!("read error: {e}")),
                    None => return SessionEnd::Lost("stream ended".into()),
                    _ => {} // Binary, Pong, Frame
                }
            }
        }
    }
}

/// Decode one text frame. Returns `true` when the frame proves the link is
/// alive: only events and heartbeats do.
fn handle_frame(
    text: &str,
    link: &ConsumerLink,
    sample_tx: &broadcast::Sender<TelemetrySample>,
    dedup: &Mutex<SeqDedup>,
) -> bool {
    let msg = match ServerMessage::decode(text) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!("[consumer] ignoring frame of unknown type");
            return false;
        }
        Err(e) => {
            warn!("[consumer] dropping malformed frame: {e}");
            return false;
        }
    };
    match msg.kind {
        MessageType::Event => {
            link.mark_seen();
            let Some(sample) = TelemetrySample::from_event(&msg) else {
                return true;
            };
            if let Some(seq) = sample.seq {
                let fresh = dedup
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .check_and_update(msg.epoch(), &sample.channel, seq);
                if !fresh {
                    debug!("[consumer] duplicate {}#{seq} dropped", sample.channel);
                    return true;
                }
            }
            // Err only means nobody is listening yet.
            let _ = sample_tx.send(sample);
            true
        }
        MessageType::Heartbeat => {
            link.mark_seen();
            trace!("[consumer] heartbeat");
            true
        }
        MessageType::Ack => {
            debug!(
                "[consumer] ack {} {}",
                msg.reason().unwrap_or("-"),
                msg.channel.as_deref().unwrap_or("-")
            );
            false
        }
        MessageType::Error => {
            warn!("[consumer] broker error: {}", msg.reason().unwrap_or("-"));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_broker::{BrokerHandle, spawn_broker};
    use pulse_core::config::BrokerConfig;
    use pulse_core::{Action, Channel};
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn client_config(ws_url: String) -> ClientConfig {
        ClientConfig {
            ws_url,
            channels: vec![Channel::Positions],
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            ..ClientConfig::default()
        }
    }

    async fn start_broker() -> (String, BrokerHandle, watch::Sender<bool>) {
        let broker = spawn_broker(&BrokerConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(pulse_broker::server::serve(listener, broker.clone(), None, rx));
        (url, broker, tx)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn next_sample(rx: &mut broadcast::Receiver<TelemetrySample>) -> TelemetrySample {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn receives_replay_then_live_samples_on_every_receiver() {
        let (url, broker, _srv) = start_broker().await;
        broker.publish(Channel::Positions, json!({"id": "P0"})).await.unwrap();

        let mut consumer = TelemetryConsumer::new(client_config(url));
        let mut a = consumer.samples();
        let mut b = consumer.samples();
        consumer.start();

        let first = next_sample(&mut a).await;
        assert!(first.replay);
        assert_eq!(first.channel, "positions");

        wait_until(|| consumer.is_connected()).await;
        broker.publish(Channel::Positions, json!({"id": "P1"})).await.unwrap();

        let live = next_sample(&mut a).await;
        assert!(!live.replay);
        assert_eq!(live.seq, Some(2));
        assert_eq!(next_sample(&mut b).await.seq, Some(1));
        assert_eq!(next_sample(&mut b).await.seq, Some(2));

        consumer.stop().await;
        assert!(!consumer.is_connected());
        assert_eq!(consumer.link().status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_without_start_is_noop() {
        let (url, broker, _srv) = start_broker().await;
        let mut consumer = TelemetryConsumer::new(client_config(url));
        consumer.stop().await;

        consumer.start();
        consumer.start();
        wait_until(|| consumer.is_connected()).await;
        assert_eq!(broker.stats().await.unwrap().connections, 1);

        consumer.stop().await;
        consumer.stop().await;
        assert!(!consumer.is_connected());
    }

    /// Accepts TCP connections and drops them before the handshake,
    /// counting every attempt.
    async fn refusing_server() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (url, attempts)
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts_and_restarts_on_start() {
        let (url, attempts) = refusing_server().await;
        let config = ClientConfig { max_reconnect_attempts: 2, ..client_config(url) };
        let mut consumer = TelemetryConsumer::new(config);
        let link = consumer.link();
        consumer.start();

        wait_until(|| link.is_exhausted()).await;
        assert!(!link.is_connected());
        assert_eq!(link.status(), ConnectionStatus::Disconnected);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // No retries once exhausted, across several max backoff periods.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(link.is_exhausted());

        consumer.start();
        assert!(!link.is_exhausted());
        wait_until(|| link.is_exhausted()).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn start_right_after_exhaustion_restarts() {
        let (url, attempts) = refusing_server().await;
        let config = ClientConfig { max_reconnect_attempts: 0, ..client_config(url) };
        let mut consumer = TelemetryConsumer::new(config);
        let link = consumer.link();
        consumer.start();

        wait_until(|| link.is_exhausted()).await;
        consumer.start();
        assert!(!link.is_exhausted());
        assert_eq!(link.status(), ConnectionStatus::Reconnecting);
        wait_until(|| attempts.load(Ordering::SeqCst) == 2 && link.is_exhausted()).await;
        consumer.stop().await;
    }

    #[tokio::test]
    async fn restart_does_not_re_emit_replayed_events() {
        let (url, broker, _srv) = start_broker().await;
        broker.publish(Channel::Positions, json!({"id": "P0"})).await.unwrap();

        let mut consumer = TelemetryConsumer::new(client_config(url));
        let mut rx = consumer.samples();
        consumer.start();
        assert_eq!(next_sample(&mut rx).await.seq, Some(1));
        consumer.stop().await;

        consumer.start();
        wait_until(|| consumer.is_connected()).await;
        broker.publish(Channel::Positions, json!({"id": "P1"})).await.unwrap();
        assert_eq!(next_sample(&mut rx).await.seq, Some(2));
        consumer.stop().await;
    }

    /// A hand-rolled server that accepts one socket and plays a script.
    async fn scripted_server(frames: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            // Keep the socket open but silent.
            while ws.next().await.is_some() {}
        });
        url
    }

    #[tokio::test]
    async fn malformed_and_duplicate_frames_are_dropped() {
        let event = |seq: u64| ServerMessage::event("positions", json!({"id": "P1"}), seq, "e1").to_json();
        let url = scripted_server(vec![
            "not json".into(),
            r#"{"type":"event","channel":"positions"}"#.into(),
            r#"{"type":"telemetry-v2","channel":"positions"}"#.into(),
            event(1),
            event(1),
            event(2),
        ])
        .await;

        let mut consumer = TelemetryConsumer::new(client_config(url));
        let mut rx = consumer.samples();
        consumer.start();

        assert_eq!(next_sample(&mut rx).await.seq, Some(1));
        assert_eq!(next_sample(&mut rx).await.seq, Some(2));
        assert!(consumer.is_connected());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn acks_and_errors_do_not_prove_liveness() {
        let url = scripted_server(vec![
            ServerMessage::ack(Action::Subscribe, "positions").to_json(),
            ServerMessage::error(Some("positions"), "busy").to_json(),
        ])
        .await;
        let mut consumer = TelemetryConsumer::new(client_config(url));
        let link = consumer.link();
        consumer.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!link.is_connected());
        assert_eq!(link.status(), ConnectionStatus::Reconnecting);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn silence_beyond_twice_the_heartbeat_drops_liveness() {
        let url = scripted_server(vec![ServerMessage::heartbeat().to_json()]).await;
        let config = ClientConfig {
            heartbeat_interval_ms: 100,
            max_reconnect_attempts: 0,
            ..client_config(url)
        };
        let mut consumer = TelemetryConsumer::new(config);
        let link = consumer.link();
        consumer.start();

        wait_until(|| link.is_connected()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!link.is_connected());
        consumer.stop().await;
    }
}
