//! Resilient state aggregator.
//!
//! One task owns the [`StateStore`] and is the only writer of every observed
//! collection. It:
//! 1. Applies push samples from the consumer as they arrive. While polling,
//!    samples for polled collections (positions, candles) are dropped.
//! 2. Every `reconcile_interval`, decides whether push is trustworthy (consumer
//!    live and health not `Disconnected`) and switches [`FeedMode`].
//! 3. While `Polling`, pulls full snapshots from the fallback source every
//!    `poll_interval` and overwrites positions, trades and candles.
//! 4. Publishes each collection as an `Arc<Vec<_>>` through a `watch` channel.
//!
//! Pulls run on spawned tasks and report back over an mpsc queue, so a slow
//! backend never blocks sample processing.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use pulse_core::config::ClientConfig;
use pulse_core::error::PulseError;
use pulse_core::{
    Candlestick, Channel, ConnectionStatus, OpenPosition, RiskAlert, TelemetrySample, TradeRecord,
    TraderState,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::fallback::FallbackSource;
use crate::health::HealthReport;
use crate::state::{Changes, StateStore};

const COMMAND_QUEUE: usize = 64;
const PULL_QUEUE: usize = 64;

/// Push-link liveness as seen by the aggregator.
pub trait LivenessSource: Send + Sync {
    fn is_connected(&self) -> bool;

    fn status(&self) -> ConnectionStatus;

    /// `true` once the consumer stopped retrying.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Which source currently feeds positions, trades and candles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Idle,
    Push,
    Polling,
}

/// Reconciled connection status shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: ConnectionStatus,
    pub diagnostic: Option<String>,
    pub push: ConnectionStatus,
    pub health: ConnectionStatus,
}

impl StatusReport {
    fn initial() -> Self {
        Self {
            status: ConnectionStatus::Reconnecting,
            diagnostic: None,
            push: ConnectionStatus::Reconnecting,
            health: ConnectionStatus::Reconnecting,
        }
    }
}

/// Everything the aggregator reads from. Wired once by the caller.
pub struct AggregatorDeps {
    pub liveness: Arc<dyn LivenessSource>,
    pub health: watch::Receiver<HealthReport>,
    pub samples: broadcast::Receiver<TelemetrySample>,
    pub fallback: Arc<dyn FallbackSource>,
}

enum Command {
    Candles {
        timeframe: String,
        reply: oneshot::Sender<watch::Receiver<Arc<Vec<Candlestick>>>>,
    },
}

/// Why a pull was issued; decides whether its result may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOrigin {
    /// Periodic poll; applied only while still polling.
    Poll,
    /// Recovery after the sample stream lagged; always applied.
    Resync,
    /// Trade history refresh after a position closed.
    TradeRefresh,
}

enum PullResult {
    Positions(PullOrigin, Result<Vec<OpenPosition>, PulseError>),
    Trades(PullOrigin, Result<Vec<TradeRecord>, PulseError>),
    Candles(String, Result<Option<Vec<Candlestick>>, PulseError>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the aggregator task. Receivers obtained from it stay valid (with
/// their last value) after shutdown.
pub struct StateAggregator {
    positions: watch::Receiver<Arc<Vec<OpenPosition>>>,
    trades: watch::Receiver<Arc<Vec<TradeRecord>>>,
    traders: watch::Receiver<Arc<Vec<TraderState>>>,
    alerts: watch::Receiver<Arc<Vec<RiskAlert>>>,
    status: watch::Receiver<StatusReport>,
    mode: watch::Receiver<FeedMode>,
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StateAggregator {
    /// Spawn the aggregator task.
    pub fn spawn(config: &ClientConfig, deps: AggregatorDeps) -> Self {
        let (positions_tx, positions) = watch::channel(Arc::new(Vec::new()));
        let (trades_tx, trades) = watch::channel(Arc::new(Vec::new()));
        let (traders_tx, traders) = watch::channel(Arc::new(Vec::new()));
        let (alerts_tx, alerts) = watch::channel(Arc::new(Vec::new()));
        let (status_tx, status) = watch::channel(StatusReport::initial());
        let (mode_tx, mode) = watch::channel(FeedMode::Idle);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pull_tx, pull_rx) = mpsc::channel(PULL_QUEUE);

        let mut candle_tx = AHashMap::new();
        for timeframe in &config.timeframes {
            let (tx, _) = watch::channel(Arc::new(Vec::new()));
            candle_tx.insert(timeframe.clone(), tx);
        }

        let state = AggregatorState {
            store: StateStore::new(config.history_limit),
            history_limit: config.history_limit,
            ws_url: config.ws_url.clone(),
            mode: FeedMode::Idle,
            liveness: deps.liveness,
            health: deps.health,
            fallback: deps.fallback,
            pull_tx,
            poll_in_flight: false,
            positions_tx,
            trades_tx,
            traders_tx,
            alerts_tx,
            candle_tx,
            status_tx,
            mode_tx,
        };
        let io = Io {
            samples: Some(deps.samples),
            cmd_rx,
            pull_rx,
            shutdown_rx,
            reconcile: config.reconcile_interval(),
            poll: config.poll_interval(),
        };

        info!(
            "[aggregator] starting — reconcile={:?}, poll={:?}, limit={}",
            config.reconcile_interval(),
            config.poll_interval(),
            config.history_limit
        );
        let task = tokio::spawn(run(state, io));

        Self {
            positions,
            trades,
            traders,
            alerts,
            status,
            mode,
            cmd_tx,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn positions(&self) -> watch::Receiver<Arc<Vec<OpenPosition>>> {
        self.positions.clone()
    }

    pub fn trades(&self) -> watch::Receiver<Arc<Vec<TradeRecord>>> {
        self.trades.clone()
    }

    pub fn trader_states(&self) -> watch::Receiver<Arc<Vec<TraderState>>> {
        self.traders.clone()
    }

    pub fn risk_alerts(&self) -> watch::Receiver<Arc<Vec<RiskAlert>>> {
        self.alerts.clone()
    }

    pub fn status(&self) -> watch::Receiver<StatusReport> {
        self.status.clone()
    }

    pub fn mode(&self) -> watch::Receiver<FeedMode> {
        self.mode.clone()
    }

    /// Live candle series for `timeframe`. Returns immediately with whatever
    /// is known; when polling, a refresh is triggered in the background.
    pub async fn candlesticks(
        &self,
        timeframe: &str,
    ) -> Result<watch::Receiver<Arc<Vec<Candlestick>>>, PulseError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Candles { timeframe: timeframe.to_string(), reply })
            .await
            .map_err(|_| PulseError::Fallback("aggregator stopped".into()))?;
        rx.await.map_err(|_| PulseError::Fallback("aggregator stopped".into()))
    }

    /// Stop the task. Mode ends as `Idle`; published values stay readable.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[aggregator] task panicked: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

struct Io {
    samples: Option<broadcast::Receiver<TelemetrySample>>,
    cmd_rx: mpsc::Receiver<Command>,
    pull_rx: mpsc::Receiver<PullResult>,
    shutdown_rx: watch::Receiver<bool>,
    reconcile: Duration,
    poll: Duration,
}

struct AggregatorState {
    store: StateStore,
    history_limit: usize,
    ws_url: String,
    mode: FeedMode,
    liveness: Arc<dyn LivenessSource>,
    health: watch::Receiver<HealthReport>,
    fallback: Arc<dyn FallbackSource>,
    pull_tx: mpsc::Sender<PullResult>,
    poll_in_flight: bool,
    positions_tx: watch::Sender<Arc<Vec<OpenPosition>>>,
    trades_tx: watch::Sender<Arc<Vec<TradeRecord>>>,
    traders_tx: watch::Sender<Arc<Vec<TraderState>>>,
    alerts_tx: watch::Sender<Arc<Vec<RiskAlert>>>,
    candle_tx: AHashMap<String, watch::Sender<Arc<Vec<Candlestick>>>>,
    status_tx: watch::Sender<StatusReport>,
    mode_tx: watch::Sender<FeedMode>,
}

async fn run(mut state: AggregatorState, mut io: Io) {
    let mut reconcile = tokio::time::interval(io.reconcile);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll: Option<Interval> = None;

    loop {
        tokio::select! {
            _ = io.shutdown_rx.changed() => break,

            Some(cmd) = io.cmd_rx.recv() => state.handle_command(cmd),

            received = next_sample(&mut io.samples) => match received {
                Ok(sample) => state.handle_sample(&sample),
                Err(RecvError::Lagged(n)) => {
                    warn!("[aggregator] sample stream lagged by {n}; resyncing positions");
                    state.spawn_positions_pull(PullOrigin::Resync);
                }
                Err(RecvError::Closed) => {
                    warn!("[aggregator] sample stream closed");
                    io.samples = None;
                }
            },

            _ = reconcile.tick() => {
                if let Some(polling) = state.reconcile() {
                    poll = polling.then(|| {
                        let mut interval = tokio::time::interval(io.poll);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        interval
                    });
                }
            }

            _ = next_tick(&mut poll) => state.poll(),

            Some(result) = io.pull_rx.recv() => state.apply_pull(result),
        }
    }

    state.set_mode(FeedMode::Idle);
    info!("[aggregator] stopped");
}

async fn next_sample(
    samples: &mut Option<broadcast::Receiver<TelemetrySample>>,
) -> Result<TelemetrySample, RecvError> {
    match samples {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl AggregatorState {
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Candles { timeframe, reply } => {
                let rx = self.candle_sender(&timeframe).subscribe();
                if self.mode == FeedMode::Polling {
                    self.spawn_candles_pull(timeframe);
                }
                let _ = reply.send(rx);
            }
        }
    }

    fn candle_sender(&mut self, timeframe: &str) -> &watch::Sender<Arc<Vec<Candlestick>>> {
        let store = &self.store;
        self.candle_tx.entry(timeframe.to_string()).or_insert_with(|| {
            let (tx, _) = watch::channel(store.candles(timeframe));
            tx
        })
    }

    fn handle_sample(&mut self, sample: &TelemetrySample) {
        let Some(channel) = Channel::parse(&sample.channel) else {
            debug!("[aggregator] ignoring sample on unknown channel {:?}", sample.channel);
            return;
        };
        // Polled collections have exactly one writer while polling.
        if self.mode == FeedMode::Polling && channel.is_polled() {
            debug!("[aggregator] polling; dropping {channel} push sample");
            return;
        }
        match self.store.apply_sample(channel, &sample.payload) {
            Ok(changes) => {
                if changes.refresh_trades {
                    self.spawn_trades_pull(PullOrigin::TradeRefresh);
                }
                self.publish(&changes);
            }
            Err(e) => warn!("[aggregator] dropping {channel} sample: {e}"),
        }
    }

    // -- Reconciliation -----------------------------------------------------

    /// Re-evaluate the feed mode. Returns `Some(true)` when polling must
    /// start, `Some(false)` when it must stop, `None` when unchanged.
    fn reconcile(&mut self) -> Option<bool> {
        let health = self.health.borrow().status;
        let push_ok = self.liveness.is_connected() && health != ConnectionStatus::Disconnected;

        let transition = match (push_ok, self.mode) {
            (true, FeedMode::Push) | (false, FeedMode::Polling) => None,
            (true, _) => {
                info!("[aggregator] push channel healthy; polling stopped");
                self.set_mode(FeedMode::Push);
                Some(false)
            }
            (false, _) => {
                warn!("[aggregator] push channel unavailable; polling fallback started");
                self.set_mode(FeedMode::Polling);
                Some(true)
            }
        };
        self.publish_status();
        transition
    }

    fn set_mode(&mut self, mode: FeedMode) {
        self.mode = mode;
        self.mode_tx.send_replace(mode);
    }

    fn publish_status(&self) {
        let push = self.liveness.status();
        let health = self.health.borrow().clone();
        let status = push.most_pessimistic(health.status);

        // Prefer the health diagnostic; it names the unreachable host.
        let diagnostic = if health.status == ConnectionStatus::Disconnected {
            health.diagnostic.clone()
        } else if self.liveness.is_exhausted() {
            Some(format!(
                "Live updates from {} stopped after repeated reconnect failures; \
                 restart the telemetry connection.",
                self.ws_url
            ))
        } else if push == ConnectionStatus::Reconnecting {
            Some(format!("Reconnecting to the telemetry stream at {}.", self.ws_url))
        } else {
            None
        };

        let report = StatusReport { status, diagnostic, push, health: health.status };
        self.status_tx.send_if_modified(|current| {
            if *current == report {
                return false;
            }
            *current = report;
            true
        });
    }

    // -- Polling ------------------------------------------------------------

    fn poll(&mut self) {
        if self.mode != FeedMode::Polling {
            return;
        }
        if self.poll_in_flight {
            debug!("[aggregator] previous poll still running; skipping");
            return;
        }
        self.poll_in_flight = true;

        let fallback = self.fallback.clone();
        let tx = self.pull_tx.clone();
        let limit = self.history_limit;
        let timeframes: Vec<String> = self.candle_tx.keys().cloned().collect();
        tokio::spawn(async move {
            let positions = fallback.open_positions().await;
            let _ = tx.send(PullResult::Positions(PullOrigin::Poll, positions)).await;
            let trades = fallback.trades(limit).await;
            let _ = tx.send(PullResult::Trades(PullOrigin::Poll, trades)).await;
            for timeframe in timeframes {
                let candles = fallback.candlesticks(&timeframe, limit).await;
                let _ = tx.send(PullResult::Candles(timeframe, candles)).await;
            }
        });
    }

    fn spawn_positions_pull(&self, origin: PullOrigin) {
        let fallback = self.fallback.clone();
        let tx = self.pull_tx.clone();
        tokio::spawn(async move {
            let result = fallback.open_positions().await;
            let _ = tx.send(PullResult::Positions(origin, result)).await;
        });
    }

    fn spawn_trades_pull(&self, origin: PullOrigin) {
        let fallback = self.fallback.clone();
        let tx = self.pull_tx.clone();
        let limit = self.history_limit;
        tokio::spawn(async move {
            let result = fallback.trades(limit).await;
            let _ = tx.send(PullResult::Trades(origin, result)).await;
        });
    }

    fn spawn_candles_pull(&self, timeframe: String) {
        let fallback = self.fallback.clone();
        let tx = self.pull_tx.clone();
        let limit = self.history_limit;
        tokio::spawn(async move {
            let result = fallback.candlesticks(&timeframe, limit).await;
            let _ = tx.send(PullResult::Candles(timeframe, result)).await;
        });
    }

    fn apply_pull(&mut self, result: PullResult) {
        let polling = self.mode == FeedMode::Polling;
        let changes = match result {
            PullResult::Positions(origin, result) => {
                if origin == PullOrigin::Poll && !polling {
                    debug!("[aggregator] discarding positions poll after switching to push");
                    return;
                }
                match result {
                    Ok(snapshot) => self.store.replace_positions(snapshot),
                    Err(e) => {
                        warn!("[aggregator] positions pull failed, keeping previous state: {e}");
                        return;
                    }
                }
            }
            PullResult::Trades(origin, result) => {
                if origin == PullOrigin::Poll {
                    self.poll_in_flight = false;
                }
                match result {
                    Ok(snapshot) => self.store.replace_trades(snapshot),
                    Err(e) => {
                        warn!("[aggregator] trades pull failed, keeping previous state: {e}");
                        return;
                    }
                }
            }
            PullResult::Candles(timeframe, result) => {
                if !polling {
                    return;
                }
                match result {
                    Ok(Some(snapshot)) => self.store.replace_candles(&timeframe, snapshot),
                    Ok(None) => {
                        debug!("[aggregator] no candlestick data for {timeframe}");
                        return;
                    }
                    Err(e) => {
                        warn!("[aggregator] {timeframe} candles pull failed, keeping previous state: {e}");
                        return;
                    }
                }
            }
        };
        self.publish(&changes);
    }

    fn publish(&mut self, changes: &Changes) {
        if changes.positions {
            self.positions_tx.send_replace(self.store.positions());
        }
        if changes.trades {
            self.trades_tx.send_replace(self.store.trades());
        }
        if changes.traders {
            self.traders_tx.send_replace(self.store.traders());
        }
        if changes.alerts {
            self.alerts_tx.send_replace(self.store.alerts());
        }
        if let Some(timeframe) = &changes.candles {
            let series = self.store.candles(timeframe);
            self.candle_sender(timeframe).send_replace(series);
        }
    }
}
