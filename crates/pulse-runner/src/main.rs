//! # pulse-runner
//!
//! Main entry point for the telemetry system.
//!
//! Loads a JSON configuration file and runs one side of the system:
//! - `broker` — the channel broker's WebSocket server, publishing
//!   newline-delimited JSON events read from stdin
//! - `watch` — the client stack (consumer, health monitor, aggregator),
//!   logging connection status and state changes
//!
//! # Usage
//!
//! ```bash
//! pulse-runner config.json --log-level info broker
//! pulse-runner config.json --log-json watch
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pulse_broker::ingress::run_ingress;
use pulse_broker::server::serve;
use pulse_client::{
    AggregatorDeps, HealthMonitor, HttpProbe, RestFallbackClient, StateAggregator,
    TelemetryConsumer,
};
use pulse_core::config::{AppConfig, BrokerConfig, ClientConfig};
use pulse_core::logging::{LogFormat, init_logging};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Real-time telemetry broker and client runner.
#[derive(Parser)]
#[command(name = "pulse-runner", about = "Real-time telemetry broker and client runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit console logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the channel broker.
    Broker {
        /// Do not read publish events from stdin.
        #[arg(long)]
        no_stdin: bool,
    },
    /// Run the client stack and log what it observes.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (before logging, so its logging section applies)
    let config = pulse_core::config::load_config(&cli.config)?;

    // 2. Initialize logging; CLI flags win over the config file
    let meta = config.logging.clone().unwrap_or_default();
    let format = if cli.log_json || meta.format.as_deref() == Some("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let log_dir = cli.log_dir.clone().or(meta.log_path);
    let module_name = meta.module_name.unwrap_or_else(|| "pulse-runner".to_string());
    init_logging(&cli.log_level, log_dir.as_deref(), &module_name, format);

    info!("pulse-runner starting — config={}, log_level={}", cli.config.display(), cli.log_level);

    match cli.mode {
        Mode::Broker { no_stdin } => run_broker(config, !no_stdin).await,
        Mode::Watch => run_watch(config).await,
    }
}

async fn run_broker(config: AppConfig, read_stdin: bool) -> Result<()> {
    let broker_config: BrokerConfig = config.broker.unwrap_or_default();
    broker_config.validate()?;

    let broker = pulse_broker::spawn_broker(&broker_config);
    let listener = TcpListener::bind(&broker_config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", broker_config.bind_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve(
        listener,
        broker.clone(),
        broker_config.auth_token.clone(),
        shutdown_rx,
    ));

    let ingress = read_stdin.then(|| {
        let broker = broker.clone();
        tokio::spawn(async move {
            match run_ingress(BufReader::new(tokio::io::stdin()), broker).await {
                Ok(n) => info!("stdin ingress finished — {n} event(s) published"),
                Err(e) => error!("stdin ingress failed: {e:#}"),
            }
        })
    });

    info!("broker running on {} — press Ctrl+C to stop", broker_config.bind_addr);
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await {
        error!("server task failed: {e}");
    }
    if let Some(task) = ingress {
        task.abort();
    }
    match broker.stats().await {
        Ok(stats) => info!(
            "final stats — connections={}, dropped={}, channels={:?}",
            stats.connections, stats.dropped, stats.channels
        ),
        Err(e) => warn!("stats unavailable: {e}"),
    }
    broker.shutdown().await;

    info!("broker stopped — goodbye");
    Ok(())
}

async fn run_watch(config: AppConfig) -> Result<()> {
    let client_config: ClientConfig = config.client.unwrap_or_default();
    client_config.validate()?;

    // Wire the graph once; every component receives its collaborators here.
    let mut consumer = TelemetryConsumer::new(client_config.clone());
    let probe = Arc::new(HttpProbe::from_config(&client_config)?);
    let mut monitor = HealthMonitor::new(probe, client_config.health_interval());
    let fallback = Arc::new(RestFallbackClient::from_config(&client_config)?);
    let mut aggregator = StateAggregator::spawn(
        &client_config,
        AggregatorDeps {
            liveness: Arc::new(consumer.link()),
            health: monitor.report(),
            samples: consumer.samples(),
            fallback,
        },
    );

    consumer.start();
    monitor.start_monitoring();
    let reporter = tokio::spawn(report_changes(aggregator_views(&aggregator)));

    info!("watching {} — press Ctrl+C to stop", client_config.ws_url);
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    consumer.stop().await;
    monitor.stop_monitoring().await;
    aggregator.shutdown().await;
    reporter.abort();

    info!("client stack stopped — goodbye");
    Ok(())
}

struct Views {
    status: watch::Receiver<pulse_client::StatusReport>,
    mode: watch::Receiver<pulse_client::FeedMode>,
    positions: watch::Receiver<Arc<Vec<pulse_core::OpenPosition>>>,
    trades: watch::Receiver<Arc<Vec<pulse_core::TradeRecord>>>,
    alerts: watch::Receiver<Arc<Vec<pulse_core::RiskAlert>>>,
}

fn aggregator_views(aggregator: &StateAggregator) -> Views {
    Views {
        status: aggregator.status(),
        mode: aggregator.mode(),
        positions: aggregator.positions(),
        trades: aggregator.trades(),
        alerts: aggregator.risk_alerts(),
    }
}

/// Log every published change until the aggregator goes away.
async fn report_changes(mut v: Views) {
    loop {
        tokio::select! {
            r = v.status.changed() => {
                if r.is_err() { return; }
                let report = v.status.borrow_and_update().clone();
                match report.diagnostic {
                    Some(diag) => warn!("status {} — {diag}", report.status),
                    None => info!("status {}", report.status),
                }
            }
            r = v.mode.changed() => {
                if r.is_err() { return; }
                info!("feed mode {:?}", *v.mode.borrow_and_update());
            }
            r = v.positions.changed() => {
                if r.is_err() { return; }
                info!("{} open position(s)", v.positions.borrow_and_update().len());
            }
            r = v.trades.changed() => {
                if r.is_err() { return; }
                let trades = v.trades.borrow_and_update().clone();
                if let Some(latest) = trades.first() {
                    info!("{} trade(s); latest {} {:?} {} @ {}", trades.len(), latest.symbol, latest.side, latest.qty, latest.price);
                }
            }
            r = v.alerts.changed() => {
                if r.is_err() { return; }
                if let Some(alert) = v.alerts.borrow_and_update().first() {
                    warn!("risk alert [{}] {}", alert.severity, alert.message);
                }
            }
        }
    }
}
