//! Connection health monitor.
//!
//! Probes backend reachability on a fixed interval and publishes a
//! [`HealthReport`] through a `watch` channel. The probe is a trait so the
//! monitor can be driven by a fake in tests; [`HttpProbe`] is the production
//! implementation (`GET {api_base}/api/health`, 2xx = reachable).

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulse_core::ConnectionStatus;
use pulse_core::config::ClientConfig;
use pulse_core::error::PulseError;
use pulse_core::time_util::now_ms;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const HEALTH_PATH: &str = "/api/health";

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Nothing is listening on the target port.
    Refused,
    /// No answer within the probe timeout.
    Timeout,
    /// Any other failure (DNS, TLS, non-2xx, ...).
    Generic,
}

#[derive(Debug, Clone)]
pub struct ProbeError {
    pub kind: ProbeFailure,
    pub detail: String,
}

impl ProbeError {
    pub fn new(kind: ProbeFailure, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

/// One reachability check against the backend.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;

    /// `host:port` named in diagnostics.
    fn target(&self) -> String;

    /// Timeout applied to each probe, named in timeout diagnostics.
    fn timeout(&self) -> Duration;
}

// ---------------------------------------------------------------------------
// HttpProbe
// ---------------------------------------------------------------------------

pub struct HttpProbe {
    http: reqwest::Client,
    url: String,
    target: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self, PulseError> {
        let base = url::Url::parse(api_base_url)
            .map_err(|e| PulseError::Config(format!("bad api_base_url {api_base_url}: {e}")))?;
        let host = base.host_str().unwrap_or("localhost");
        let target = match base.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PulseError::Probe(format!("http client: {e}")))?;
        Ok(Self {
            http,
            url: format!("{}{HEALTH_PATH}", api_base_url.trim_end_matches('/')),
            target,
            timeout,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, PulseError> {
        Self::new(&config.api_base_url, config.probe_timeout())
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        let request = self.http.get(&self.url).send();
        match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Err(ProbeError::new(ProbeFailure::Timeout, "no response")),
            Ok(Err(e)) => Err(classify(&e)),
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(ProbeError::new(
                ProbeFailure::Generic,
                format!("HTTP {}", resp.status()),
            )),
        }
    }

    fn target(&self) -> String {
        self.target.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn classify(err: &reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::new(ProbeFailure::Timeout, err.to_string());
    }
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return ProbeError::new(ProbeFailure::Refused, io.to_string());
                }
                std::io::ErrorKind::TimedOut => {
                    return ProbeError::new(ProbeFailure::Timeout, io.to_string());
                }
                _ => {}
            }
        }
        source = cause.source();
    }
    ProbeError::new(ProbeFailure::Generic, err.to_string())
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: ConnectionStatus,
    pub failure: Option<ProbeFailure>,
    /// Human-readable remediation hint; `None` while healthy.
    pub diagnostic: Option<String>,
    pub consecutive_failures: u32,
    pub last_checked_ms: Option<i64>,
}

impl HealthReport {
    /// Before the first probe completes the backend state is unknown.
    pub fn unknown() -> Self {
        Self {
            status: ConnectionStatus::Reconnecting,
            failure: None,
            diagnostic: None,
            consecutive_failures: 0,
            last_checked_ms: None,
        }
    }

    pub fn healthy() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            failure: None,
            diagnostic: None,
            consecutive_failures: 0,
            last_checked_ms: Some(now_ms()),
        }
    }
}

fn diagnose(err: &ProbeError, target: &str, timeout: Duration) -> String {
    match err.kind {
        ProbeFailure::Refused => format!(
            "Connection refused by {target}: the trading core service is not running. \
             Start it and make sure it listens on {target}."
        ),
        ProbeFailure::Timeout => format!(
            "Health check to {target} timed out after {:.1}s: the service is overloaded \
             or the network path is blocked. Check firewalls and service load on {target}.",
            timeout.as_secs_f64()
        ),
        ProbeFailure::Generic => format!(
            "Cannot reach the trading core service at {target} ({}). \
             Verify the API base URL and that the service is healthy.",
            err.detail
        ),
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    report_tx: Arc<watch::Sender<HealthReport>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, interval: Duration) -> Self {
        let (report_tx, _) = watch::channel(HealthReport::unknown());
        Self {
            probe,
            interval,
            report_tx: Arc::new(report_tx),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn report(&self) -> watch::Receiver<HealthReport> {
        self.report_tx.subscribe()
    }

    pub fn current(&self) -> HealthReport {
        self.report_tx.borrow().clone()
    }

    /// Start probing. The first probe runs immediately. No-op while running.
    pub fn start_monitoring(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("[health] already monitoring");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe = self.probe.clone();
        let report_tx = self.report_tx.clone();
        let interval = self.interval;

        info!("[health] monitoring {} every {interval:?}", probe.target());
        self.task = Some(tokio::spawn(monitor_loop(probe, report_tx, interval, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Stop probing and wait for the loop to exit. The last report stays
    /// visible.
    pub async fn stop_monitoring(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("[health] monitor task panicked: {e}");
            }
        }
    }
}

async fn monitor_loop(
    probe: Arc<dyn ReachabilityProbe>,
    report_tx: Arc<watch::Sender<HealthReport>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let target = probe.target();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("[health] monitoring stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = shutdown_rx.changed() => return,
            outcome = probe.probe() => outcome,
        };

        let previous = report_tx.borrow().clone();
        let next = match outcome {
            Ok(()) => {
                if previous.status != ConnectionStatus::Connected {
                    info!("[health] {target} reachable");
                }
                HealthReport::healthy()
            }
            Err(err) => {
                let failures = previous.consecutive_failures.saturating_add(1);
                let diagnostic = diagnose(&err, &target, probe.timeout());
                if previous.failure != Some(err.kind) {
                    warn!("[health] {diagnostic}");
                } else {
                    debug!("[health] still failing ({failures}): {}", err.detail);
                }
                HealthReport {
                    status: ConnectionStatus::Disconnected,
                    failure: Some(err.kind),
                    diagnostic: Some(diagnostic),
                    consecutive_failures: failures,
                    last_checked_ms: Some(now_ms()),
                }
            }
        };
        report_tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_net;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        failure: Option<ProbeFailure>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReachabilityProbe for FakeProbe {
        async fn probe(&self) -> Result<(), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failure {
                Some(kind) => Err(ProbeError::new(kind, "fake")),
                None => Ok(()),
            }
        }

        fn target(&self) -> String {
            "core.local:8080".into()
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(3)
        }
    }

    fn fake(failure: Option<ProbeFailure>) -> Arc<FakeProbe> {
        Arc::new(FakeProbe { failure, calls: AtomicUsize::new(0) })
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_report_disconnected_with_timeout_diagnostic() {
        let probe = fake(Some(ProbeFailure::Timeout));
        let mut monitor = HealthMonitor::new(probe.clone(), Duration::from_secs(5));
        assert_eq!(monitor.current().status, ConnectionStatus::Reconnecting);

        monitor.start_monitoring();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let report = monitor.current();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.status, ConnectionStatus::Disconnected);
        assert_eq!(report.failure, Some(ProbeFailure::Timeout));
        assert_eq!(report.consecutive_failures, 3);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("timed out"));
        assert!(diagnostic.contains("core.local:8080"));
        monitor.stop_monitoring().await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_diagnostic_and_start_is_idempotent() {
        let probe = fake(None);
        let mut monitor = HealthMonitor::new(probe.clone(), Duration::from_secs(5));
        monitor.start_monitoring();
        monitor.start_monitoring();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        let report = monitor.current();
        assert_eq!(report.status, ConnectionStatus::Connected);
        assert!(report.diagnostic.is_none());

        monitor.stop_monitoring().await;
        monitor.stop_monitoring().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn http_probe_classifies_failures() {
        let server = MockServer::start_async().await;
        let health = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/health");
                then.status(200).body("{}");
            })
            .await;
        let probe = HttpProbe::new(&server.base_url(), Duration::from_secs(2)).unwrap();
        assert!(probe.probe().await.is_ok());
        health.assert_async().await;

        let missing = MockServer::start_async().await;
        let probe = HttpProbe::new(&missing.base_url(), Duration::from_secs(2)).unwrap();
        assert_eq!(probe.probe().await.unwrap_err().kind, ProbeFailure::Generic);

        let closed = test_net::closed_port().await;
        let probe = HttpProbe::new(&format!("http://{closed}"), Duration::from_secs(2)).unwrap();
        assert_eq!(probe.probe().await.unwrap_err().kind, ProbeFailure::Refused);
        assert_eq!(probe.target(), closed.to_string());

        let silent = test_net::black_hole().await;
        let probe = HttpProbe::new(&format!("http://{silent}"), Duration::from_millis(200)).unwrap();
        assert_eq!(probe.probe().await.unwrap_err().kind, ProbeFailure::Timeout);
    }

    #[test]
    fn refused_diagnostic_names_target() {
        let err = ProbeError::new(ProbeFailure::Refused, "refused");
        let text = diagnose(&err, "127.0.0.1:8080", Duration::from_secs(3));
        assert!(text.contains("refused"));
        assert!(text.contains("127.0.0.1:8080"));
    }
}
