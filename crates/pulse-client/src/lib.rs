//! # pulse-client
//!
//! Client side of the telemetry system: consumes the broker's push channel,
//! probes backend reachability, and maintains the normalized state observed
//! by the presentation layer.
//!
//! ```text
//! TelemetryConsumer ──samples──► StateAggregator ──watch──► observers
//!        │ link liveness              ▲      ▲
//!        └────────────────────────────┘      │ snapshots
//! HealthMonitor ──report─────────────────────┤
//! RestFallbackClient ◄──── polling / refresh ┘
//! ```
//!
//! Construct the graph once and pass handles explicitly; nothing here is
//! resolved from global state.
//!
//! - [`consumer`] — WebSocket connection lifecycle, decode loop, liveness
//! - [`health`] — periodic reachability probe with diagnostics
//! - [`fallback`] — REST snapshot source
//! - [`collections`] — bounded keyed collections and candle series
//! - [`state`] — single-owner normalized state store
//! - [`aggregator`] — push/poll failover and publication of state

pub mod aggregator;
pub mod collections;
pub mod consumer;
pub mod fallback;
pub mod health;
pub mod state;

#[cfg(test)]
pub(crate) mod test_net;

pub use aggregator::{AggregatorDeps, FeedMode, LivenessSource, StateAggregator, StatusReport};
pub use consumer::{ConsumerLink, TelemetryConsumer};
pub use fallback::{FallbackSource, RestFallbackClient};
pub use health::{HealthMonitor, HealthReport, HttpProbe, ProbeFailure, ReachabilityProbe};
