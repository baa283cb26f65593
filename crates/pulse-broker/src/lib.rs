//! # pulse-broker
//!
//! Server-side channel broker for the telemetry push protocol.
//!
//! ## Architecture
//!
//! ```text
//! publisher ──► BrokerHandle ──cmd──► broker task (owns BrokerCore)
//!                                        │  replay ring per channel
//!                                        │  heartbeat timer
//!                                        └─try_send─► per-connection queue ──► ws writer
//! ws reader ──subscribe/unsubscribe──► BrokerHandle
//! ```
//!
//! - [`buffer`] — bounded per-channel replay ring
//! - [`registry`] — connection/subscription registry and fan-out ([`BrokerCore`])
//! - [`actor`] — single-owner task and its cloneable [`BrokerHandle`]
//! - [`server`] — WebSocket accept loop and per-connection session
//! - [`ingress`] — newline-delimited JSON publish input

pub mod actor;
pub mod buffer;
pub mod ingress;
pub mod registry;
pub mod server;

pub use actor::{BrokerHandle, spawn_broker};
pub use registry::{BrokerCore, BrokerStats, ConnectionId};
