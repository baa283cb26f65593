//! # pulse-core
//!
//! Core crate for the Pulse telemetry system, providing:
//!
//! - **Types** (`types`) — wire envelope, channel names, domain events, normalized entities
//! - **Configuration** (`config`) — JSON config deserialization with defaults
//! - **Error types** (`error`) — domain-specific `PulseError` via thiserror
//! - **Deduplication** (`dedup`) — sequence and timestamp gates for replayed events
//! - **JSON helpers** (`json_util`) — lenient numeric decoding for loosely typed payloads
//! - **Time utilities** (`time_util`) — wall-clock timestamps
//! - **Logging** (`logging`) — tracing-based structured logging

pub mod config;
pub mod dedup;
pub mod error;
pub mod json_util;
pub mod logging;
pub mod time_util;
pub mod types;

// Re-export types at crate root for convenience.
pub use types::*;
