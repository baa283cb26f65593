//! Enumerations used throughout the telemetry system.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Subscribable channels multiplexed over one connection.
///
/// `heartbeat` is a message type, not a channel, and has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "positions")]
    Positions,
    #[serde(rename = "market-data")]
    MarketData,
    #[serde(rename = "trader-status")]
    TraderStatus,
    #[serde(rename = "risk-alerts")]
    RiskAlerts,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Channel; 4] = [
        Channel::Positions,
        Channel::MarketData,
        Channel::TraderStatus,
        Channel::RiskAlerts,
    ];

    /// Wire name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positions => "positions",
            Self::MarketData => "market-data",
            Self::TraderStatus => "trader-status",
            Self::RiskAlerts => "risk-alerts",
        }
    }

    /// Look up a channel by wire name. Returns `None` for anything unknown,
    /// including `"heartbeat"`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "positions" => Some(Self::Positions),
            "market-data" => Some(Self::MarketData),
            "trader-status" => Some(Self::TraderStatus),
            "risk-alerts" => Some(Self::RiskAlerts),
            _ => None,
        }
    }

    /// Whether the REST fallback also snapshots this channel's collection.
    pub fn is_polled(self) -> bool {
        matches!(self, Self::Positions | Self::MarketData)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire message discriminator
// ---------------------------------------------------------------------------

/// The `type` field of a [`ServerMessage`](super::ServerMessage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Event,
    Heartbeat,
    Ack,
    Error,
}

impl MessageType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "event" => Some(Self::Event),
            "heartbeat" => Some(Self::Heartbeat),
            "ack" => Some(Self::Ack),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Client → server request action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe => f.write_str("subscribe"),
            Self::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

// ---------------------------------------------------------------------------
// Position lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state carried by a position event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    #[serde(alias = "open")]
    Open,
    #[serde(alias = "updated")]
    Updated,
    #[serde(alias = "closed")]
    Closed,
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy", alias = "LONG", alias = "long")]
    Buy,
    #[serde(alias = "sell", alias = "SHORT", alias = "short")]
    Sell,
}

impl Side {
    /// Map a free-form position `action` (e.g. `"BUY"`, `"open_long"`) to a side.
    pub fn from_action(action: &str) -> Option<Self> {
        let a = action.to_ascii_lowercase();
        if a.contains("buy") || a.contains("long") {
            Some(Self::Buy)
        } else if a.contains("sell") || a.contains("short") {
            Some(Self::Sell)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Tri-state connection status.
///
/// Variants are ordered from most to least optimistic, so `max()` of two
/// statuses is the more pessimistic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionStatus {
    /// The more pessimistic of two statuses.
    pub fn most_pessimistic(self, other: Self) -> Self {
        self.max(other)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => f.write_str("CONNECTED"),
            Self::Reconnecting => f.write_str("RECONNECTING"),
            Self::Disconnected => f.write_str("DISCONNECTED"),
        }
    }
}
