//! Wire protocol: server envelope, client requests, and the transport sample.
//!
//! Frames are textual JSON, one object per frame.
//!
//! ```text
//! client → server   {"action":"subscribe","channel":"positions"}
//! server → client   {"type":"event","channel":"positions","data":{..},"replay":false,
//!                    "meta":{"seq":"42","epoch":"…"},"timestamp":1700000000000}
//! ```

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enums::{Action, MessageType};
use crate::error::PulseError;
use crate::time_util::now_ms;

/// Meta key carrying the per-channel publish sequence number.
pub const META_SEQ: &str = "seq";
/// Meta key carrying the broker instance id; a change means sequences restarted.
pub const META_EPOCH: &str = "epoch";
/// Meta key carrying a human-readable reason on `ack` / `error` messages.
pub const META_REASON: &str = "reason";

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// Server → client envelope.
///
/// Every `event` message has a non-null `channel` and `data`; [`ServerMessage::decode`]
/// rejects events that violate this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// `true` when delivered from the broker's replay buffer rather than live.
    #[serde(default)]
    pub replay: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, String>>,
    /// Milliseconds since Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl ServerMessage {
    /// A live event on `channel`.
    pub fn event(channel: &str, data: Value, seq: u64, epoch: &str) -> Self {
        let mut meta = HashMap::with_capacity(2);
        meta.insert(META_SEQ.to_string(), seq.to_string());
        meta.insert(META_EPOCH.to_string(), epoch.to_string());
        Self {
            kind: MessageType::Event,
            channel: Some(channel.to_string()),
            data: Some(data),
            replay: false,
            meta: Some(meta),
            timestamp: now_ms(),
        }
    }

    /// The same message marked as delivered from the replay buffer.
    pub fn as_replay(&self) -> Self {
        Self { replay: true, ..self.clone() }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: MessageType::Heartbeat,
            channel: None,
            data: None,
            replay: false,
            meta: None,
            timestamp: now_ms(),
        }
    }

    /// Acknowledge a subscribe/unsubscribe request.
    pub fn ack(action: Action, channel: &str) -> Self {
        Self {
            kind: MessageType::Ack,
            channel: Some(channel.to_string()),
            data: None,
            replay: false,
            meta: Some(HashMap::from([(META_REASON.to_string(), action.to_string())])),
            timestamp: now_ms(),
        }
    }

    pub fn error(channel: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Error,
            channel: channel.map(str::to_string),
            data: None,
            replay: false,
            meta: Some(HashMap::from([(META_REASON.to_string(), reason.into())])),
            timestamp: now_ms(),
        }
    }

    fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta.as_ref()?.get(key).map(String::as_str)
    }

    /// Per-channel publish sequence number, if the broker stamped one.
    pub fn seq(&self) -> Option<u64> {
        self.meta_value(META_SEQ)?.parse().ok()
    }

    /// Broker instance id, if present.
    pub fn epoch(&self) -> Option<&str> {
        self.meta_value(META_EPOCH)
    }

    pub fn reason(&self) -> Option<&str> {
        self.meta_value(META_REASON)
    }

    /// Decode one text frame.
    ///
    /// The `type` discriminator is validated before the rest of the envelope:
    /// - unknown `type` → `Ok(None)` (ignored for forward compatibility)
    /// - invalid JSON, missing `type`, or an `event` without `channel`/`data` → `Err`
    pub fn decode(text: &str) -> Result<Option<Self>, PulseError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PulseError::protocol(format!("invalid json: {e}")))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| PulseError::protocol("frame has no string `type`"))?;
        if MessageType::parse(kind).is_none() {
            return Ok(None);
        }

        let msg: ServerMessage = serde_json::from_value(value)
            .map_err(|e| PulseError::protocol(format!("bad envelope: {e}")))?;

        if msg.kind == MessageType::Event {
            let has_channel = msg.channel.as_deref().is_some_and(|c| !c.is_empty());
            let has_data = msg.data.as_ref().is_some_and(|d| !d.is_null());
            if !has_channel || !has_data {
                return Err(PulseError::protocol("event frame without channel or data"));
            }
        }
        Ok(Some(msg))
    }

    pub fn to_json(&self) -> String {
        // Serializing a struct of strings/values cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// ClientRequest
// ---------------------------------------------------------------------------

/// Client → server request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub action: Action,
    pub channel: String,
}

impl ClientRequest {
    pub fn subscribe(channel: &str) -> Self {
        Self { action: Action::Subscribe, channel: channel.to_string() }
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self { action: Action::Unsubscribe, channel: channel.to_string() }
    }

    pub fn decode(text: &str) -> Result<Self, PulseError> {
        serde_json::from_str(text).map_err(|e| PulseError::protocol(format!("bad request: {e}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// TelemetrySample
// ---------------------------------------------------------------------------

/// The minimal unit handed from the transport to domain parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub channel: String,
    /// Raw JSON bytes of the event `data`.
    pub payload: Vec<u8>,
    pub replay: bool,
    pub seq: Option<u64>,
}

impl TelemetrySample {
    pub fn new(channel: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { channel: channel.into(), payload, replay: false, seq: None }
    }

    /// Build a sample from a validated `event` message. Returns `None` for
    /// every other message type.
    pub fn from_event(msg: &ServerMessage) -> Option<Self> {
        if msg.kind != MessageType::Event {
            return None;
        }
        let channel = msg.channel.clone()?;
        let payload = serde_json::to_vec(msg.data.as_ref()?).ok()?;
        Some(Self { channel, payload, replay: msg.replay, seq: msg.seq() })
    }

    /// Decode the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PulseError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            PulseError::protocol(format!("bad `{}` payload: {e}", self.channel))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_event() {
        let text = r#"{"type":"event","channel":"positions","data":{"id":"P1"},
            "replay":true,"meta":{"seq":"7","epoch":"e1"},"timestamp":1}"#;
        let msg = ServerMessage::decode(text).unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Event);
        assert!(msg.replay);
        assert_eq!(msg.seq(), Some(7));
        assert_eq!(msg.epoch(), Some("e1"));

        let sample = TelemetrySample::from_event(&msg).unwrap();
        assert_eq!(sample.channel, "positions");
        assert_eq!(sample.seq, Some(7));
        let v: Value = sample.decode().unwrap();
        assert_eq!(v, json!({"id": "P1"}));
    }

    #[test]
    fn decode_heartbeat_without_optional_fields() {
        let msg = ServerMessage::decode(r#"{"type":"heartbeat","timestamp":5}"#).unwrap().unwrap();
        assert_eq!(msg.kind, MessageType::Heartbeat);
        assert!(!msg.replay);
        assert!(TelemetrySample::from_event(&msg).is_none());
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert_eq!(ServerMessage::decode(r#"{"type":"snapshot","data":1}"#).unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ServerMessage::decode("not json").is_err());
        assert!(ServerMessage::decode(r#"{"channel":"positions"}"#).is_err());
        assert!(ServerMessage::decode(r#"{"type":"event","data":{"a":1}}"#).is_err());
        assert!(ServerMessage::decode(r#"{"type":"event","channel":"positions","data":null}"#).is_err());
    }

    #[test]
    fn client_request_wire_shape() {
        let req = ClientRequest::subscribe("positions");
        assert_eq!(req.to_json(), r#"{"action":"subscribe","channel":"positions"}"#);
        assert_eq!(ClientRequest::decode(&req.to_json()).unwrap(), req);
        assert!(ClientRequest::decode(r#"{"action":"publish","channel":"x"}"#).is_err());
    }

    #[test]
    fn replay_copy_keeps_meta() {
        let live = ServerMessage::event("positions", json!({"id": 1}), 3, "e");
        let replayed = live.as_replay();
        assert!(replayed.replay);
        assert!(!live.replay);
        assert_eq!(replayed.seq(), Some(3));
    }
}
