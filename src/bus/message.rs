use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

use super::BusError;

/// A decoded message received on a subscribed topic.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.payload.to_string();
        let preview: String = content.chars().take(80).collect();
        let ellipsis = if content.chars().count() > 80 { "..." } else { "" };
        write!(
            f,
            "{} {}: {}{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview,
            ellipsis
        )
    }
}

impl InboundMessage {
    /// Decode a raw wire payload received on `topic`.
    pub fn decode(topic: &str, raw: &[u8]) -> Result<Self, BusError> {
        let payload = serde_json::from_slice(raw).map_err(|e| BusError::MalformedPayload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            topic: topic.to_string(),
            payload,
            received_at: Local::now(),
        })
    }
}

/// Serialize an outbound payload to the wire format (JSON text).
pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(payload).map_err(|e| BusError::Serialization(e.to_string()))
}
