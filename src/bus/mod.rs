//! # Message bus client
//!
//! One long-lived MQTT connection shared by the whole process.
//!
//! ```text
//! bus/
//! ├── config.rs     - Session options, broker address parsing, reconnect policy
//! ├── message.rs    - Inbound message representation and the JSON wire format
//! ├── transport.rs  - Connector/transport seams and the rumqttc session driver
//! └── client.rs     - Connection state machine and the subscription registry
//! ```
//!
//! Outgoing traffic is at-most-once and never queued: a publish while the link is down
//! is dropped with a warning. The session driver reconnects with bounded exponential
//! backoff and the client re-subscribes every registered topic on each acknowledgement.

pub mod client;
pub mod config;
pub mod message;
pub mod transport;

pub use client::{BusClient, BusStatus, ConnectionState, MessageHandler};
pub use config::{BusConfig, Credentials, ProtocolVersion, ReconnectPolicy};
pub use message::InboundMessage;
pub use transport::{BusEvent, BusTransport, Connector, MqttConnector, Session};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    #[error("Malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },
}
