use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::BusError;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// MQTT 3.1.1
    V4,
    #[default]
    V5,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Bounded exponential backoff applied by the session driver after a dropped connection.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the connection is declared errored
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

/// Everything needed to open one broker session.
#[derive(Clone, Debug, PartialEq)]
pub struct BusConfig {
    /// `mqtt://host:port`, `tcp://host:port`, `host:port` or `host`
    pub broker_address: String,
    /// Must be unique per session, the broker drops older sessions with the same id
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
}

impl BusConfig {
    pub fn new(broker_address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            client_id: client_id.into(),
            credentials: None,
            protocol_version: ProtocolVersion::default(),
            clean_session: true,
            keep_alive: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn host_and_port(&self) -> Result<(String, u16), BusError> {
        parse_broker_address(&self.broker_address)
    }
}

pub fn parse_broker_address(address: &str) -> Result<(String, u16), BusError> {
    let trimmed = address.trim();
    let without_scheme = match trimmed.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(BusError::InvalidConfig(format!(
                "unsupported broker scheme '{}'",
                scheme
            )))
        }
        None => trimmed,
    };
    let without_path = without_scheme.trim_end_matches('/');

    let (host, port) = match without_path.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|e| {
                BusError::InvalidConfig(format!("invalid broker port '{}': {}", port, e))
            })?;
            (host, port)
        }
        None => (without_path, DEFAULT_MQTT_PORT),
    };

    if host.is_empty() {
        return Err(BusError::InvalidConfig(format!(
            "broker address '{}' has no host",
            address
        )));
    }
    Ok((host.to_string(), port))
}
