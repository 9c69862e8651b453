//! Application configuration, read from `~/.config/groundlink/config.toml`.
//!
//! Every section falls back to its defaults, so a partial file only overrides what it
//! names. Broker address and credentials can additionally be set through the
//! `MQTT_BROKER_URL`, `MQTT_USERNAME` and `MQTT_PASSWORD` environment variables.

use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bridge::BridgeSettings;
use crate::bus::{BusConfig, Credentials, ProtocolVersion, ReconnectPolicy};
use crate::controller::encoder::{CHASSIS_EVENT, MAX_PRECISION};
use crate::controller::layout::Layout;

const CONFIG_DIR: &str = ".config/groundlink";
const CONFIG_FILE: &str = "config.toml";

pub const ENV_BROKER_URL: &str = "MQTT_BROKER_URL";
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: String,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol_version: ProtocolVersion,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "mqtt://localhost:1883".to_string(),
            client_id_prefix: "ground-control-".to_string(),
            username: Some("user".to_string()),
            password: Some("user".to_string()),
            protocol_version: ProtocolVersion::V5,
            clean_session: true,
            keep_alive_secs: 5,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    pub interval_ms: u64,
    pub deadzone: f32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            deadzone: 0.05,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TopicConfig {
    pub event_type: String,
    pub command: String,
    /// Inbound topics logged by the shell
    pub telemetry: Vec<String>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            event_type: CHASSIS_EVENT.to_string(),
            command: "orion/topic/chassis/inbound".to_string(),
            telemetry: vec![
                "orion/topic/chassis/outbound".to_string(),
                "orion/topic/manipulator/outbound".to_string(),
            ],
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub sampler: SamplerConfig,
    pub layout: Layout,
    pub topics: TopicConfig,
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        if config.layout.precision > MAX_PRECISION {
            warn!(
                "Layout precision {} too high, using {}",
                config.layout.precision, MAX_PRECISION
            );
            config.layout.precision = MAX_PRECISION;
        }
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup(ENV_BROKER_URL).filter(|v| !v.is_empty()) {
            debug!("Broker address overridden by {}", ENV_BROKER_URL);
            self.broker.address = address;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.broker.password = Some(password);
        }
    }

    /// Session options for a fresh connection, with a client id unique to this call.
    pub fn to_bus_config(&self) -> BusConfig {
        let client_id = format!(
            "{}{}",
            self.broker.client_id_prefix,
            Local::now().timestamp_millis()
        );
        let credentials = match (&self.broker.username, &self.broker.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            (Some(username), None) => Some(Credentials {
                username: username.clone(),
                password: String::new(),
            }),
            _ => None,
        };

        let mut config = BusConfig::new(self.broker.address.clone(), client_id);
        config.credentials = credentials;
        config.protocol_version = self.broker.protocol_version;
        config.clean_session = self.broker.clean_session;
        config.keep_alive = Duration::from_secs(self.broker.keep_alive_secs.max(1));
        config.reconnect = self.broker.reconnect.clone();
        config
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            command_topic: self.topics.command.clone(),
            event_type: self.topics.event_type.clone(),
            layout: self.layout.clone(),
            sample_interval: Duration::from_millis(self.sampler.interval_ms),
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

pub fn default_config_path() -> PathBuf {
    let mut path = get_home_dir();
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

/// Write the default configuration to `path` unless a file already exists there.
pub async fn ensure_default_config(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
    {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write default config file: {}", e))?;

    info!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Load the configuration at `path` and apply environment overrides.
pub async fn load(path: &Path) -> Result<AppConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    let mut config = AppConfig::from_toml(&content)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    debug!("Loaded configuration from {}", path.display());
    Ok(config)
}
