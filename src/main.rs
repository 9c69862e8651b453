pub mod bridge;
pub mod bus;
pub mod config;
pub mod controller;

use crate::bridge::Bridge;
use crate::bus::{BusClient, InboundMessage, MqttConnector};
use crate::controller::GamepadSource;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const TELEMETRY_BUFFER: usize = 100;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    setup()?;

    // Konfiguration laden
    let config_path = config::default_config_path();
    config::ensure_default_config(&config_path).await?;
    let app_config = config::load(&config_path).await?;
    info!(
        "Using broker {} ({:?})",
        app_config.broker.address, app_config.broker.protocol_version
    );

    // Controller initialisieren
    let source = GamepadSource::create(app_config.sampler.deadzone)
        .map_err(|e| eyre!("Failed to open gamepad backend: {}", e))?
        .initialize();

    // MQTT-Client und Bridge aufbauen
    let client = BusClient::new(Arc::new(MqttConnector));
    let mut bridge = Bridge::new(client, Box::new(source), app_config.bridge_settings());

    for topic in &app_config.topics.telemetry {
        let receiver = bridge.route(topic, TELEMETRY_BUFFER);
        tokio::spawn(log_telemetry(receiver));
    }
    tokio::spawn(log_device_events(bridge.device_events()));

    bridge
        .start(&app_config.to_bus_config())
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    // Auf Ctrl-C warten
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown requested");

    let status = bridge.client().status();
    info!(
        "Session totals: {} sent, {} received, {} dropped, {} malformed",
        status.messages_sent,
        status.messages_received,
        status.dropped_publishes,
        status.malformed_messages
    );
    bridge.shutdown();

    Ok(())
}

async fn log_telemetry(mut receiver: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = receiver.recv().await {
        info!("Telemetry {}", message);
    }
    debug!("Telemetry route closed");
}

async fn log_device_events(mut events: broadcast::Receiver<controller::DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) if event.connecting => info!("Controller {} ready: {}", event.index, event.id),
            Ok(event) => warn!("Controller {} lost: {}", event.index, event.id),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} device events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
