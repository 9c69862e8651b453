//! Orchestration between the device sampler and the bus client.
//!
//! ```text
//! DeviceSampler ──[DeviceSnapshot]──► CommandPublisher ──[ControlCommand]──► BusClient
//! BusClient ──[InboundMessage]──► route(topic) channel ──► local listener
//! ```
//!
//! The bridge is the only component that connects or disconnects the bus client, and
//! its routes own every subscription on that client. A supervisor task follows the
//! connection state and logs transitions. Once the link is up it installs routes
//! requested or replaced in the meantime and drops subscriptions that were unrouted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusClient, BusConfig, BusError, ConnectionState, InboundMessage};
use crate::controller::encoder::{encode, CHASSIS_EVENT};
use crate::controller::layout::Layout;
use crate::controller::sampler::{DeviceSampler, SnapshotSink};
use crate::controller::snapshot::{DeviceEvent, DeviceSnapshot};
use crate::controller::source::DeviceSource;

const DEVICE_EVENT_BUFFER: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

#[derive(Clone, Debug)]
pub struct BridgeSettings {
    pub command_topic: String,
    pub event_type: String,
    pub layout: Layout,
    pub sample_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            command_topic: "orion/topic/chassis/inbound".to_string(),
            event_type: CHASSIS_EVENT.to_string(),
            layout: Layout::default(),
            sample_interval: Duration::from_millis(100),
        }
    }
}

/// Sampler sink that turns every snapshot into a published command.
struct CommandPublisher {
    client: BusClient,
    layout: Layout,
    topic: String,
    event_type: String,
    device_events: broadcast::Sender<DeviceEvent>,
    // Devices whose layout mismatch was already reported
    warned: HashSet<usize>,
}

impl SnapshotSink for CommandPublisher {
    fn on_snapshot(&mut self, snapshot: DeviceSnapshot) {
        let command = match encode(&snapshot, &self.layout, &self.event_type) {
            Ok(command) => command,
            Err(e) => {
                if self.warned.insert(snapshot.index) {
                    warn!(
                        "Skipping device {} ({}) until its layout fits: {}",
                        snapshot.index, snapshot.id, e
                    );
                } else {
                    debug!("Skipping device {}: {}", snapshot.index, e);
                }
                return;
            }
        };

        match self.client.publish(&self.topic, &command) {
            Ok(()) => debug!(
                "Published command for device {}: stick=({:.2},{:.2}) rotate={:.2}",
                snapshot.index, command.payload.stick[0], command.payload.stick[1], command.payload.rotate
            ),
            // counted and logged by the client
            Err(BusError::NotConnected) => {}
            Err(e) => warn!("Failed to publish command for device {}: {}", snapshot.index, e),
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        if !event.connecting {
            self.warned.remove(&event.index);
        }
        // Nobody listening is fine
        let _ = self.device_events.send(event);
    }
}

struct Route {
    listener: mpsc::Sender<InboundMessage>,
    // Whether the client currently holds a handler feeding `listener`
    installed: bool,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, HashMap<String, Route>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mark_installed(routes: &Routes, topic: &str, listener: &mpsc::Sender<InboundMessage>) {
    if let Some(route) = lock_routes(routes).get_mut(topic) {
        // Nur wenn die Route inzwischen nicht ersetzt wurde
        if route.listener.same_channel(listener) {
            route.installed = true;
        }
    }
}

fn install_route(
    client: &BusClient,
    topic: &str,
    listener: mpsc::Sender<InboundMessage>,
) -> Result<(), BusError> {
    client.subscribe(topic, move |message| match listener.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            warn!("Listener for {} is lagging, dropping message", message.topic)
        }
        Err(TrySendError::Closed(message)) => {
            debug!("Listener for {} has gone away", message.topic)
        }
    })
}

// Bring the client's subscriptions in line with the routes after the link came up.
// Handlers survive a dropped connection, so routes replaced or removed while the link
// was down are fixed up here.
fn reconcile_routes(client: &BusClient, routes: &Routes) {
    let subscribed = client.subscribed_topics();
    let (pending, stale) = {
        let routes = lock_routes(routes);
        let pending: Vec<(String, mpsc::Sender<InboundMessage>)> = routes
            .iter()
            .filter(|(_, route)| !route.installed)
            .map(|(topic, route)| (topic.clone(), route.listener.clone()))
            .collect();
        let stale: Vec<String> = subscribed
            .into_iter()
            .filter(|topic| !routes.contains_key(topic))
            .collect();
        (pending, stale)
    };

    for (topic, listener) in pending {
        match install_route(client, &topic, listener.clone()) {
            Ok(()) => mark_installed(routes, &topic, &listener),
            Err(e) => warn!("Could not route {}: {}", topic, e),
        }
    }
    for topic in stale {
        match client.unsubscribe(&topic) {
            Ok(()) => debug!("Dropped stale subscription {}", topic),
            Err(e) => warn!("Failed to drop stale subscription {}: {}", topic, e),
        }
    }
}

async fn supervise(client: BusClient, routes: Routes, cancel: CancellationToken) {
    let mut states = client.state_changes();
    loop {
        let state = states.borrow_and_update().clone();
        match state {
            ConnectionState::Connected => {
                reconcile_routes(&client, &routes);
                info!("Broker link up, control commands are flowing");
            }
            ConnectionState::Connecting => info!("Connecting to broker"),
            ConnectionState::Disconnected => {
                warn!("Broker link down, control commands are dropped until it recovers")
            }
            ConnectionState::Errored => {
                error!("Broker link failed permanently, reconnect required")
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Bridge supervisor stopped");
}

pub struct Bridge {
    client: BusClient,
    sampler: DeviceSampler,
    settings: BridgeSettings,
    routes: Routes,
    device_events: broadcast::Sender<DeviceEvent>,
    supervisor: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Bridge {
    pub fn new(client: BusClient, source: Box<dyn DeviceSource>, settings: BridgeSettings) -> Self {
        let (device_events, _) = broadcast::channel(DEVICE_EVENT_BUFFER);
        let publisher = CommandPublisher {
            client: client.clone(),
            layout: settings.layout.clone(),
            topic: settings.command_topic.clone(),
            event_type: settings.event_type.clone(),
            device_events: device_events.clone(),
            warned: HashSet::new(),
        };

        Self {
            client,
            sampler: DeviceSampler::new(source, Box::new(publisher)),
            settings,
            routes: Arc::new(Mutex::new(HashMap::new())),
            device_events,
            supervisor: None,
        }
    }

    /// Connect the bus and start sampling. Must be called from within a tokio runtime.
    pub fn start(&mut self, config: &BusConfig) -> Result<(), BridgeError> {
        info!(
            "Starting bridge: publishing '{}' commands to {}",
            self.settings.event_type, self.settings.command_topic
        );
        self.client.connect(config)?;

        if self.supervisor.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(supervise(
                self.client.clone(),
                Arc::clone(&self.routes),
                cancel.clone(),
            ));
            self.supervisor = Some((cancel, handle));
        }

        self.sampler.start(self.settings.sample_interval);
        Ok(())
    }

    /// Stop sampling, then drop the broker session.
    pub fn shutdown(&mut self) {
        self.sampler.stop();
        if let Some((cancel, handle)) = self.supervisor.take() {
            cancel.cancel();
            handle.abort();
        }
        self.client.disconnect();
        // disconnect() forgets every handler
        for route in lock_routes(&self.routes).values_mut() {
            route.installed = false;
        }
        info!("Bridge shut down");
    }

    /// Forward decoded messages on `topic` to the returned channel.
    ///
    /// Installed right away when connected, otherwise as soon as the link comes up.
    /// Routing the same topic again replaces the previous listener.
    pub fn route(&self, topic: &str, capacity: usize) -> mpsc::Receiver<InboundMessage> {
        let (listener, receiver) = mpsc::channel(capacity.max(1));
        lock_routes(&self.routes).insert(
            topic.to_string(),
            Route {
                listener: listener.clone(),
                installed: false,
            },
        );

        if self.client.state() == ConnectionState::Connected {
            match install_route(&self.client, topic, listener.clone()) {
                Ok(()) => mark_installed(&self.routes, topic, &listener),
                Err(e) => warn!("Could not route {} yet: {}", topic, e),
            }
        } else {
            debug!("Route for {} pending until the broker link is up", topic);
        }
        receiver
    }

    /// Stop forwarding `topic`. While the link is down the broker subscription is
    /// dropped once it comes back up.
    pub fn unroute(&self, topic: &str) {
        lock_routes(&self.routes).remove(topic);
        match self.client.unsubscribe(topic) {
            Ok(()) | Err(BusError::NotConnected) => {}
            Err(e) => warn!("Failed to unsubscribe from {}: {}", topic, e),
        }
    }

    pub fn device_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.device_events.subscribe()
    }

    pub fn is_any_device_connected(&self) -> bool {
        self.sampler.is_any_device_connected()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_running()
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some((cancel, handle)) = self.supervisor.take() {
            cancel.cancel();
            handle.abort();
        }
    }
}
