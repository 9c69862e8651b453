use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::BusConfig;
use super::message::{encode_payload, InboundMessage};
use super::transport::{BusEvent, BusTransport, Connector};
use super::BusError;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

#[derive(Clone, Debug, Default)]
pub struct BusStatus {
    pub connection_state: ConnectionState,
    pub messages_sent: usize,
    pub messages_received: usize,
    /// Publishes rejected because the link was not up
    pub dropped_publishes: usize,
    pub malformed_messages: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Callback for one subscribed topic. Runs on the dispatch task, keep it short.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

// Verhindert, dass "nicht verbunden"-Warnungen im Abtasttakt das Log fluten
#[derive(Debug)]
struct RateLimiter {
    min_interval: Duration,
    last_event_time: Option<Instant>,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_event_time: None,
        }
    }

    fn should_process(&mut self) -> bool {
        let now = Instant::now();
        match self.last_event_time {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_event_time = Some(now);
                true
            }
        }
    }
}

struct ActiveSession {
    transport: Box<dyn BusTransport>,
    cancel: CancellationToken,
}

struct ClientCore {
    session: Option<ActiveSession>,
    // Bumped for every new session and on disconnect; events from older ones are ignored
    generation: u64,
    handlers: HashMap<String, MessageHandler>,
    status: BusStatus,
    warn_limiter: RateLimiter,
}

impl ClientCore {
    fn connected_transport(&self) -> Option<&dyn BusTransport> {
        match (&self.status.connection_state, &self.session) {
            (ConnectionState::Connected, Some(session)) => Some(session.transport.as_ref()),
            _ => None,
        }
    }

    fn warn_not_connected(&mut self, action: &str, topic: &str) {
        if self.warn_limiter.should_process() {
            warn!(
                "MQTT client not connected ({:?}), cannot {} '{}'",
                self.status.connection_state, action, topic
            );
        } else {
            debug!("MQTT client not connected, cannot {} '{}'", action, topic);
        }
    }
}

struct Shared {
    core: Mutex<ClientCore>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, core: &mut ClientCore, state: ConnectionState) {
        if core.status.connection_state != state {
            info!(
                "Bus connection state: {:?} -> {:?}",
                core.status.connection_state, state
            );
            core.status.connection_state = state.clone();
            self.state_tx.send_replace(state);
        }
    }

    // Returns false once this session's events should no longer be processed
    fn handle_event(&self, generation: u64, event: BusEvent) -> bool {
        let mut core = self.lock();
        if core.generation != generation {
            debug!("Ignoring event from retired session {}", generation);
            return false;
        }

        match event {
            BusEvent::Connected => {
                self.set_state(&mut core, ConnectionState::Connected);
                core.status.last_error = None;
                if let Some(session) = &core.session {
                    for topic in core.handlers.keys() {
                        match session.transport.subscribe(topic) {
                            Ok(()) => debug!("Re-subscribed to {}", topic),
                            Err(e) => warn!("Failed to re-subscribe to {}: {}", topic, e),
                        }
                    }
                }
                true
            }
            BusEvent::ConnectionLost(reason) => {
                self.set_state(&mut core, ConnectionState::Disconnected);
                core.status.last_error = Some(reason);
                true
            }
            BusEvent::Fatal(reason) => {
                error!("Bus connection failed permanently: {}", reason);
                if let Some(session) = core.session.take() {
                    session.cancel.cancel();
                }
                self.set_state(&mut core, ConnectionState::Errored);
                core.status.last_error = Some(reason);
                false
            }
            BusEvent::Message { topic, payload } => {
                core.status.messages_received += 1;
                core.status.last_activity = Some(Local::now());

                let delivery = match InboundMessage::decode(&topic, &payload) {
                    Ok(message) => match core.handlers.get(&topic) {
                        Some(handler) => Some((Arc::clone(handler), message)),
                        None => {
                            debug!("No handler registered for {}", topic);
                            None
                        }
                    },
                    Err(e) => {
                        core.status.malformed_messages += 1;
                        warn!("Dropping inbound message: {}", e);
                        None
                    }
                };
                drop(core);

                // Handlers may call back into the client, so never run them under the lock
                if let Some((handler, message)) = delivery {
                    handler(message);
                }
                true
            }
        }
    }
}

async fn dispatch_events(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<BusEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            debug!("Session {} event stream closed", generation);
            break;
        };
        if !shared.handle_event(generation, event) {
            break;
        }
    }
}

/// Process-wide handle to the broker connection.
///
/// Cheap to clone; all clones share one connection, one state machine and one
/// subscription registry. Each topic has exactly one handler: subscribing again to the
/// same topic replaces the previous handler.
#[derive(Clone)]
pub struct BusClient {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl BusClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            shared: Arc::new(Shared {
                core: Mutex::new(ClientCore {
                    session: None,
                    generation: 0,
                    handlers: HashMap::new(),
                    status: BusStatus::default(),
                    warn_limiter: RateLimiter::new(Duration::from_secs(1)),
                }),
                state_tx,
            }),
        }
    }

    /// Open a session unless one is already connected or connecting.
    ///
    /// A session that is retrying or has failed is replaced by a fresh one; registered
    /// subscriptions carry over and are re-sent once the broker acknowledges.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, config: &BusConfig) -> Result<(), BusError> {
        let mut core = self.shared.lock();
        if core.session.is_some()
            && matches!(
                core.status.connection_state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            debug!("Bus client already {:?}", core.status.connection_state);
            return Ok(());
        }

        if let Some(old) = core.session.take() {
            info!("Replacing previous broker session");
            old.cancel.cancel();
        }
        core.generation += 1;
        let generation = core.generation;
        let cancel = CancellationToken::new();

        let session = match self.connector.open(config, cancel.clone()) {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to open broker session: {}", e);
                core.status.last_error = Some(e.to_string());
                self.shared.set_state(&mut core, ConnectionState::Errored);
                return Err(e);
            }
        };

        core.session = Some(ActiveSession {
            transport: session.transport,
            cancel: cancel.clone(),
        });
        self.shared.set_state(&mut core, ConnectionState::Connecting);
        drop(core);

        tokio::spawn(dispatch_events(
            Arc::clone(&self.shared),
            generation,
            session.events,
            cancel,
        ));
        Ok(())
    }

    /// Tear the session down. Safe to call in any state.
    pub fn disconnect(&self) {
        let mut core = self.shared.lock();
        core.generation += 1;
        core.handlers.clear();
        if let Some(session) = core.session.take() {
            if let Err(e) = session.transport.disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
            session.cancel.cancel();
            info!("Disconnected from broker");
        }
        self.shared.set_state(&mut core, ConnectionState::Disconnected);
    }

    /// Publish `payload` as JSON, QoS 0, not retained.
    ///
    /// When the link is not up this is a no-op. Every rejected call returns
    /// [`BusError::NotConnected`] and is counted in [`BusStatus::dropped_publishes`];
    /// the `warn!` line is limited to one per second, further rejections log at debug.
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<(), BusError> {
        let mut core = self.shared.lock();
        let Some(transport) = core.connected_transport() else {
            core.status.dropped_publishes += 1;
            core.warn_not_connected("publish to", topic);
            return Err(BusError::NotConnected);
        };

        let bytes = encode_payload(payload)?;
        let result = transport.publish(topic, bytes);
        match &result {
            Ok(()) => {
                core.status.messages_sent += 1;
                core.status.last_activity = Some(Local::now());
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                core.status.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Register `handler` for messages on exactly `topic`, replacing any previous one.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<(), BusError>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        let mut core = self.shared.lock();
        let Some(transport) = core.connected_transport() else {
            core.warn_not_connected("subscribe to", topic);
            return Err(BusError::NotConnected);
        };

        transport.subscribe(topic)?;
        if core
            .handlers
            .insert(topic.to_string(), Arc::new(handler))
            .is_some()
        {
            info!("Replaced handler for {}", topic);
        } else {
            info!("Subscribed to {}", topic);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        let mut core = self.shared.lock();
        let Some(transport) = core.connected_transport() else {
            core.warn_not_connected("unsubscribe from", topic);
            return Err(BusError::NotConnected);
        };

        transport.unsubscribe(topic)?;
        if core.handlers.remove(topic).is_some() {
            info!("Unsubscribed from {}", topic);
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().status.connection_state.clone()
    }

    pub fn status(&self) -> BusStatus {
        self.shared.lock().status.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.shared.lock().handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Observe connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::transport::Session;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) enum Call {
        Publish(String, Vec<u8>),
        Subscribe(String),
        Unsubscribe(String),
        Disconnect,
    }

    /// In-memory stand-in for a broker: records requests, lets tests inject events.
    #[derive(Default)]
    pub(crate) struct FakeBroker {
        pub calls: Mutex<Vec<Call>>,
        sessions: Mutex<Vec<mpsc::Sender<BusEvent>>>,
        pub refuse_open: std::sync::atomic::AtomicBool,
    }

    impl FakeBroker {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn publishes(&self) -> Vec<(String, serde_json::Value)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Publish(topic, bytes) => {
                        Some((topic, serde_json::from_slice(&bytes).unwrap()))
                    }
                    _ => None,
                })
                .collect()
        }

        pub fn sessions_opened(&self) -> usize {
            self.sessions.lock().unwrap().len()
        }

        // Deliver an event on the most recent session (or an older one by index)
        pub async fn emit_on(&self, session: usize, event: BusEvent) {
            let tx = self.sessions.lock().unwrap()[session].clone();
            let _ = tx.send(event).await;
        }

        pub async fn emit(&self, event: BusEvent) {
            let latest = self.sessions_opened() - 1;
            self.emit_on(latest, event).await;
        }
    }

    struct FakeTransport(Arc<FakeBroker>);

    impl BusTransport for FakeTransport {
        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            self.0
                .calls
                .lock()
                .unwrap()
                .push(Call::Publish(topic.to_string(), payload));
            Ok(())
        }

        fn subscribe(&self, topic: &str) -> Result<(), BusError> {
            self.0
                .calls
                .lock()
                .unwrap()
                .push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
            self.0
                .calls
                .lock()
                .unwrap()
                .push(Call::Unsubscribe(topic.to_string()));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), BusError> {
            self.0.calls.lock().unwrap().push(Call::Disconnect);
            Ok(())
        }
    }

    pub(crate) struct FakeConnector(pub Arc<FakeBroker>);

    impl Connector for FakeConnector {
        fn open(&self, _config: &BusConfig, _cancel: CancellationToken) -> Result<Session, BusError> {
            if self.0.refuse_open.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(BusError::InvalidConfig("refused by test".into()));
            }
            let (tx, rx) = mpsc::channel(16);
            self.0.sessions.lock().unwrap().push(tx);
            Ok(Session {
                transport: Box::new(FakeTransport(Arc::clone(&self.0))),
                events: rx,
            })
        }
    }

    pub(crate) fn test_config() -> BusConfig {
        BusConfig::new("mqtt://localhost:1883", "ground-control-test")
    }

    pub(crate) async fn wait_for_state(client: &BusClient, state: ConnectionState) {
        let mut rx = client.state_changes();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .map(|_| ())
            .expect("state channel closed");
    }

    pub(crate) async fn connected_client() -> (BusClient, Arc<FakeBroker>) {
        let broker = Arc::new(FakeBroker::default());
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));
        client.connect(&test_config()).unwrap();
        assert_eq!(client.state(), ConnectionState::Connecting);
        broker.emit(BusEvent::Connected).await;
        wait_for_state(&client, ConnectionState::Connected).await;
        (client, broker)
    }

    fn forwarding_handler() -> (
        impl Fn(InboundMessage) + Send + Sync + 'static,
        mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |message| {
                let _ = tx.send(message);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_a_counted_noop() {
        let broker = Arc::new(FakeBroker::default());
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));

        let result = client.publish("orion/topic/chassis/inbound", &json!({"x": 1}));

        assert_eq!(result, Err(BusError::NotConnected));
        assert!(broker.calls().is_empty());
        assert_eq!(client.status().dropped_publishes, 1);
        assert_eq!(client.status().messages_sent, 0);
    }

    #[tokio::test]
    async fn every_rejected_publish_is_reported() {
        let broker = Arc::new(FakeBroker::default());
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));

        for tick in 0..5 {
            assert_eq!(
                client.publish("orion/topic/chassis/inbound", &json!({"tick": tick})),
                Err(BusError::NotConnected)
            );
        }
        assert_eq!(client.status().dropped_publishes, 5);
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn publish_while_connecting_is_dropped() {
        let broker = Arc::new(FakeBroker::default());
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));
        client.connect(&test_config()).unwrap();

        assert_eq!(client.publish("t", &json!(1)), Err(BusError::NotConnected));
        assert!(broker.calls().is_empty());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (client, broker) = connected_client().await;
        client.connect(&test_config()).unwrap();
        client.connect(&test_config()).unwrap();
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn publish_sends_json_once() {
        let (client, broker) = connected_client().await;

        client
            .publish("orion/topic/chassis/inbound", &json!({"eventType": "chassis"}))
            .unwrap();

        assert_eq!(
            broker.publishes(),
            vec![(
                "orion/topic/chassis/inbound".to_string(),
                json!({"eventType": "chassis"})
            )]
        );
        assert_eq!(client.status().messages_sent, 1);
    }

    #[tokio::test]
    async fn dropped_connection_makes_publish_a_noop_until_reconnect() {
        let (client, broker) = connected_client().await;

        broker
            .emit(BusEvent::ConnectionLost("broker went away".into()))
            .await;
        wait_for_state(&client, ConnectionState::Disconnected).await;

        assert_eq!(client.publish("t", &json!(1)), Err(BusError::NotConnected));
        assert_eq!(client.publish("t", &json!(2)), Err(BusError::NotConnected));
        assert!(broker.publishes().is_empty());
        assert_eq!(
            client.status().last_error.as_deref(),
            Some("broker went away")
        );

        broker.emit(BusEvent::Connected).await;
        wait_for_state(&client, ConnectionState::Connected).await;
        client.publish("t", &json!(3)).unwrap();
        assert_eq!(broker.publishes(), vec![("t".to_string(), json!(3))]);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped_and_next_one_delivered() {
        let (client, broker) = connected_client().await;
        let (handler, mut received) = forwarding_handler();
        client.subscribe("telemetry", handler).unwrap();

        broker
            .emit(BusEvent::Message {
                topic: "telemetry".into(),
                payload: b"{oops".to_vec(),
            })
            .await;
        broker
            .emit(BusEvent::Message {
                topic: "telemetry".into(),
                payload: br#"{"battery": 87}"#.to_vec(),
            })
            .await;

        let message = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, json!({"battery": 87}));
        assert!(received.try_recv().is_err());

        let status = client.status();
        assert_eq!(status.malformed_messages, 1);
        assert_eq!(status.messages_received, 2);
    }

    #[tokio::test]
    async fn messages_only_reach_their_exact_topic() {
        let (client, broker) = connected_client().await;
        let (handler, mut received) = forwarding_handler();
        client.subscribe("orion/topic/chassis/outbound", handler).unwrap();

        broker
            .emit(BusEvent::Message {
                topic: "orion/topic/chassis/outbound/extra".into(),
                payload: b"1".to_vec(),
            })
            .await;
        broker
            .emit(BusEvent::Message {
                topic: "orion/topic/chassis/outbound".into(),
                payload: b"2".to_vec(),
            })
            .await;

        let message = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, json!(2));
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_handler() {
        let (client, broker) = connected_client().await;
        let (first, mut first_rx) = forwarding_handler();
        let (second, mut second_rx) = forwarding_handler();

        client.subscribe("status", first).unwrap();
        client.subscribe("status", second).unwrap();
        assert_eq!(client.subscribed_topics(), vec!["status".to_string()]);

        broker
            .emit(BusEvent::Message {
                topic: "status".into(),
                payload: br#""ok""#.to_vec(),
            })
            .await;

        let message = tokio::time::timeout(Duration::from_secs(1), second_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, json!("ok"));
        assert!(second_rx.try_recv().is_err());
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let broker = Arc::new(FakeBroker::default());
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));
        let (handler, _rx) = forwarding_handler();

        assert_eq!(
            client.subscribe("status", handler),
            Err(BusError::NotConnected)
        );
        assert_eq!(client.unsubscribe("status"), Err(BusError::NotConnected));
        assert!(broker.calls().is_empty());
        assert!(client.subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn reconnect_resubscribes_registered_topics() {
        let (client, broker) = connected_client().await;
        let (handler, _rx) = forwarding_handler();
        client.subscribe("a", handler).unwrap();

        broker.emit(BusEvent::ConnectionLost("io".into())).await;
        wait_for_state(&client, ConnectionState::Disconnected).await;
        broker.emit(BusEvent::Connected).await;
        wait_for_state(&client, ConnectionState::Connected).await;

        let subscribes = broker
            .calls()
            .into_iter()
            .filter(|call| *call == Call::Subscribe("a".into()))
            .count();
        assert_eq!(subscribes, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (client, broker) = connected_client().await;
        let (handler, mut received) = forwarding_handler();
        client.subscribe("a", handler).unwrap();
        client.unsubscribe("a").unwrap();
        let (watcher, mut watcher_rx) = forwarding_handler();
        client.subscribe("b", watcher).unwrap();

        broker
            .emit(BusEvent::Message {
                topic: "a".into(),
                payload: b"1".to_vec(),
            })
            .await;
        broker
            .emit(BusEvent::Message {
                topic: "b".into(),
                payload: b"2".to_vec(),
            })
            .await;

        // "b" is dispatched after "a", so once it arrives "a" has been handled
        tokio::time::timeout(Duration::from_secs(1), watcher_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.try_recv().is_err());
        assert!(broker.calls().contains(&Call::Unsubscribe("a".into())));
    }

    #[tokio::test]
    async fn fatal_error_then_manual_reconnect_uses_new_session() {
        let (client, broker) = connected_client().await;

        broker.emit(BusEvent::Fatal("retries exhausted".into())).await;
        wait_for_state(&client, ConnectionState::Errored).await;
        assert_eq!(client.publish("t", &json!(1)), Err(BusError::NotConnected));

        client.connect(&test_config()).unwrap();
        assert_eq!(broker.sessions_opened(), 2);
        assert_eq!(client.state(), ConnectionState::Connecting);

        broker.emit(BusEvent::Connected).await;
        wait_for_state(&client, ConnectionState::Connected).await;
        client.publish("t", &json!(2)).unwrap();
    }

    #[tokio::test]
    async fn events_from_a_replaced_session_are_ignored() {
        let (client, broker) = connected_client().await;
        broker.emit(BusEvent::ConnectionLost("io".into())).await;
        wait_for_state(&client, ConnectionState::Disconnected).await;

        // caller gives up on the retrying session and opens a new one
        client.connect(&test_config()).unwrap();
        assert_eq!(broker.sessions_opened(), 2);

        broker.emit_on(0, BusEvent::Connected).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn disconnect_tears_down_and_forgets_subscriptions() {
        let (client, broker) = connected_client().await;
        let (handler, _rx) = forwarding_handler();
        client.subscribe("a", handler).unwrap();

        client.disconnect();
        client.disconnect();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.subscribed_topics().is_empty());
        assert_eq!(
            broker
                .calls()
                .iter()
                .filter(|call| **call == Call::Disconnect)
                .count(),
            1
        );
        assert_eq!(client.publish("t", &json!(1)), Err(BusError::NotConnected));
    }

    #[tokio::test]
    async fn failed_open_marks_client_errored() {
        let broker = Arc::new(FakeBroker::default());
        broker
            .refuse_open
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let client = BusClient::new(Arc::new(FakeConnector(Arc::clone(&broker))));

        assert!(client.connect(&test_config()).is_err());
        assert_eq!(client.state(), ConnectionState::Errored);
        assert!(client.status().last_error.is_some());
    }

    #[test]
    fn rate_limiter_suppresses_bursts() {
        let mut limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.should_process());
        assert!(!limiter.should_process());
    }
}
