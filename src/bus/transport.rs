//! Broker session plumbing.
//!
//! A [`Connector`] opens one session: a non-blocking [`BusTransport`] for outgoing
//! requests plus a stream of [`BusEvent`]s fed by a driver task. [`MqttConnector`] is the
//! rumqttc-backed implementation for MQTT 3.1.1 and 5.

use rumqttc::v5;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BusConfig, ProtocolVersion, ReconnectPolicy};
use super::BusError;

const EVENT_BUFFER: usize = 256;
const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Session-level events reported by a driver.
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    /// Broker acknowledged the connection (first time or after a reconnect)
    Connected,
    Message { topic: String, payload: Vec<u8> },
    /// Network failure, the driver will retry
    ConnectionLost(String),
    /// Broker refused the connection or retries ran out, the driver has stopped
    Fatal(String),
}

/// Outgoing half of a session. Every call is non-blocking and at-most-once.
pub trait BusTransport: Send {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
    fn disconnect(&self) -> Result<(), BusError>;
}

pub struct Session {
    pub transport: Box<dyn BusTransport>,
    pub events: mpsc::Receiver<BusEvent>,
}

/// Opens broker sessions. The driver behind a session must stop once `cancel` fires.
pub trait Connector: Send + Sync {
    fn open(&self, config: &BusConfig, cancel: CancellationToken) -> Result<Session, BusError>;
}

fn transport_error(e: impl std::fmt::Display) -> BusError {
    BusError::Transport(e.to_string())
}

impl BusTransport for rumqttc::AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.try_publish(topic, rumqttc::QoS::AtMostOnce, false, payload)
            .map_err(transport_error)
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.try_subscribe(topic, rumqttc::QoS::AtMostOnce)
            .map_err(transport_error)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.try_unsubscribe(topic).map_err(transport_error)
    }

    fn disconnect(&self) -> Result<(), BusError> {
        self.try_disconnect().map_err(transport_error)
    }
}

impl BusTransport for v5::AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.try_publish(topic, v5::mqttbytes::QoS::AtMostOnce, false, payload)
            .map_err(transport_error)
    }

    fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.try_subscribe(topic, v5::mqttbytes::QoS::AtMostOnce)
            .map_err(transport_error)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        self.try_unsubscribe(topic).map_err(transport_error)
    }

    fn disconnect(&self) -> Result<(), BusError> {
        self.try_disconnect().map_err(transport_error)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    fn open(&self, config: &BusConfig, cancel: CancellationToken) -> Result<Session, BusError> {
        let (host, port) = config.host_and_port()?;
        let keep_alive = config.keep_alive.max(Duration::from_secs(1));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let driver = SessionDriver {
            events: event_tx,
            cancel,
            policy: config.reconnect.clone(),
            attempt: 0,
        };

        info!(
            "Opening MQTT {:?} session to {}:{} as '{}'",
            config.protocol_version, host, port, config.client_id
        );

        let transport: Box<dyn BusTransport> = match config.protocol_version {
            ProtocolVersion::V4 => {
                let mut options = rumqttc::MqttOptions::new(config.client_id.clone(), host, port);
                options
                    .set_keep_alive(keep_alive)
                    .set_clean_session(config.clean_session);
                if let Some(credentials) = &config.credentials {
                    options.set_credentials(
                        credentials.username.clone(),
                        credentials.password.clone(),
                    );
                }
                let (client, eventloop) = rumqttc::AsyncClient::new(options, REQUEST_CAPACITY);
                tokio::spawn(driver.run_v4(eventloop));
                Box::new(client)
            }
            ProtocolVersion::V5 => {
                let mut options = v5::MqttOptions::new(config.client_id.clone(), host, port);
                options
                    .set_keep_alive(keep_alive)
                    .set_clean_start(config.clean_session);
                if let Some(credentials) = &config.credentials {
                    options.set_credentials(
                        credentials.username.clone(),
                        credentials.password.clone(),
                    );
                }
                let (client, eventloop) = v5::AsyncClient::new(options, REQUEST_CAPACITY);
                tokio::spawn(driver.run_v5(eventloop));
                Box::new(client)
            }
        };

        Ok(Session {
            transport,
            events: event_rx,
        })
    }
}

// What the driver loop should do after handling one poll result
enum Flow {
    Continue,
    Stop,
}

/// Polls one rumqttc event loop and translates its output into [`BusEvent`]s.
struct SessionDriver {
    events: mpsc::Sender<BusEvent>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
    attempt: u32,
}

impl SessionDriver {
    async fn forward(&self, event: BusEvent) -> Flow {
        match self.events.send(event).await {
            Ok(()) => Flow::Continue,
            Err(_) => {
                debug!("Bus client dropped the session, stopping driver");
                Flow::Stop
            }
        }
    }

    async fn on_connack(&mut self) -> Flow {
        if self.attempt > 0 {
            info!("Reconnected to broker after {} attempts", self.attempt);
        }
        self.attempt = 0;
        self.forward(BusEvent::Connected).await
    }

    async fn on_refused(&self, reason: String) -> Flow {
        error!("Broker refused the connection: {}", reason);
        self.forward(BusEvent::Fatal(format!("connection refused: {}", reason)))
            .await;
        Flow::Stop
    }

    // Fehler melden, dann warten, bevor die Eventloop beim nächsten Poll neu verbindet
    async fn on_failure(&mut self, reason: String) -> Flow {
        self.attempt += 1;
        if self.policy.exhausted(self.attempt) {
            error!(
                "Giving up on broker after {} failed attempts: {}",
                self.policy.max_retries, reason
            );
            self.forward(BusEvent::Fatal(format!(
                "retries exhausted after {} attempts: {}",
                self.policy.max_retries, reason
            )))
            .await;
            return Flow::Stop;
        }

        let delay = self.policy.delay_for(self.attempt);
        warn!(
            "Broker connection lost ({}), retry {}/{} in {} ms",
            reason,
            self.attempt,
            self.policy.max_retries,
            delay.as_millis()
        );
        if let Flow::Stop = self.forward(BusEvent::ConnectionLost(reason)).await {
            return Flow::Stop;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Flow::Stop,
            _ = tokio::time::sleep(delay) => Flow::Continue,
        }
    }

    async fn run_v4(mut self, mut eventloop: rumqttc::EventLoop) {
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Give a queued DISCONNECT the chance to reach the broker
                    let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
                        loop {
                            match eventloop.poll().await {
                                Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    })
                    .await;
                    break;
                }
                polled = eventloop.poll() => polled,
            };

            let flow = match polled {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                    self.on_connack().await
                }
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    self.forward(BusEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    })
                    .await
                }
                Ok(_) => Flow::Continue,
                Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                    self.on_refused(format!("{:?}", code)).await
                }
                Err(e) => self.on_failure(e.to_string()).await,
            };

            if let Flow::Stop = flow {
                break;
            }
        }
        debug!("MQTT v4 session driver stopped");
    }

    async fn run_v5(mut self, mut eventloop: v5::EventLoop) {
        loop {
            let polled = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
                        loop {
                            match eventloop.poll().await {
                                Ok(v5::Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                                Ok(_) => {}
                            }
                        }
                    })
                    .await;
                    break;
                }
                polled = eventloop.poll() => polled,
            };

            let flow = match polled {
                Ok(v5::Event::Incoming(v5::mqttbytes::v5::Packet::ConnAck(_))) => {
                    self.on_connack().await
                }
                Ok(v5::Event::Incoming(v5::mqttbytes::v5::Packet::Publish(publish))) => {
                    self.forward(BusEvent::Message {
                        topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                        payload: publish.payload.to_vec(),
                    })
                    .await
                }
                Ok(_) => Flow::Continue,
                Err(v5::ConnectionError::ConnectionRefused(code)) => {
                    self.on_refused(format!("{:?}", code)).await
                }
                Err(e) => self.on_failure(e.to_string()).await,
            };

            if let Flow::Stop = flow {
                break;
            }
        }
        debug!("MQTT v5 session driver stopped");
    }
}
