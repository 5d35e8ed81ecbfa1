//! MQTT transport on top of `rumqttc`

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error, info};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};

use super::message;
use super::publisher::TelemetryPublisher;
use super::transport::{PublishError, Transport};
use crate::config::BrokerConfig;

/// Outgoing request slots between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 32;

/// Client handle used by the publisher. Sends never block: a full request
/// channel or a dropped link is reported as an error.
#[derive(Clone)]
pub struct MqttTransport {
    client: Client,
    connected: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Build the client handle and the session that owns the connection.
    pub fn new(client_id: &str, broker: &BrokerConfig) -> (Self, MqttSession) {
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options.set_keep_alive(broker.keepalive());
        if let (Some(user), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(user.clone(), password.clone());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let transport = Self {
            client,
            connected: connected.clone(),
        };
        let session = MqttSession {
            connection,
            connected,
            response_topic: message::response_topic(client_id),
            backoff: broker.reconnect_backoff(),
        };
        (transport, session)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Ask the event loop to send DISCONNECT.
    pub fn disconnect(&self) {
        if let Err(e) = self.client.disconnect() {
            debug!("[mqtt] disconnect request failed: {}", e);
        }
    }
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    fn subscribe(&self, topic: &str) -> Result<(), PublishError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

/// Owner of the connection event loop.
///
/// Reports link changes and broker messages to the publisher. After a
/// connection error it waits the backoff and lets the event loop reconnect,
/// forever, until stopped.
pub struct MqttSession {
    connection: Connection,
    connected: Arc<AtomicBool>,
    response_topic: String,
    backoff: Duration,
}

fn should_stop(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

impl MqttSession {
    pub fn run(mut self, publisher: Arc<TelemetryPublisher<MqttTransport>>, stop: Receiver<()>) {
        info!("[mqtt] session started");
        publisher.on_transport_connecting();

        for notification in self.connection.iter() {
            if should_stop(&stop) {
                break;
            }
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("[mqtt] connected ({:?})", ack.code);
                    self.connected.store(true, Ordering::SeqCst);
                    publisher.on_transport_connected();
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    if msg.topic == self.response_topic {
                        // Malformed messages are logged by the publisher.
                        let _ = publisher.on_external_ack(&msg.payload);
                    } else {
                        debug!("[mqtt] ignoring message on {}", msg.topic);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("[mqtt] disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[mqtt] connection error: {}", e);
                    self.connected.store(false, Ordering::SeqCst);
                    publisher.on_transport_disconnected();

                    // Sleep the backoff, waking early on shutdown.
                    match stop.recv_timeout(self.backoff) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    publisher.on_transport_connecting();
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        publisher.on_transport_disconnected();
        info!("[mqtt] session stopped");
    }

    pub fn spawn(
        self,
        publisher: Arc<TelemetryPublisher<MqttTransport>>,
        stop: Receiver<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("mqtt-session".into())
            .spawn(move || self.run(publisher, stop))
    }
}
