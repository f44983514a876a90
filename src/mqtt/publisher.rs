//! MQTT publisher built on rumqttc.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::BrokerAddr;
use crate::config::MqttConfig;
use crate::error::{GatehouseError, Result};

/// Capacity of the request channel between the client handle and event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 16;
/// First delay before reconnecting after a connection error.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Upper bound on the reconnect delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How long `disconnect` waits for the broker session to close.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Anything that can deliver a gate message to the broker.
///
/// HTTP handlers depend on this trait rather than on [`MqttPublisher`] so
/// they can run without a live broker.
#[async_trait]
pub trait GatePublisher: Send + Sync {
    /// Hand `payload` for `topic` to the delivery path.
    ///
    /// `Ok` means the message was accepted for delivery, not that the broker
    /// acknowledged it.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;
}

/// Convert a configured QoS level to the rumqttc enum.
pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(GatehouseError::InvalidConfiguration(format!(
            "mqtt.qos must be 0, 1 or 2, got {}",
            other
        ))),
    }
}

/// A long-lived MQTT client that reconnects on its own.
///
/// The rumqttc event loop runs on a background task for the lifetime of the
/// publisher and is aborted when the publisher is dropped.
pub struct MqttPublisher {
    client: AsyncClient,
    broker: BrokerAddr,
    qos: QoS,
    retain: bool,
    connect_timeout: Duration,
    connected: watch::Receiver<bool>,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Build the client and start its event loop.
    ///
    /// Must be called from within a tokio runtime. The connection is
    /// established in the background; use [`MqttPublisher::wait_connected`]
    /// to wait for it.
    pub fn start(config: &MqttConfig) -> Result<Self> {
        let broker = BrokerAddr::parse(&config.broker)?;
        let qos = qos_from_level(config.qos)?;

        let mut options = MqttOptions::new(config.client_id.clone(), broker.host.clone(), broker.port);
        options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .set_clean_session(true);
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        info!(broker = %broker, client_id = %config.client_id, "Starting MQTT client");
        let event_loop = tokio::spawn(drive_event_loop(event_loop, broker.clone(), connected_tx));

        Ok(Self {
            client,
            broker,
            qos,
            retain: config.retain,
            connect_timeout: config.connect_timeout(),
            connected: connected_rx,
            event_loop,
        })
    }

    /// Wait until the broker acknowledges a connection or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut connected = self.connected.clone();
        let waited = tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .map(|changed| changed.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(GatehouseError::Mqtt("MQTT event loop stopped".to_string())),
            Err(_) => Err(GatehouseError::Mqtt(format!(
                "failed to connect to MQTT broker {} within {:?}",
                self.broker, timeout
            ))),
        }
    }

    /// Configured wait for the initial connection.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Whether the broker session is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn broker(&self) -> &BrokerAddr {
        &self.broker
    }

    /// Close the broker session, if one is open.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to send MQTT disconnect");
            return;
        }

        let mut connected = self.connected.clone();
        let _ = tokio::time::timeout(DISCONNECT_GRACE, connected.wait_for(|up| !*up)).await;
        info!("MQTT client disconnected");
    }
}

/// Queues the message on the rumqttc request channel once a session is up.
/// The event loop sends it and handles QoS acknowledgements; a session lost
/// after queueing is reported by the event loop, not by this call.
#[async_trait]
impl GatePublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            self.wait_connected(self.connect_timeout)
                .await
                .map_err(|e| GatehouseError::Mqtt(format!("not connected to MQTT broker: {}", e)))?;
        }

        self.client
            .publish(topic, self.qos, self.retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| GatehouseError::Mqtt(format!("failed to queue message: {}", e)))
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// Poll the rumqttc event loop, tracking connection state and backing off
/// between reconnect attempts. Exits after an explicit disconnect.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    broker: BrokerAddr,
    connected: watch::Sender<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                backoff = INITIAL_BACKOFF;
                connected.send_replace(true);
                info!(broker = %broker, code = ?ack.code, "MQTT client connected");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.send_replace(false);
                debug!(broker = %broker, "MQTT event loop stopping after disconnect");
                break;
            }
            Ok(event) => {
                debug!(event = ?event, "MQTT event");
            }
            Err(e) => {
                if connected.send_replace(false) {
                    error!(broker = %broker, error = %e, "MQTT connection lost");
                } else {
                    warn!(
                        broker = %broker,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "MQTT connection attempt failed"
                    );
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
