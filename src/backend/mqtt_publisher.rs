// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading publisher backed by an MQTT broker.
//!
//! Every reading is published with QoS 1 to `<topic>/<key>`, where `key` is
//! `device_<deviceId>`. The broker connection is driven by a background task
//! that keeps polling the event loop, so a dropped connection is re-established
//! on the next poll.
//!
//! MQTT acknowledgements carry no record identity the caller can see, so the
//! publish callback reports whether the client accepted the message. QoS 1
//! redelivery from that point on is left to the client. Use the Kafka
//! publisher when the callback must reflect the broker's verdict.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{PublishCallback, ReadingPublisher};
use crate::config::Properties;
use crate::error::{CollaboratorError, ConfigError};

/// Global counter for generating unique client IDs.
static PUBLISHER_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pause between two reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration of an [`MqttPublisher`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensim_lib::backend::MqttPublisherConfig;
///
/// let config = MqttPublisherConfig::new("broker.local")
///     .with_port(8883)
///     .with_topic("farm/readings")
///     .with_connection_timeout(Duration::from_secs(3));
/// assert_eq!(config.topic_for("device_13"), "farm/readings/device_13");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttPublisherConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    topic: String,
    keep_alive: Duration,
    connection_timeout: Duration,
}

impl MqttPublisherConfig {
    /// Default broker port.
    pub const DEFAULT_PORT: u16 = 1883;
    /// Default base topic for readings.
    pub const DEFAULT_TOPIC: &'static str = "sensor-data";
    /// Default keep-alive interval.
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// Default wait for the broker's CONNACK.
    pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a configuration for a broker host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            credentials: None,
            topic: Self::DEFAULT_TOPIC.to_string(),
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
            connection_timeout: Self::DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Creates a configuration from a broker URL (`mqtt://host:port`,
    /// `tcp://host:port`, or `host[:port]`).
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::InvalidAddress`] if the port is invalid.
    pub fn from_url(url: &str) -> Result<Self, CollaboratorError> {
        let (host, port) = parse_mqtt_url(url)?;
        Ok(Self::new(host).with_port(port))
    }

    /// Loads `mqtt.broker.url` and the optional `mqtt.topic.sensor.data`,
    /// `mqtt.username`, and `mqtt.password` keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is absent or invalid.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let url = props.require("mqtt.broker.url")?;
        let mut config = Self::from_url(url).map_err(|e| ConfigError::Invalid {
            key: "mqtt.broker.url".to_string(),
            message: e.to_string(),
        })?;
        if let Some(topic) = props.get("mqtt.topic.sensor.data") {
            config = config.with_topic(topic);
        }
        if let (Some(user), Some(pass)) = (props.get("mqtt.username"), props.get("mqtt.password"))
        {
            config = config.with_credentials(user, pass);
        }
        Ok(config)
    }

    /// Sets the broker port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the base topic readings are published under.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets the keep-alive interval.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets how long [`ping`](ReadingPublisher::ping) waits for the broker.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the base topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the full topic for a message key.
    #[must_use]
    pub fn topic_for(&self, key: &str) -> String {
        format!("{}/{key}", self.topic)
    }
}

/// Publishes readings to an MQTT broker.
///
/// # Examples
///
/// ```no_run
/// use sensim_lib::backend::{MqttPublisher, MqttPublisherConfig, ReadingPublisher};
///
/// # async fn example() -> Result<(), sensim_lib::CollaboratorError> {
/// let publisher = MqttPublisher::connect(MqttPublisherConfig::from_url("mqtt://127.0.0.1:1883")?)?;
/// publisher.ping().await?;
/// publisher.publish("device_13", r#"{"deviceId":"13"}"#, None).await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttPublisherConfig,
    connected: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl MqttPublisher {
    /// Creates the client and starts driving its connection.
    ///
    /// Returns immediately; use [`ping`](ReadingPublisher::ping) to wait for
    /// the broker to accept the connection. Must be called within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::InvalidAddress`] if no host is set.
    pub fn connect(config: MqttPublisherConfig) -> Result<Self, CollaboratorError> {
        if config.host.is_empty() {
            return Err(CollaboratorError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        let counter = PUBLISHER_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("sensim_{}_{}", std::process::id(), counter);

        let mut mqtt_options = MqttOptions::new(&client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);
        if let Some((ref username, ref password)) = config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        let (connected_tx, connected) = watch::channel(false);
        let shutdown = CancellationToken::new();

        tokio::spawn(drive_event_loop(event_loop, connected_tx, shutdown.clone()));

        Ok(Self {
            client,
            config,
            connected,
            shutdown,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MqttPublisherConfig {
        &self.config
    }

    /// Returns whether the broker connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

#[async_trait]
impl ReadingPublisher for MqttPublisher {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        if self.shutdown.is_cancelled() {
            return Err(CollaboratorError::Closed("publisher".to_string()));
        }
        let mut connected = self.connected.clone();
        let wait = async move { connected.wait_for(|up| *up).await.map(|_| ()) };
        match tokio::time::timeout(self.config.connection_timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CollaboratorError::ConnectionFailed(
                "MQTT event loop terminated unexpectedly".to_string(),
            )),
            Err(_) => Err(CollaboratorError::ConnectionFailed(format!(
                "MQTT connection timeout after {}s",
                self.config.connection_timeout.as_secs()
            ))),
        }
    }

    async fn publish(
        &self,
        key: &str,
        payload: &str,
        on_complete: Option<PublishCallback>,
    ) -> Result<(), CollaboratorError> {
        if self.shutdown.is_cancelled() {
            return Err(CollaboratorError::Closed("publisher".to_string()));
        }
        let topic = self.config.topic_for(key);
        let result = self
            .client
            .publish(&topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %topic, "Reading handed to MQTT client");
                if let Some(callback) = on_complete {
                    callback(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                if let Some(callback) = on_complete {
                    callback(Err(CollaboratorError::ConnectionFailed(e.to_string())));
                }
                Err(CollaboratorError::Mqtt(e))
            }
        }
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        tracing::info!(
            host = %self.config.host,
            port = %self.config.port,
            "Disconnecting from MQTT broker"
        );
        let result = self.client.disconnect().await;
        self.shutdown.cancel();
        result.map_err(CollaboratorError::Mqtt)
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn parse_mqtt_url(url: &str) -> Result<(String, u16), CollaboratorError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    match url.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| CollaboratorError::InvalidAddress(format!("Invalid port: {port}")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((url.to_string(), MqttPublisherConfig::DEFAULT_PORT)),
    }
}

/// Polls the event loop until shutdown, tracking connection state.
async fn drive_event_loop(
    mut event_loop: EventLoop,
    connected: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                connected.send_replace(true);
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                tracing::trace!(pkid = puback.pkid, "MQTT publish acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                connected.send_replace(false);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT publisher event loop error");
                connected.send_replace(false);
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    connected.send_replace(false);
}
