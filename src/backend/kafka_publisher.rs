// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading publisher backed by a Kafka topic.
//!
//! Every reading is produced to one topic with the record key
//! `device_<deviceId>`, so all readings of a device land on the same
//! partition. The producer waits for all in-sync replicas and is
//! idempotent. Delivery reports are awaited on a spawned task that invokes
//! the publish callback with the broker's verdict.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use super::{PublishCallback, ReadingPublisher};
use crate::config::Properties;
use crate::error::{CollaboratorError, ConfigError};

static PRODUCER_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration of a [`KafkaPublisher`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensim_lib::backend::KafkaPublisherConfig;
///
/// let config = KafkaPublisherConfig::new("kafka-1:9092,kafka-2:9092")
///     .with_topic("iot-sensor-data")
///     .with_linger(Duration::from_millis(5));
/// assert_eq!(config.topic(), "iot-sensor-data");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaPublisherConfig {
    bootstrap_servers: String,
    topic: String,
    retries: u32,
    batch_size_bytes: u32,
    linger: Duration,
    buffer_memory_bytes: u64,
    message_timeout: Duration,
    connection_timeout: Duration,
}

impl KafkaPublisherConfig {
    /// Default topic for readings.
    pub const DEFAULT_TOPIC: &'static str = "sensor-data";
    /// Default number of send retries.
    pub const DEFAULT_RETRIES: u32 = 3;
    /// Default batch size in bytes.
    pub const DEFAULT_BATCH_SIZE: u32 = 16_384;
    /// Default wait for a batch to fill.
    pub const DEFAULT_LINGER: Duration = Duration::from_millis(1);
    /// Default producer buffer in bytes.
    pub const DEFAULT_BUFFER_MEMORY: u64 = 33_554_432;
    /// Default delivery deadline of a record.
    pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default wait for broker metadata and the final flush.
    pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a configuration for a comma-separated broker list.
    #[must_use]
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topic: Self::DEFAULT_TOPIC.to_string(),
            retries: Self::DEFAULT_RETRIES,
            batch_size_bytes: Self::DEFAULT_BATCH_SIZE,
            linger: Self::DEFAULT_LINGER,
            buffer_memory_bytes: Self::DEFAULT_BUFFER_MEMORY,
            message_timeout: Self::DEFAULT_MESSAGE_TIMEOUT,
            connection_timeout: Self::DEFAULT_CONNECTION_TIMEOUT,
        }
    }

    /// Loads `kafka.bootstrap.servers`, `kafka.topic.sensor.data`, and the
    /// optional `kafka.producer.retries`, `kafka.producer.batch.size`,
    /// `kafka.producer.linger.ms`, and `kafka.producer.buffer.memory` keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the broker list is absent or a numeric key
    /// does not parse.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let mut config = Self::new(props.require("kafka.bootstrap.servers")?);
        if let Some(topic) = props.get("kafka.topic.sensor.data") {
            config.topic = topic.to_string();
        }
        if let Some(retries) = props.parsed::<u32>("kafka.producer.retries")? {
            config.retries = retries;
        }
        if let Some(size) = props.parsed::<u32>("kafka.producer.batch.size")? {
            config.batch_size_bytes = size;
        }
        if let Some(linger) = props.parsed::<u64>("kafka.producer.linger.ms")? {
            config.linger = Duration::from_millis(linger);
        }
        if let Some(memory) = props.parsed::<u64>("kafka.producer.buffer.memory")? {
            config.buffer_memory_bytes = memory;
        }
        Ok(config)
    }

    /// Sets the topic readings are produced to.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Sets how long a batch may wait to fill.
    #[must_use]
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Sets how long a record may wait for delivery before it fails.
    #[must_use]
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Sets how long [`ping`](ReadingPublisher::ping) and
    /// [`close`](ReadingPublisher::close) wait for the brokers.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Returns the broker list.
    #[must_use]
    pub fn bootstrap_servers(&self) -> &str {
        &self.bootstrap_servers
    }

    /// Returns the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn client_config(&self) -> ClientConfig {
        let counter = PRODUCER_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("sensim_{}_{}", std::process::id(), counter);

        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", self.bootstrap_servers.as_str());
        cfg.set("client.id", client_id.as_str());
        cfg.set("acks", "all");
        cfg.set("enable.idempotence", "true");
        cfg.set("retries", self.retries.to_string());
        cfg.set("batch.size", self.batch_size_bytes.to_string());
        cfg.set("linger.ms", self.linger.as_millis().to_string());
        cfg.set(
            "queue.buffering.max.kbytes",
            (self.buffer_memory_bytes / 1024).max(1).to_string(),
        );
        cfg.set("message.timeout.ms", self.message_timeout.as_millis().to_string());
        cfg
    }
}

/// Produces readings to a Kafka topic.
///
/// # Examples
///
/// ```no_run
/// use sensim_lib::backend::{KafkaPublisher, KafkaPublisherConfig, ReadingPublisher};
///
/// # async fn example() -> Result<(), sensim_lib::CollaboratorError> {
/// let publisher = KafkaPublisher::new(KafkaPublisherConfig::new("127.0.0.1:9092"))?;
/// publisher.ping().await?;
/// publisher
///     .publish(
///         "device_13",
///         r#"{"deviceId":"13"}"#,
///         Some(Box::new(|result: Result<(), sensim_lib::CollaboratorError>| {
///             if let Err(e) = result {
///                 eprintln!("delivery failed: {e}");
///             }
///         })),
///     )
///     .await?;
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct KafkaPublisher {
    producer: FutureProducer,
    config: KafkaPublisherConfig,
    closed: AtomicBool,
}

impl KafkaPublisher {
    /// Creates the producer. Brokers are contacted lazily.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::InvalidAddress`] if no broker is set and
    /// [`CollaboratorError::Kafka`] if the client cannot be created.
    pub fn new(config: KafkaPublisherConfig) -> Result<Self, CollaboratorError> {
        if config.bootstrap_servers.trim().is_empty() {
            return Err(CollaboratorError::InvalidAddress(
                "Kafka bootstrap servers are required".to_string(),
            ));
        }
        let producer: FutureProducer = config.client_config().create()?;
        tracing::info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topic,
            "Kafka producer initialized"
        );
        Ok(Self {
            producer,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &KafkaPublisherConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), CollaboratorError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CollaboratorError::Closed("publisher".to_string()))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for KafkaPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaPublisher")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadingPublisher for KafkaPublisher {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.ensure_open()?;
        let producer = self.producer.clone();
        let topic = self.config.topic.clone();
        let timeout = self.config.connection_timeout;

        // Metadata requests block the calling thread
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(topic.as_str()), Timeout::After(timeout))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| CollaboratorError::ConnectionFailed(e.to_string()))?;

        match metadata {
            Ok(brokers) => {
                tracing::debug!(brokers, "Kafka connection test successful");
                Ok(())
            }
            Err(e) => Err(CollaboratorError::ConnectionFailed(format!(
                "Kafka metadata request failed: {e}"
            ))),
        }
    }

    async fn publish(
        &self,
        key: &str,
        payload: &str,
        on_complete: Option<PublishCallback>,
    ) -> Result<(), CollaboratorError> {
        self.ensure_open()?;
        let record = FutureRecord::to(&self.config.topic).key(key).payload(payload);

        match self.producer.send_result(record) {
            Ok(delivery) => {
                let key = key.to_string();
                tokio::spawn(async move {
                    let outcome = match delivery.await {
                        Ok(Ok(delivery)) => {
                            tracing::debug!(key = %key, ?delivery, "Kafka delivery ok");
                            Ok(())
                        }
                        Ok(Err((e, _message))) => {
                            tracing::error!(key = %key, error = %e, "Kafka delivery failed");
                            Err(CollaboratorError::Kafka(e))
                        }
                        Err(_) => {
                            tracing::warn!(key = %key, "Kafka delivery report dropped");
                            Err(CollaboratorError::Closed("publisher".to_string()))
                        }
                    };
                    if let Some(callback) = on_complete {
                        callback(outcome);
                    }
                });
                Ok(())
            }
            Err((e, _record)) => {
                tracing::error!(key, error = %e, "Kafka send rejected");
                if let Some(callback) = on_complete {
                    callback(Err(CollaboratorError::ConnectionFailed(e.to_string())));
                }
                Err(CollaboratorError::Kafka(e))
            }
        }
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(topic = %self.config.topic, "Flushing Kafka producer");
        let producer = self.producer.clone();
        let timeout = self.config.connection_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| CollaboratorError::ConnectionFailed(e.to_string()))??;
        Ok(())
    }
}
