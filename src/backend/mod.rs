// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! External collaborators of the simulator.
//!
//! The simulator talks to four systems, each behind an async trait so that
//! registries can hold them as `Arc<dyn ...>`:
//!
//! - [`DeviceCatalog`]: relational lookup of devices and type templates
//! - [`ControlQueue`]: per-topic list queue carrying control messages
//! - [`ReadingStore`]: wide-column store receiving every reading
//! - [`ReadingPublisher`]: message stream receiving every reading
//!
//! In-memory implementations live in [`memory`]. Network adapters are
//! compiled behind the `mysql`, `redis`, `http`, `kafka`, and `mqtt`
//! features.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::model::{DeviceId, DeviceInfo};

pub mod memory;

#[cfg(feature = "http")]
mod hbase_rest;
#[cfg(feature = "kafka")]
mod kafka_publisher;
#[cfg(feature = "mqtt")]
mod mqtt_publisher;
#[cfg(feature = "redis")]
mod redis_queue;
#[cfg(feature = "mysql")]
mod sql_catalog;

#[cfg(feature = "http")]
pub use hbase_rest::{HbaseCell, HbaseRestConfig, HbaseRestStore};
#[cfg(feature = "kafka")]
pub use kafka_publisher::{KafkaPublisher, KafkaPublisherConfig};
#[cfg(feature = "mqtt")]
pub use mqtt_publisher::{MqttPublisher, MqttPublisherConfig};
#[cfg(feature = "redis")]
pub use redis_queue::{RedisQueue, RedisQueueConfig};
#[cfg(feature = "mysql")]
pub use sql_catalog::{SqlCatalog, SqlCatalogConfig};

/// Completion callback of an asynchronous publish.
pub type PublishCallback = Box<dyn FnOnce(Result<(), CollaboratorError>) + Send + 'static>;

/// Relational lookup of devices and their type templates.
#[async_trait]
pub trait DeviceCatalog: Send + Sync + 'static {
    /// Checks that the lookup is reachable.
    async fn ping(&self) -> Result<(), CollaboratorError>;

    /// Returns the distinct, non-empty device type names.
    async fn device_types(&self) -> Result<Vec<String>, CollaboratorError>;

    /// Returns one device joined with its type, or `None` if it does not exist.
    async fn device_info(&self, device_id: &DeviceId)
    -> Result<Option<DeviceInfo>, CollaboratorError>;

    /// Returns every device whose persisted state is on.
    async fn active_devices(&self) -> Result<Vec<DeviceInfo>, CollaboratorError>;

    /// Releases the lookup's resources.
    async fn close(&self) -> Result<(), CollaboratorError>;
}

/// Per-topic list queue carrying control messages.
#[async_trait]
pub trait ControlQueue: Send + Sync + 'static {
    /// Checks that the queue is reachable.
    async fn ping(&self) -> Result<(), CollaboratorError>;

    /// Pops the oldest message of `topic`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    async fn blocking_pop(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CollaboratorError>;

    /// Releases the queue's resources.
    async fn close(&self) -> Result<(), CollaboratorError>;
}

/// Wide-column store receiving readings.
#[async_trait]
pub trait ReadingStore: Send + Sync + 'static {
    /// Checks that the store is reachable.
    async fn ping(&self) -> Result<(), CollaboratorError>;

    /// Writes one row. Fields map column qualifier to value.
    async fn put(
        &self,
        row_key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CollaboratorError>;

    /// Releases the store's resources.
    async fn close(&self) -> Result<(), CollaboratorError>;
}

/// Message stream receiving readings.
#[async_trait]
pub trait ReadingPublisher: Send + Sync + 'static {
    /// Checks that the stream is reachable.
    async fn ping(&self) -> Result<(), CollaboratorError>;

    /// Hands a message to the stream.
    ///
    /// Returns once the message is accepted for delivery. `on_complete`, if
    /// given, is invoked with the delivery outcome.
    async fn publish(
        &self,
        key: &str,
        payload: &str,
        on_complete: Option<PublishCallback>,
    ) -> Result<(), CollaboratorError>;

    /// Flushes and releases the stream's resources.
    async fn close(&self) -> Result<(), CollaboratorError>;
}

/// Names a collaborator in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollaboratorKind {
    /// The relational lookup.
    Lookup,
    /// The control queue.
    Queue,
    /// The reading store.
    Store,
    /// The reading publisher.
    Publisher,
}

impl CollaboratorKind {
    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Queue => "queue",
            Self::Store => "store",
            Self::Publisher => "publisher",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four collaborators handed to the supervisor.
#[derive(Clone)]
pub struct Collaborators {
    /// Device and template lookup.
    pub catalog: Arc<dyn DeviceCatalog>,
    /// Control message queue.
    pub queue: Arc<dyn ControlQueue>,
    /// Reading store.
    pub store: Arc<dyn ReadingStore>,
    /// Reading publisher.
    pub publisher: Arc<dyn ReadingPublisher>,
}

impl Collaborators {
    /// Bundles the four collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        queue: Arc<dyn ControlQueue>,
        store: Arc<dyn ReadingStore>,
        publisher: Arc<dyn ReadingPublisher>,
    ) -> Self {
        Self {
            catalog,
            queue,
            store,
            publisher,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_is_lowercase() {
        assert_eq!(CollaboratorKind::Lookup.to_string(), "lookup");
        assert_eq!(CollaboratorKind::Publisher.to_string(), "publisher");
    }
}
