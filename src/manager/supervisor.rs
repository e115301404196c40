// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level composition of the registries and collaborators.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

use crate::backend::{CollaboratorKind, Collaborators};
use crate::config::SimulatorConfig;
use crate::error::{CollaboratorError, Error, Result};
use crate::event::{EventBus, SimulatorEvent};

use super::consumer_registry::{ConsumerRegistry, ControlHandler, ReconcileReport};
use super::producer_registry::ProducerRegistry;

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStatus {
    /// Whether [`Supervisor::start`] has completed and shutdown has not begun.
    pub started: bool,
    /// Every consumed topic with its running flag.
    pub consumers: BTreeMap<String, bool>,
    /// Number of running consumer workers.
    pub active_consumers: usize,
    /// Number of registered producer tasks.
    pub active_producers: usize,
}

struct Running {
    producers: Arc<ProducerRegistry>,
    consumers: Arc<ConsumerRegistry>,
}

/// Owns the producer and consumer registries and their collaborators.
///
/// # Lifecycle
///
/// 1. [`start`](Self::start) checks all four collaborators, seeds one
///    producer per active device, then one consumer per known device type.
/// 2. [`refresh`](Self::refresh) re-reads the device types and reconciles
///    the consumers against them.
/// 3. [`shutdown`](Self::shutdown) stops consumers, then producers, then
///    closes the lookup, queue, store, and publisher in that order.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use sensim_lib::backend::Collaborators;
/// use sensim_lib::backend::memory::{MemoryCatalog, MemoryPublisher, MemoryQueue, MemoryStore};
/// use sensim_lib::{SimulatorConfig, Supervisor};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> sensim_lib::Result<()> {
/// let catalog = MemoryCatalog::new()
///     .with_template("temperature", Some(r#"{"temperature":{"range":"-10~40"}}"#))
///     .with_device("13", "probe", "temperature", true);
///
/// let supervisor = Supervisor::new(
///     SimulatorConfig::default(),
///     Collaborators::new(
///         Arc::new(catalog),
///         Arc::new(MemoryQueue::new()),
///         Arc::new(MemoryStore::new()),
///         Arc::new(MemoryPublisher::new()),
///     ),
/// );
///
/// supervisor.start().await?;
/// let status = supervisor.status().await;
/// assert_eq!(status.active_producers, 1);
/// assert!(status.consumers.contains_key("temperature"));
///
/// supervisor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Supervisor {
    config: SimulatorConfig,
    collaborators: Collaborators,
    events: EventBus,
    root: CancellationToken,
    running: Mutex<Option<Running>>,
    shut_down: AtomicBool,
}

impl Supervisor {
    /// Creates a supervisor. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: SimulatorConfig, collaborators: Collaborators) -> Self {
        let events = EventBus::with_capacity(config.event_capacity());
        Self {
            config,
            collaborators,
            events,
            root: CancellationToken::new(),
            running: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SimulatorEvent> {
        self.events.subscribe()
    }

    /// Returns the event bus shared by both registries.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Checks connectivity and starts producers and consumers.
    ///
    /// A failed active-device query is logged and startup continues without
    /// seeded producers.
    ///
    /// # Errors
    ///
    /// - [`Error::Connectivity`] if a collaborator fails its check.
    /// - [`Error::Collaborator`] if the device type query fails.
    /// - [`Error::AlreadyStarted`] or [`Error::ShuttingDown`].
    ///
    /// Nothing is started when an error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        tracing::info!("Starting sensor simulator");
        self.check_connections().await?;

        let devices = match self.bounded(self.collaborators.catalog.active_devices()).await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "Failed to query active devices");
                Vec::new()
            }
        };
        let types = self
            .bounded(self.collaborators.catalog.device_types())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Failed to query device types"))?;

        let producers = Arc::new(ProducerRegistry::new(
            &self.config,
            Arc::clone(&self.collaborators.catalog),
            Arc::clone(&self.collaborators.store),
            Arc::clone(&self.collaborators.publisher),
            self.events.clone(),
            self.root.child_token(),
        ));
        let consumers = Arc::new(ConsumerRegistry::new(
            &self.config,
            Arc::clone(&self.collaborators.queue),
            Arc::clone(&producers) as Arc<dyn ControlHandler>,
            self.events.clone(),
            self.root.child_token(),
        ));

        producers.seed_from_active_devices(devices);

        if types.is_empty() {
            tracing::warn!("No device types found");
        } else {
            tracing::info!(types = ?types, "Found device types");
        }
        consumers.start_all(&types);

        *running = Some(Running {
            producers,
            consumers,
        });
        tracing::info!("Sensor simulator started");
        Ok(())
    }

    /// Re-reads the device types and reconciles the consumers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before [`start`](Self::start),
    /// [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown), and
    /// [`Error::Collaborator`] if the type query fails. A failed query
    /// changes nothing.
    pub async fn refresh(&self) -> Result<ReconcileReport> {
        let running = self.running.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let Some(running) = running.as_ref() else {
            return Err(Error::NotStarted);
        };

        let types = self.bounded(self.collaborators.catalog.device_types()).await?;
        Ok(running.consumers.reconcile(&types))
    }

    /// Stops every worker and task, then closes the collaborators.
    ///
    /// Close failures are logged. Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down sensor simulator");

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.consumers.shutdown_all().await;
            running.producers.shutdown_all().await;
        }
        self.root.cancel();

        let closes = [
            (CollaboratorKind::Lookup, self.collaborators.catalog.close().await),
            (CollaboratorKind::Queue, self.collaborators.queue.close().await),
            (CollaboratorKind::Store, self.collaborators.store.close().await),
            (CollaboratorKind::Publisher, self.collaborators.publisher.close().await),
        ];
        for (collaborator, result) in closes {
            if let Err(e) = result {
                tracing::error!(%collaborator, error = %e, "Failed to close collaborator");
            }
        }
        tracing::info!("Sensor simulator shut down");
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Returns a snapshot of consumers and producers.
    pub async fn status(&self) -> SupervisorStatus {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(running) => SupervisorStatus {
                started: true,
                consumers: running.consumers.status_snapshot(),
                active_consumers: running.consumers.active_count(),
                active_producers: running.producers.active_count(),
            },
            None => SupervisorStatus::default(),
        }
    }

    /// Returns the producer registry once started.
    pub async fn producers(&self) -> Option<Arc<ProducerRegistry>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.producers))
    }

    /// Returns the consumer registry once started.
    pub async fn consumers(&self) -> Option<Arc<ConsumerRegistry>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.consumers))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn check_connections(&self) -> Result<()> {
        let c = &self.collaborators;
        self.check(CollaboratorKind::Lookup, c.catalog.ping()).await?;
        self.check(CollaboratorKind::Queue, c.queue.ping()).await?;
        self.check(CollaboratorKind::Store, c.store.ping()).await?;
        self.check(CollaboratorKind::Publisher, c.publisher.ping()).await?;
        tracing::info!("All connections verified");
        Ok(())
    }

    async fn check<F>(&self, collaborator: CollaboratorKind, ping: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), CollaboratorError>>,
    {
        let limit = self.config.connection_test_timeout();
        let result = tokio::time::timeout(limit, ping)
            .await
            .unwrap_or_else(|_| Err(CollaboratorError::timeout(limit)));
        match result {
            Ok(()) => {
                tracing::info!(%collaborator, "Connection test passed");
                Ok(())
            }
            Err(source) => {
                tracing::error!(%collaborator, error = %source, "Connection test failed");
                Err(Error::Connectivity {
                    collaborator,
                    source,
                })
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, CollaboratorError>
    where
        F: Future<Output = std::result::Result<T, CollaboratorError>>,
    {
        let limit = self.config.io_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(CollaboratorError::timeout(limit)))
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::memory::{MemoryCatalog, MemoryPublisher, MemoryQueue, MemoryStore};

    struct Fixture {
        supervisor: Supervisor,
        catalog: Arc<MemoryCatalog>,
        queue: Arc<MemoryQueue>,
        store: Arc<MemoryStore>,
        publisher: Arc<MemoryPublisher>,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(
            MemoryCatalog::new()
                .with_template("temperature", Some(r#"{"temperature":{"range":"-10~40"}}"#))
                .with_template("humidity", Some(r#"{"humidity":{"range":"20~90"}}"#))
                .with_device("13", "probe", "temperature", true)
                .with_device("21", "hygro", "humidity", false),
        );
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let config = SimulatorConfig::default()
            .with_pop_timeout(Duration::from_millis(200))
            .with_generation_interval(Duration::from_secs(1));
        let supervisor = Supervisor::new(
            config,
            Collaborators::new(
                Arc::clone(&catalog) as _,
                Arc::clone(&queue) as _,
                Arc::clone(&store) as _,
                Arc::clone(&publisher) as _,
            ),
        );
        Fixture {
            supervisor,
            catalog,
            queue,
            store,
            publisher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_seeds_producers_and_consumers() {
        let f = fixture();
        f.supervisor.start().await.unwrap();

        let status = f.supervisor.status().await;
        assert!(status.started);
        assert_eq!(status.active_producers, 1);
        assert_eq!(status.active_consumers, 2);
        assert_eq!(
            status.consumers.keys().cloned().collect::<Vec<_>>(),
            vec!["humidity".to_string(), "temperature".to_string()]
        );
        f.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_refused() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        assert!(matches!(f.supervisor.start().await, Err(Error::AlreadyStarted)));
        f.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_aborts_start_without_state() {
        let f = fixture();
        f.store.set_available(false);

        let err = f.supervisor.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connectivity {
                collaborator: CollaboratorKind::Store,
                ..
            }
        ));
        assert_eq!(f.supervisor.status().await, SupervisorStatus::default());
        assert!(f.supervisor.producers().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_before_start_is_refused() {
        let f = fixture();
        assert!(matches!(f.supervisor.refresh().await, Err(Error::NotStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_follows_type_changes() {
        let f = fixture();
        f.supervisor.start().await.unwrap();

        f.catalog.remove_template("temperature");
        f.catalog.put_template("soil", None);
        let report = f.supervisor.refresh().await.unwrap();

        assert_eq!(report.started, vec!["soil".to_string()]);
        assert_eq!(report.stopped, vec!["temperature".to_string()]);
        f.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn control_message_reaches_producers() {
        let f = fixture();
        f.supervisor.start().await.unwrap();

        f.queue.push("humidity", r#"{"deviceId":"21","state":1}"#);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let producers = f.supervisor.producers().await.unwrap();
        assert!(producers.is_active(&"21".into()));
        assert!(!f.publisher.messages_for("device_21").is_empty());
        f.supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_collaborators_once() {
        let f = fixture();
        f.supervisor.start().await.unwrap();
        f.supervisor.shutdown().await;
        f.supervisor.shutdown().await;

        assert!(f.catalog.is_closed());
        assert!(f.queue.is_closed());
        assert!(f.store.is_closed());
        assert!(f.publisher.is_closed());
        assert!(!f.supervisor.status().await.started);
        assert!(matches!(f.supervisor.start().await, Err(Error::ShuttingDown)));
    }
}
