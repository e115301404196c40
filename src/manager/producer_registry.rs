// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of per-device producer tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::{DeviceCatalog, ReadingPublisher, ReadingStore};
use crate::config::SimulatorConfig;
use crate::error::{CollaboratorError, Error};
use crate::event::{ControlEvent, DesiredState, EventBus, SimulatorEvent};
use crate::model::{DeviceId, DeviceInfo, TaskId};

use super::consumer_registry::ControlHandler;
use super::producer_task::{ProducerTask, TickContext};

/// Result of a handled control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// A fresh task was started, replacing any previous one.
    Started {
        /// Identity of the new task.
        task_id: TaskId,
    },
    /// The running task was cancelled.
    Stopped,
    /// A stop was requested for a device without a task.
    NotRunning,
    /// A start was requested for a device the lookup does not know.
    DeviceNotFound,
}

/// Owns one periodic reading task per active device.
///
/// Tasks are keyed by device id. Replacing a device's task (cancel the old
/// one, look the device up again, spawn the new one) runs under a lock
/// scoped to that device, so control events for unrelated devices proceed
/// in parallel while a rapid start/stop/start on one device always ends
/// with exactly the state the last event asked for.
///
/// Ticks of all devices share a bounded pool of
/// [`producer_pool_size`](SimulatorConfig::producer_pool_size) permits;
/// excess ticks wait for a permit rather than failing.
pub struct ProducerRegistry {
    tasks: DashMap<DeviceId, ProducerTask>,
    locks: DashMap<DeviceId, Arc<Mutex<()>>>,
    catalog: Arc<dyn DeviceCatalog>,
    context: Arc<TickContext>,
    config: SimulatorConfig,
    events: EventBus,
    root: CancellationToken,
    shutting_down: AtomicBool,
}

impl ProducerRegistry {
    /// Creates an empty registry.
    ///
    /// Every task is cancelled when `root` is.
    #[must_use]
    pub fn new(
        config: &SimulatorConfig,
        catalog: Arc<dyn DeviceCatalog>,
        store: Arc<dyn ReadingStore>,
        publisher: Arc<dyn ReadingPublisher>,
        events: EventBus,
        root: CancellationToken,
    ) -> Self {
        let context = Arc::new(TickContext {
            store,
            publisher,
            permits: Arc::new(Semaphore::new(config.producer_pool_size())),
            events: events.clone(),
            interval: config.generation_interval(),
            io_timeout: config.io_timeout(),
        });
        Self {
            tasks: DashMap::new(),
            locks: DashMap::new(),
            catalog,
            context,
            config: config.clone(),
            events,
            root,
            shutting_down: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Applies a desired state to a device's stream.
    ///
    /// - [`DesiredState::Start`]: cancels any running task, looks the device
    ///   up, and starts a fresh task ticking immediately. An unknown device
    ///   is logged and yields [`ControlOutcome::DeviceNotFound`] without
    ///   creating a task.
    /// - [`DesiredState::Stop`]: cancels the running task, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`shutdown_all`](Self::shutdown_all)
    /// and [`Error::Collaborator`] if the lookup fails or times out. A failed
    /// start leaves no task behind.
    pub async fn handle_control_event(
        &self,
        device_id: &DeviceId,
        state: DesiredState,
    ) -> Result<ControlOutcome, Error> {
        self.ensure_accepting()?;

        let lock = self.key_lock(device_id);
        let guard = lock.lock().await;
        let result = self.apply(device_id, state).await;
        drop(guard);
        drop(lock);

        // Only the map's own reference is left once no event holds the lock
        self.locks.remove_if(device_id, |_, held| Arc::strong_count(held) == 1);
        result
    }

    async fn apply(
        &self,
        device_id: &DeviceId,
        state: DesiredState,
    ) -> Result<ControlOutcome, Error> {
        match state {
            DesiredState::Stop => {
                let stopped = self.cancel_existing(device_id);
                if stopped {
                    tracing::info!(%device_id, "Stopped data generation");
                    Ok(ControlOutcome::Stopped)
                } else {
                    tracing::debug!(%device_id, "Stop requested for idle device");
                    Ok(ControlOutcome::NotRunning)
                }
            }
            DesiredState::Start => {
                self.cancel_existing(device_id);

                let lookup = tokio::time::timeout(
                    self.config.io_timeout(),
                    self.catalog.device_info(device_id),
                )
                .await
                .unwrap_or_else(|_| Err(CollaboratorError::timeout(self.config.io_timeout())));

                let device = match lookup {
                    Ok(Some(device)) => device,
                    Ok(None) => {
                        tracing::warn!(%device_id, "Device not found, not starting data generation");
                        return Ok(ControlOutcome::DeviceNotFound);
                    }
                    Err(e) => {
                        tracing::error!(%device_id, error = %e, "Device lookup failed");
                        return Err(e.into());
                    }
                };

                let task_id = self.insert_task(device);

                // Shutdown may have drained the map between the lookup and the insert
                if self.shutting_down.load(Ordering::SeqCst) {
                    if let Some((_, task)) = self
                        .tasks
                        .remove_if(device_id, |_, task| task.task_id() == task_id)
                    {
                        task.cancel();
                        self.events.publish(SimulatorEvent::ProducerStopped {
                            device_id: device_id.clone(),
                            task_id,
                        });
                    }
                    return Err(Error::ShuttingDown);
                }
                Ok(ControlOutcome::Started { task_id })
            }
        }
    }

    /// Starts one task per device. Used once at startup.
    ///
    /// Returns the number of tasks started.
    pub fn seed_from_active_devices(&self, devices: Vec<DeviceInfo>) -> usize {
        let mut started = 0;
        for device in devices {
            if self.shutting_down.load(Ordering::Acquire) {
                break;
            }
            tracing::info!(
                device_id = %device.device_id(),
                device_name = device.device_name(),
                type_name = device.type_name(),
                "Found active device"
            );
            self.insert_task(device);
            started += 1;
        }
        tracing::info!(count = started, "Initialized active devices");
        started
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Returns the number of registered tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the device has a live task.
    #[must_use]
    pub fn is_active(&self, device_id: &DeviceId) -> bool {
        self.tasks
            .get(device_id)
            .is_some_and(|task| task.is_live())
    }

    /// Returns the identity of the device's current task.
    #[must_use]
    pub fn task_id(&self, device_id: &DeviceId) -> Option<TaskId> {
        self.tasks.get(device_id).map(|task| task.task_id())
    }

    /// Returns the devices with a registered task.
    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Cancels every task and waits for them to exit.
    ///
    /// Tasks still running after the configured grace period are aborted.
    /// Control events are refused from now on.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.root.cancel();

        let tasks = self.drain();
        tracing::info!(count = tasks.len(), "Stopping all device data generation tasks");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let mut aborted = 0usize;
        for mut handle in tasks.into_iter().map(ProducerTask::into_handle) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Producer tasks did not stop within grace period");
        }

        // Tasks seeded while the first drain ran
        drop(self.drain());
        tracing::info!("Sensor data generator shut down");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_accepting(&self) -> Result<(), Error> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn key_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(device_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn insert_task(&self, device: DeviceInfo) -> TaskId {
        let device_id = device.device_id().clone();
        let task = ProducerTask::spawn(device, Arc::clone(&self.context), self.root.child_token());
        let task_id = task.task_id();

        if let Some(previous) = self.tasks.insert(device_id.clone(), task) {
            previous.cancel();
        }
        self.events.publish(SimulatorEvent::ProducerStarted { device_id, task_id });
        task_id
    }

    fn cancel_existing(&self, device_id: &DeviceId) -> bool {
        match self.tasks.remove(device_id) {
            Some((_, task)) => {
                task.cancel();
                self.events.publish(SimulatorEvent::ProducerStopped {
                    device_id: device_id.clone(),
                    task_id: task.task_id(),
                });
                true
            }
            None => false,
        }
    }

    fn drain(&self) -> Vec<ProducerTask> {
        let keys = self.device_ids();
        keys.into_iter()
            .filter_map(|device_id| self.tasks.remove(&device_id))
            .map(|(device_id, task)| {
                task.cancel();
                self.events.publish(SimulatorEvent::ProducerStopped {
                    device_id,
                    task_id: task.task_id(),
                });
                task
            })
            .collect()
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("tasks", &self.tasks.len())
            .field("shutting_down", &self.shutting_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ControlHandler for ProducerRegistry {
    async fn handle_control(&self, event: ControlEvent) -> Result<ControlOutcome, Error> {
        let (device_id, state) = event.into_parts();
        self.handle_control_event(&device_id, state).await
    }
}
