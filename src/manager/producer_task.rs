// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic reading task of one device.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{PublishCallback, ReadingPublisher, ReadingStore};
use crate::error::CollaboratorError;
use crate::event::{EventBus, SimulatorEvent};
use crate::model::{DeviceId, DeviceInfo, TaskId};
use crate::template::ReadingBuilder;

/// Handle to a running producer task.
///
/// Dropping the handle does not stop the task; call [`cancel`](Self::cancel).
#[derive(Debug)]
pub struct ProducerTask {
    task_id: TaskId,
    device: DeviceInfo,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProducerTask {
    /// Spawns the periodic loop for `device`.
    pub(crate) fn spawn(
        device: DeviceInfo,
        context: Arc<TickContext>,
        cancel: CancellationToken,
    ) -> Self {
        let task_id = TaskId::new();
        let handle = tokio::spawn(run(device.clone(), context, cancel.clone()));
        Self {
            task_id,
            device,
            cancel,
            handle,
        }
    }

    /// Returns the task identity.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns the device snapshot the task ticks with.
    #[must_use]
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Returns true until the task is cancelled or has exited.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }

    /// Requests the task to stop at its next tick boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

/// Resources shared by every tick.
pub(crate) struct TickContext {
    pub(crate) store: Arc<dyn ReadingStore>,
    pub(crate) publisher: Arc<dyn ReadingPublisher>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) events: EventBus,
    pub(crate) interval: Duration,
    pub(crate) io_timeout: Duration,
}

impl TickContext {
    /// Builds one reading and hands it to the store and the publisher.
    ///
    /// Store and publish failures are logged independently; neither stops
    /// the other nor the next tick.
    async fn tick(&self, device: &DeviceInfo) {
        let device_id = device.device_id();
        let timestamp = Utc::now().timestamp_millis();

        let reading = match ReadingBuilder::build(device, timestamp) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::error!(%device_id, error = %e, "Failed to build reading");
                self.fail(device_id, e.to_string());
                return;
            }
        };

        let mut failure = None;

        let stored = tokio::time::timeout(
            self.io_timeout,
            self.store.put(reading.row_key(), reading.store_fields()),
        )
        .await
        .unwrap_or_else(|_| Err(CollaboratorError::timeout(self.io_timeout)));
        match stored {
            Ok(()) => tracing::debug!(%device_id, row_key = reading.row_key(), "Reading stored"),
            Err(e) => {
                tracing::error!(%device_id, error = %e, "Failed to store reading");
                failure = Some(format!("store: {e}"));
            }
        }

        let key = device_id.publish_key();
        let on_complete: PublishCallback = {
            let device_id = device_id.clone();
            Box::new(move |result: Result<(), CollaboratorError>| match result {
                Ok(()) => tracing::trace!(%device_id, "Reading delivered"),
                Err(e) => tracing::error!(%device_id, error = %e, "Reading delivery failed"),
            })
        };
        let published = tokio::time::timeout(
            self.io_timeout,
            self.publisher
                .publish(&key, reading.payload(), Some(on_complete)),
        )
        .await
        .unwrap_or_else(|_| Err(CollaboratorError::timeout(self.io_timeout)));
        match published {
            Ok(()) => tracing::debug!(%device_id, key = %key, "Reading published"),
            Err(e) => {
                tracing::error!(%device_id, error = %e, "Failed to publish reading");
                failure.get_or_insert_with(|| format!("publish: {e}"));
            }
        }

        match failure {
            None => self.events.publish(SimulatorEvent::ReadingGenerated {
                device_id: device_id.clone(),
                row_key: reading.row_key().to_string(),
            }),
            Some(error) => self.fail(device_id, error),
        }
    }

    fn fail(&self, device_id: &DeviceId, error: String) {
        self.events.publish(SimulatorEvent::TickFailed {
            device_id: device_id.clone(),
            error,
        });
    }
}

/// Ticks at a fixed rate, first tick immediately, until cancelled.
///
/// Cancellation is observed between ticks; a tick in flight completes.
async fn run(device: DeviceInfo, context: Arc<TickContext>, cancel: CancellationToken) {
    let device_id = device.device_id().clone();
    tracing::info!(
        %device_id,
        type_name = device.type_name(),
        interval_ms = u64::try_from(context.interval.as_millis()).unwrap_or(u64::MAX),
        "Producer started"
    );

    let mut ticker = tokio::time::interval(context.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&context.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        context.tick(&device).await;
        drop(permit);
    }

    tracing::info!(%device_id, "Producer stopped");
}
