// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event bus for broadcasting simulator events.

use tokio::sync::broadcast;

use super::SimulatorEvent;

/// Default channel capacity for the event bus.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`SimulatorEvent`]s to any number of subscribers.
///
/// Clones share the same channel. A subscriber that falls more than the
/// capacity behind loses the oldest events and receives
/// `RecvError::Lagged` on its next receive.
///
/// # Examples
///
/// ```
/// use sensim_lib::event::{EventBus, SimulatorEvent};
/// use sensim_lib::model::{DeviceId, TaskId};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SimulatorEvent::ProducerStarted {
///     device_id: DeviceId::new("13"),
///     task_id: TaskId::new(),
/// });
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SimulatorEvent>,
}

impl EventBus {
    /// Creates a new event bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new event bus buffering up to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SimulatorEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event. Without subscribers the event is discarded.
    pub fn publish(&self, event: SimulatorEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Publishes an event and returns how many subscribers received it.
    #[must_use]
    pub fn publish_counted(&self, event: SimulatorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
