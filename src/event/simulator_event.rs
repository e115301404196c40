// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulator lifecycle events.

use serde::{Deserialize, Serialize};

use crate::model::{DeviceId, TaskId, WorkerId};

use super::DesiredState;

/// Events emitted by the producer and consumer registries.
///
/// Subscribers observe stream starts and stops, every generated reading, and
/// every control message a consumer forwards.
///
/// # Examples
///
/// ```
/// use sensim_lib::event::SimulatorEvent;
/// use sensim_lib::model::{DeviceId, TaskId};
///
/// let started = SimulatorEvent::ProducerStarted {
///     device_id: DeviceId::new("13"),
///     task_id: TaskId::new(),
/// };
/// assert!(started.is_producer());
/// assert_eq!(started.device_id().map(DeviceId::as_str), Some("13"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SimulatorEvent {
    /// A device's reading stream started.
    ProducerStarted {
        /// Device whose stream started.
        device_id: DeviceId,
        /// Identity of the new task.
        task_id: TaskId,
    },

    /// A device's reading stream was cancelled.
    ProducerStopped {
        /// Device whose stream stopped.
        device_id: DeviceId,
        /// Identity of the cancelled task.
        task_id: TaskId,
    },

    /// A tick stored and published a reading.
    ReadingGenerated {
        /// Device the reading belongs to.
        device_id: DeviceId,
        /// Store row key of the reading.
        row_key: String,
    },

    /// A tick failed to build or deliver its reading.
    TickFailed {
        /// Device whose tick failed.
        device_id: DeviceId,
        /// Description of the failure.
        error: String,
    },

    /// A consumer worker began polling its topic.
    ConsumerStarted {
        /// Topic being polled.
        topic: String,
        /// Identity of the worker.
        worker_id: WorkerId,
    },

    /// A consumer worker exited.
    ConsumerStopped {
        /// Topic that was polled.
        topic: String,
        /// Identity of the worker.
        worker_id: WorkerId,
    },

    /// A consumer forwarded a decoded control message.
    ControlReceived {
        /// Topic the message was popped from.
        topic: String,
        /// Target device.
        device_id: DeviceId,
        /// Requested state.
        state: DesiredState,
    },
}

impl SimulatorEvent {
    /// Returns the device this event concerns, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::ProducerStarted { device_id, .. }
            | Self::ProducerStopped { device_id, .. }
            | Self::ReadingGenerated { device_id, .. }
            | Self::TickFailed { device_id, .. }
            | Self::ControlReceived { device_id, .. } => Some(device_id),
            Self::ConsumerStarted { .. } | Self::ConsumerStopped { .. } => None,
        }
    }

    /// Returns the topic this event concerns, if any.
    #[must_use]
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::ConsumerStarted { topic, .. }
            | Self::ConsumerStopped { topic, .. }
            | Self::ControlReceived { topic, .. } => Some(topic),
            _ => None,
        }
    }

    /// Returns `true` for producer lifecycle and tick events.
    #[must_use]
    pub fn is_producer(&self) -> bool {
        matches!(
            self,
            Self::ProducerStarted { .. }
                | Self::ProducerStopped { .. }
                | Self::ReadingGenerated { .. }
                | Self::TickFailed { .. }
        )
    }

    /// Returns `true` for consumer lifecycle and control events.
    #[must_use]
    pub fn is_consumer(&self) -> bool {
        !self.is_producer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_events_have_topics() {
        let event = SimulatorEvent::ConsumerStarted {
            topic: "humidity".to_string(),
            worker_id: WorkerId::new(),
        };
        assert_eq!(event.topic(), Some("humidity"));
        assert!(event.device_id().is_none());
        assert!(event.is_consumer());
    }

    #[test]
    fn control_event_carries_both_keys() {
        let event = SimulatorEvent::ControlReceived {
            topic: "temperature".to_string(),
            device_id: DeviceId::new("13"),
            state: DesiredState::Start,
        };
        assert_eq!(event.topic(), Some("temperature"));
        assert_eq!(event.device_id(), Some(&DeviceId::new("13")));
    }

    #[test]
    fn serializes_with_tag() {
        let event = SimulatorEvent::TickFailed {
            device_id: DeviceId::new("2"),
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "tick_failed");
        assert_eq!(value["device_id"], "2");
    }
}
