// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control messages and lifecycle events.
//!
//! [`ControlEvent`] is the decoded form of a message popped from a
//! device-type topic. [`SimulatorEvent`]s are emitted by the registries and
//! fanned out to subscribers through the [`EventBus`].
//!
//! # Examples
//!
//! ```
//! use sensim_lib::event::{EventBus, SimulatorEvent};
//! use sensim_lib::model::WorkerId;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(SimulatorEvent::ConsumerStarted {
//!     topic: "humidity".to_string(),
//!     worker_id: WorkerId::new(),
//! });
//! ```

mod control;
mod event_bus;
mod simulator_event;

pub use control::{ControlEvent, DesiredState};
pub use event_bus::EventBus;
pub use simulator_event::SimulatorEvent;
