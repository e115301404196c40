// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker lifecycle management.
//!
//! This module owns everything that runs in the background:
//!
//! - [`ProducerRegistry`]: one periodic reading task per active device,
//!   started and stopped by control events.
//! - [`ConsumerRegistry`]: one control-queue polling worker per device type
//!   topic, reconciled against the known types.
//! - [`Supervisor`]: composes both registries with their collaborators and
//!   owns startup checks and shutdown ordering.
//!
//! # Examples
//!
//! ## Driving a device directly
//!
//! ```
//! use std::sync::Arc;
//! use sensim_lib::backend::memory::{MemoryCatalog, MemoryPublisher, MemoryStore};
//! use sensim_lib::event::{DesiredState, EventBus};
//! use sensim_lib::manager::{ControlOutcome, ProducerRegistry};
//! use sensim_lib::model::DeviceId;
//! use sensim_lib::SimulatorConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> sensim_lib::Result<()> {
//! let catalog = MemoryCatalog::new()
//!     .with_template("temperature", Some(r#"{"temperature":{"range":"-10~40"}}"#))
//!     .with_device("13", "probe", "temperature", false);
//!
//! let registry = ProducerRegistry::new(
//!     &SimulatorConfig::default(),
//!     Arc::new(catalog),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryPublisher::new()),
//!     EventBus::new(),
//!     CancellationToken::new(),
//! );
//!
//! let device = DeviceId::new("13");
//! let outcome = registry.handle_control_event(&device, DesiredState::Start).await?;
//! assert!(matches!(outcome, ControlOutcome::Started { .. }));
//! assert_eq!(registry.active_count(), 1);
//!
//! registry.shutdown_all().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Watching lifecycle events
//!
//! ```no_run
//! use sensim_lib::Supervisor;
//! use sensim_lib::event::SimulatorEvent;
//!
//! # fn example(supervisor: &Supervisor) {
//! let mut events = supervisor.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SimulatorEvent::ReadingGenerated { device_id, row_key } => {
//!                 println!("{device_id}: stored {row_key}");
//!             }
//!             SimulatorEvent::TickFailed { device_id, error } => {
//!                 println!("{device_id}: {error}");
//!             }
//!             _ => {}
//!         }
//!     }
//! });
//! # }
//! ```

mod consumer_registry;
mod consumer_worker;
mod producer_registry;
mod producer_task;
mod supervisor;

pub use consumer_registry::{ConsumerRegistry, ControlHandler, ReconcileReport};
pub use consumer_worker::{ConsumerWorker, WorkerState};
pub use producer_registry::{ControlOutcome, ProducerRegistry};
pub use producer_task::ProducerTask;
pub use supervisor::{Supervisor, SupervisorStatus};
