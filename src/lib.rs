// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Sensim` Lib - A Rust library that drives simulated IoT sensor streams.
//!
//! Each simulated device produces a synthetic reading on a fixed interval
//! while it is switched on. Devices are switched on and off by control
//! messages arriving on per-device-type queue topics. Every reading is
//! written to a wide-column store and published on a message stream.
//!
//! # Components
//!
//! - **Producers**: one periodic task per active device ([`manager::ProducerRegistry`])
//! - **Consumers**: one blocking-pop worker per device type ([`manager::ConsumerRegistry`])
//! - **Readings**: template-driven value synthesis ([`template`])
//! - **Supervision**: startup checks, topic refresh, ordered shutdown ([`Supervisor`])
//!
//! # Collaborators
//!
//! The library talks to four external systems through traits in [`backend`]:
//!
//! - a device and template lookup ([`backend::DeviceCatalog`]), MySQL with feature `mysql`
//! - a control queue ([`backend::ControlQueue`]), Redis lists with feature `redis`
//! - a reading store ([`backend::ReadingStore`]), HBase REST with feature `http`
//! - a reading publisher ([`backend::ReadingPublisher`]), Kafka with feature `kafka`
//!   or MQTT with feature `mqtt`
//!
//! In-memory versions of all four live in [`backend::memory`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensim_lib::backend::{
//!     Collaborators, HbaseRestConfig, HbaseRestStore, MqttPublisher, MqttPublisherConfig,
//!     RedisQueue, RedisQueueConfig, SqlCatalog, SqlCatalogConfig,
//! };
//! use sensim_lib::config::Properties;
//! use sensim_lib::{SimulatorConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let props = Properties::parse(&std::fs::read_to_string("application.properties")?);
//!     let config = SimulatorConfig::from_properties(&props)?;
//!
//!     // With feature `kafka`, a `KafkaPublisher` can stand in for the MQTT publisher
//!     let collaborators = Collaborators::new(
//!         Arc::new(SqlCatalog::new(&SqlCatalogConfig::from_properties(&props)?)?),
//!         Arc::new(RedisQueue::new(&RedisQueueConfig::from_properties(&props)?)?),
//!         Arc::new(HbaseRestStore::new(HbaseRestConfig::from_properties(&props)?)?),
//!         Arc::new(MqttPublisher::connect(MqttPublisherConfig::from_properties(&props)?)?),
//!     );
//!
//!     let supervisor = Supervisor::new(config, collaborators);
//!     supervisor.start().await?;
//!
//!     loop {
//!         tokio::time::sleep(std::time::Duration::from_secs(300)).await;
//!         supervisor.refresh().await?;
//!     }
//! }
//! ```
//!
//! # Control Messages
//!
//! A control message is JSON naming a device and a desired state:
//!
//! ```text
//! {"deviceId": "13", "state": 1}
//! ["type-tag", {"deviceId": 13, "state": "0"}]
//! ```
//!
//! State `1` starts the device's stream (restarting it if already running);
//! any other state stops it.

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod model;
pub mod template;

pub use config::{Properties, SimulatorConfig};
pub use error::{CollaboratorError, ConfigError, Error, ParseError, Result};
pub use event::{ControlEvent, DesiredState, EventBus, SimulatorEvent};
pub use manager::{
    ConsumerRegistry, ControlOutcome, ProducerRegistry, ReconcileReport, Supervisor,
    SupervisorStatus,
};
pub use model::{DeviceId, DeviceInfo, TaskId, WorkerId};
pub use template::{RangeSpec, Reading, ReadingBuilder};
