// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime configuration.
//!
//! [`SimulatorConfig`] is built once at startup and handed to each component.
//! It can be assembled with the `with_*` setters or loaded from a
//! properties document through [`Properties`].
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use sensim_lib::config::{Properties, SimulatorConfig};
//!
//! let props = Properties::parse("app.consumer.threads=4\napp.generation.interval=30\n");
//! let config = SimulatorConfig::from_properties(&props)?
//!     .with_pop_timeout(Duration::from_secs(1));
//!
//! assert_eq!(config.consumer_pool_size(), 4);
//! assert_eq!(config.generation_interval(), Duration::from_secs(30));
//! # Ok::<(), sensim_lib::ConfigError>(())
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Key/value configuration document.
///
/// Accepts `key=value` and `key: value` lines. Blank lines and lines starting
/// with `#` or `!` are ignored. Later keys override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a properties document.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let split = line
                .find(['=', ':'])
                .map(|idx| (&line[..idx], &line[idx + 1..]));
            match split {
                Some((key, value)) => {
                    entries.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    entries.insert(line.to_string(), String::new());
                }
            }
        }
        Self { entries }
    }

    /// Sets a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the value for a key, or an error if it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the key is not present.
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Parses the value for a key, if present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value does not parse.
    pub fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the document has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configuration for the simulator runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorConfig {
    consumer_pool_size: usize,
    producer_pool_size: usize,
    polling_interval: Duration,
    pop_timeout: Duration,
    generation_interval: Duration,
    io_timeout: Duration,
    connection_test_timeout: Duration,
    shutdown_grace: Duration,
    event_capacity: usize,
}

impl SimulatorConfig {
    /// Default number of concurrently running topic consumers.
    pub const DEFAULT_CONSUMER_POOL_SIZE: usize = 10;
    /// Default number of concurrently running producer ticks.
    pub const DEFAULT_PRODUCER_POOL_SIZE: usize = 10;
    /// Default sleep after a failed pop.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(1000);
    /// Default bounded wait of a blocking pop.
    pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(2);
    /// Default period between two readings of one device.
    pub const DEFAULT_GENERATION_INTERVAL: Duration = Duration::from_secs(60);
    /// Default bound on a single store, publish, or lookup call.
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(5000);
    /// Default bound on a startup connectivity check.
    pub const DEFAULT_CONNECTION_TEST_TIMEOUT: Duration = Duration::from_millis(10_000);
    /// Default grace period for draining workers on shutdown.
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
    /// Default lifecycle event buffer.
    pub const DEFAULT_EVENT_CAPACITY: usize = 256;

    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a properties document.
    ///
    /// Absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a present value cannot be parsed
    /// or is zero where a positive value is required.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = positive(props, "app.consumer.threads")? {
            config.consumer_pool_size = n;
        }
        if let Some(n) = positive(props, "app.producer.threads")? {
            config.producer_pool_size = n;
        }
        if let Some(ms) = props.parsed::<u64>("app.polling.interval")? {
            config.polling_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = positive::<u64>(props, "app.pop.timeout")? {
            config.pop_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive::<u64>(props, "app.generation.interval")? {
            config.generation_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = positive::<u64>(props, "app.io.timeout")? {
            config.io_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = positive::<u64>(props, "app.connection.test.timeout")? {
            config.connection_test_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = props.parsed::<u64>("app.shutdown.grace")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(n) = positive(props, "app.event.capacity")? {
            config.event_capacity = n;
        }

        Ok(config)
    }

    /// Sets the consumer pool size (minimum 1).
    #[must_use]
    pub fn with_consumer_pool_size(mut self, size: usize) -> Self {
        self.consumer_pool_size = size.max(1);
        self
    }

    /// Sets the producer pool size (minimum 1).
    #[must_use]
    pub fn with_producer_pool_size(mut self, size: usize) -> Self {
        self.producer_pool_size = size.max(1);
        self
    }

    /// Sets the sleep applied after a failed pop.
    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the bounded wait of a blocking pop.
    #[must_use]
    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Sets the period between two readings of one device.
    ///
    /// A zero period is replaced by one millisecond.
    #[must_use]
    pub fn with_generation_interval(mut self, interval: Duration) -> Self {
        self.generation_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Sets the bound on a single collaborator call.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the bound on a startup connectivity check.
    #[must_use]
    pub fn with_connection_test_timeout(mut self, timeout: Duration) -> Self {
        self.connection_test_timeout = timeout;
        self
    }

    /// Sets the grace period for draining workers on shutdown.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the lifecycle event buffer size (minimum 1).
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Returns the consumer pool size.
    #[must_use]
    pub fn consumer_pool_size(&self) -> usize {
        self.consumer_pool_size
    }

    /// Returns the producer pool size.
    #[must_use]
    pub fn producer_pool_size(&self) -> usize {
        self.producer_pool_size
    }

    /// Returns the sleep applied after a failed pop.
    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Returns the bounded wait of a blocking pop.
    #[must_use]
    pub fn pop_timeout(&self) -> Duration {
        self.pop_timeout
    }

    /// Returns the period between two readings of one device.
    #[must_use]
    pub fn generation_interval(&self) -> Duration {
        self.generation_interval
    }

    /// Returns the bound on a single collaborator call.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Returns the bound on a startup connectivity check.
    #[must_use]
    pub fn connection_test_timeout(&self) -> Duration {
        self.connection_test_timeout
    }

    /// Returns the grace period for draining workers on shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Returns the lifecycle event buffer size.
    #[must_use]
    pub fn event_capacity(&self) -> usize {
        self.event_capacity
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            consumer_pool_size: Self::DEFAULT_CONSUMER_POOL_SIZE,
            producer_pool_size: Self::DEFAULT_PRODUCER_POOL_SIZE,
            polling_interval: Self::DEFAULT_POLLING_INTERVAL,
            pop_timeout: Self::DEFAULT_POP_TIMEOUT,
            generation_interval: Self::DEFAULT_GENERATION_INTERVAL,
            io_timeout: Self::DEFAULT_IO_TIMEOUT,
            connection_test_timeout: Self::DEFAULT_CONNECTION_TEST_TIMEOUT,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn positive<T>(props: &Properties, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    match props.parsed::<T>(key)? {
        Some(value) if value == T::default() => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}
