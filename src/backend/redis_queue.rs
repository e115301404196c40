// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control queue backed by Redis lists.
//!
//! Each topic is a Redis list popped with `BLPOP`. A blocking pop occupies
//! its connection for the whole wait, so every topic gets its own
//! connection; a connection that fails is dropped and re-opened on the next
//! pop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;

use super::ControlQueue;
use crate::config::Properties;
use crate::error::{CollaboratorError, ConfigError};

/// Configuration of a [`RedisQueue`].
///
/// # Examples
///
/// ```
/// use sensim_lib::backend::RedisQueueConfig;
///
/// let config = RedisQueueConfig::new("redis.local").with_database(2);
/// assert_eq!(config.url(), "redis://redis.local:6379/2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisQueueConfig {
    host: String,
    port: u16,
    database: i64,
    password: Option<String>,
}

impl RedisQueueConfig {
    /// Default Redis port.
    pub const DEFAULT_PORT: u16 = 6379;

    /// Creates a configuration for a Redis host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            database: 0,
            password: None,
        }
    }

    /// Loads `redis.host`, `redis.port`, `redis.database`, and
    /// `redis.password`, defaulting to `localhost:6379/0`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the port or database is not a number.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let mut config = Self::new(props.get("redis.host").unwrap_or("localhost"));
        if let Some(port) = props.parsed::<u16>("redis.port")? {
            config.port = port;
        }
        if let Some(database) = props.parsed::<i64>("redis.database")? {
            config.database = database;
        }
        if let Some(password) = props.get("redis.password").filter(|p| !p.is_empty()) {
            config.password = Some(password.to_string());
        }
        Ok(config)
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the logical database.
    #[must_use]
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Returns the connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Pops control messages from Redis lists.
pub struct RedisQueue {
    client: redis::Client,
    connections: DashMap<String, MultiplexedConnection>,
    closed: AtomicBool,
}

impl RedisQueue {
    /// Creates a queue client. No connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::Redis`] if the configuration does not
    /// form a valid Redis URL.
    pub fn new(config: &RedisQueueConfig) -> Result<Self, CollaboratorError> {
        let client = redis::Client::open(config.url())?;
        Ok(Self {
            client,
            connections: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the number of cached per-topic connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn ensure_open(&self) -> Result<(), CollaboratorError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CollaboratorError::Closed("queue".to_string()))
        } else {
            Ok(())
        }
    }

    async fn connection_for(&self, topic: &str) -> Result<MultiplexedConnection, CollaboratorError> {
        if let Some(conn) = self.connections.get(topic) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        tracing::debug!(topic, "Opened Redis connection for topic");
        self.connections.insert(topic.to_string(), conn.clone());
        Ok(conn)
    }
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("connections", &self.connections.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl ControlQueue for RedisQueue {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.ensure_open()?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(reply = %reply, "Redis ping response");
        if reply == "PONG" {
            Ok(())
        } else {
            Err(CollaboratorError::Decode(format!(
                "unexpected PING reply: {reply}"
            )))
        }
    }

    async fn blocking_pop(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CollaboratorError> {
        self.ensure_open()?;
        let mut conn = self.connection_for(topic).await?;

        // BLPOP treats 0 as "block forever"
        let secs = (timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)).max(1);
        let reply: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BLPOP")
            .arg(topic)
            .arg(secs)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(popped) => Ok(popped.map(|(_, message)| message)),
            Err(e) => {
                self.connections.remove(topic);
                Err(e.into())
            }
        }
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.closed.store(true, Ordering::Release);
        self.connections.clear();
        tracing::info!("Redis queue closed");
        Ok(())
    }
}
