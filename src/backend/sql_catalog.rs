// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lookup backed by a MySQL database.
//!
//! Two tables are read:
//!
//! - `device(device_id, device_name, state, dt_id)`
//! - `device_template(dt_id, en_name, template)`
//!
//! Devices are joined to their template with a left join, so a device whose
//! template row is missing is still returned with an empty type name and a
//! null template.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use super::DeviceCatalog;
use crate::config::Properties;
use crate::error::{CollaboratorError, ConfigError};
use crate::model::{DeviceId, DeviceInfo};

const DEVICE_TYPES_SQL: &str = "SELECT DISTINCT en_name FROM device_template \
     WHERE en_name IS NOT NULL AND en_name != ''";

const DEVICE_INFO_SQL: &str = "SELECT CAST(d.device_id AS SIGNED), d.device_name, dt.en_name, \
     CAST(dt.template AS CHAR) \
     FROM device d LEFT JOIN device_template dt ON d.dt_id = dt.dt_id \
     WHERE d.device_id = ?";

const ACTIVE_DEVICES_SQL: &str = "SELECT CAST(d.device_id AS SIGNED), d.device_name, dt.en_name, \
     CAST(dt.template AS CHAR) \
     FROM device d LEFT JOIN device_template dt ON d.dt_id = dt.dt_id \
     WHERE d.state = 1";

type DeviceRow = (i64, Option<String>, Option<String>, Option<String>);

/// Configuration of a [`SqlCatalog`].
///
/// # Examples
///
/// ```
/// use sensim_lib::backend::SqlCatalogConfig;
///
/// let config = SqlCatalogConfig::new("jdbc:mysql://db.local:3306/iot?useSSL=false")
///     .with_credentials("sim", "secret");
/// assert_eq!(config.url(), "mysql://db.local:3306/iot?useSSL=false");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlCatalogConfig {
    url: String,
    credentials: Option<(String, String)>,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl SqlCatalogConfig {
    /// Default pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
    /// Default wait for a pooled connection.
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration for a database URL.
    ///
    /// A leading `jdbc:` is dropped, so `jdbc:mysql://host/db` and
    /// `mysql://host/db` are equivalent.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let url = url.strip_prefix("jdbc:").map_or(url.clone(), str::to_string);
        Self {
            url,
            credentials: None,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Loads `mysql.url` and the optional `mysql.username`,
    /// `mysql.password`, and `mysql.pool.size` keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the URL is absent or the pool size is not
    /// a positive number.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let mut config = Self::new(props.require("mysql.url")?);
        if let Some(user) = props.get("mysql.username") {
            config = config.with_credentials(user, props.get("mysql.password").unwrap_or(""));
        }
        if let Some(size) = props.parsed::<u32>("mysql.pool.size")? {
            if size == 0 {
                return Err(ConfigError::Invalid {
                    key: "mysql.pool.size".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.max_connections = size;
        }
        Ok(config)
    }

    /// Sets the login.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Sets how long a query waits for a pooled connection.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Returns the database URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the pool size.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    fn connect_options(&self) -> Result<MySqlConnectOptions, CollaboratorError> {
        let mut options = MySqlConnectOptions::from_str(&self.url)
            .map_err(|e| CollaboratorError::InvalidAddress(e.to_string()))?;
        if let Some((username, password)) = &self.credentials {
            options = options.username(username).password(password);
        }
        Ok(options)
    }
}

/// Looks devices and templates up in MySQL.
///
/// # Examples
///
/// ```no_run
/// use sensim_lib::backend::{DeviceCatalog, SqlCatalog, SqlCatalogConfig};
///
/// # async fn example() -> Result<(), sensim_lib::CollaboratorError> {
/// let catalog = SqlCatalog::new(&SqlCatalogConfig::new("mysql://127.0.0.1:3306/iot"))?;
/// catalog.ping().await?;
/// for type_name in catalog.device_types().await? {
///     println!("{type_name}");
/// }
/// catalog.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SqlCatalog {
    pool: MySqlPool,
}

impl SqlCatalog {
    /// Creates a connection pool. No connection is opened until first use.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::InvalidAddress`] if the URL cannot be
    /// parsed.
    pub fn new(config: &SqlCatalogConfig) -> Result<Self, CollaboratorError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(config.connect_options()?);
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    fn ensure_open(&self) -> Result<(), CollaboratorError> {
        if self.pool.is_closed() {
            Err(CollaboratorError::Closed("lookup".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceCatalog for SqlCatalog {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.ensure_open()?;
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        tracing::debug!("Database connection test successful");
        Ok(())
    }

    async fn device_types(&self) -> Result<Vec<String>, CollaboratorError> {
        self.ensure_open()?;
        let types: Vec<(String,)> = sqlx::query_as(DEVICE_TYPES_SQL)
            .fetch_all(&self.pool)
            .await?;
        let types: Vec<String> = types.into_iter().map(|(name,)| name).collect();
        for type_name in &types {
            tracing::info!(type_name = %type_name, "Found device type");
        }
        tracing::info!(count = types.len(), "Total device types found");
        Ok(types)
    }

    async fn device_info(
        &self,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>, CollaboratorError> {
        self.ensure_open()?;
        // Device ids are integer keys; anything else cannot match a row
        let Ok(key) = device_id.as_str().trim().parse::<i64>() else {
            tracing::warn!(%device_id, "Device id is not numeric");
            return Ok(None);
        };
        let row: Option<DeviceRow> = sqlx::query_as(DEVICE_INFO_SQL)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(device_from_row))
    }

    async fn active_devices(&self) -> Result<Vec<DeviceInfo>, CollaboratorError> {
        self.ensure_open()?;
        let rows: Vec<DeviceRow> = sqlx::query_as(ACTIVE_DEVICES_SQL)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(device_from_row).collect())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        if !self.pool.is_closed() {
            tracing::info!("Closing database pool");
            self.pool.close().await;
        }
        Ok(())
    }
}

fn device_from_row((device_id, device_name, type_name, template): DeviceRow) -> DeviceInfo {
    DeviceInfo::new(device_id, device_name.unwrap_or_default(), type_name.unwrap_or_default())
        .with_template_text(template.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jdbc_prefix_is_dropped() {
        let config = SqlCatalogConfig::new("jdbc:mysql://db:3306/iot");
        assert_eq!(config.url(), "mysql://db:3306/iot");
        assert_eq!(SqlCatalogConfig::new("mysql://db/iot").url(), "mysql://db/iot");
    }

    #[test]
    fn from_properties_reads_credentials_and_pool_size() {
        let props = Properties::new()
            .with("mysql.url", "jdbc:mysql://db:3306/iot")
            .with("mysql.username", "sim")
            .with("mysql.password", "secret")
            .with("mysql.pool.size", "8");
        let config = SqlCatalogConfig::from_properties(&props).unwrap();
        assert_eq!(config.url(), "mysql://db:3306/iot");
        assert_eq!(config.max_connections(), 8);
        assert_eq!(
            config,
            SqlCatalogConfig::new("mysql://db:3306/iot")
                .with_credentials("sim", "secret")
                .with_max_connections(8)
        );
    }

    #[test]
    fn from_properties_requires_url() {
        assert_eq!(
            SqlCatalogConfig::from_properties(&Properties::new()),
            Err(ConfigError::Missing("mysql.url".to_string()))
        );
    }

    #[test]
    fn from_properties_rejects_empty_pool() {
        let props = Properties::new()
            .with("mysql.url", "mysql://db/iot")
            .with("mysql.pool.size", "0");
        assert!(matches!(
            SqlCatalogConfig::from_properties(&props),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn row_with_missing_template_yields_untyped_device() {
        let device = device_from_row((7, Some("gauge".to_string()), None, None));
        assert_eq!(device.device_id(), &DeviceId::new("7"));
        assert_eq!(device.device_name(), "gauge");
        assert_eq!(device.type_name(), "");
        assert!(device.template().is_null());
    }

    #[test]
    fn row_with_template_is_parsed() {
        let device = device_from_row((
            13,
            Some("probe".to_string()),
            Some("temperature".to_string()),
            Some(r#"{"temperature":{"range":"-10~40"}}"#.to_string()),
        ));
        assert_eq!(device.type_name(), "temperature");
        assert_eq!(device.template()["temperature"]["range"], "-10~40");
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        assert!(matches!(
            SqlCatalog::new(&SqlCatalogConfig::new("not a url")),
            Err(CollaboratorError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn non_numeric_device_id_is_unknown() {
        let catalog = SqlCatalog::new(&SqlCatalogConfig::new("mysql://127.0.0.1:1/iot")).unwrap();
        assert!(catalog.device_info(&DeviceId::new("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_catalog_refuses_queries() {
        let catalog = SqlCatalog::new(&SqlCatalogConfig::new("mysql://127.0.0.1:1/iot")).unwrap();
        catalog.close().await.unwrap();
        catalog.close().await.unwrap();
        assert!(matches!(
            catalog.ping().await,
            Err(CollaboratorError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_database_fails_ping() {
        let config = SqlCatalogConfig::new("mysql://127.0.0.1:1/iot")
            .with_acquire_timeout(Duration::from_millis(300));
        let catalog = SqlCatalog::new(&config).unwrap();
        assert!(matches!(catalog.ping().await, Err(CollaboratorError::Sql(_))));
    }
}
