// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading store backed by the HBase REST gateway.
//!
//! Rows are written with `PUT /<table>/<row>` using the JSON cell-set
//! format, in which row keys, columns, and values are base64 encoded:
//!
//! ```json
//! {"Row":[{"key":"MTNfMTcwMA==","Cell":[{"column":"Y2Y6dGVtcGVyYXR1cmU=","$":"e30="}]}]}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};

use super::ReadingStore;
use crate::config::Properties;
use crate::error::{CollaboratorError, ConfigError};
use crate::model::DeviceId;

/// Configuration of an [`HbaseRestStore`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensim_lib::backend::HbaseRestConfig;
///
/// let config = HbaseRestConfig::new("http://hbase:8080/", "sensor_data", "cf")
///     .with_timeout(Duration::from_secs(2));
/// assert_eq!(config.base_url(), "http://hbase:8080");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaseRestConfig {
    base_url: String,
    table: String,
    column_family: String,
    timeout: Duration,
}

impl HbaseRestConfig {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a configuration. A trailing `/` on the base URL is dropped.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        table: impl Into<String>,
        column_family: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            table: table.into(),
            column_family: column_family.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Loads `hbase.rest.url`, `hbase.table.name`, and `hbase.column.family`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if any key is absent.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        Ok(Self::new(
            props.require("hbase.rest.url")?,
            props.require("hbase.table.name")?,
            props.require("hbase.column.family")?,
        ))
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the gateway base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the column family readings are written to.
    #[must_use]
    pub fn column_family(&self) -> &str {
        &self.column_family
    }

    /// Returns the request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// A decoded cell read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaseCell {
    /// Column family.
    pub family: String,
    /// Column qualifier.
    pub qualifier: String,
    /// Cell value.
    pub value: String,
    /// Cell timestamp, if reported.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellSetDoc {
    #[serde(rename = "Row", default)]
    rows: Vec<RowDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RowDoc {
    key: String,
    #[serde(rename = "Cell", default)]
    cells: Vec<CellDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CellDoc {
    column: String,
    #[serde(rename = "$")]
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

/// Writes readings through the HBase REST gateway.
#[derive(Debug)]
pub struct HbaseRestStore {
    client: Client,
    config: HbaseRestConfig,
    closed: AtomicBool,
}

impl HbaseRestStore {
    /// Creates a store client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created or the base URL
    /// is empty.
    pub fn new(config: HbaseRestConfig) -> Result<Self, CollaboratorError> {
        if config.base_url.is_empty() {
            return Err(CollaboratorError::InvalidAddress(
                "HBase REST URL is required".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(CollaboratorError::Http)?;
        Ok(Self {
            client,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &HbaseRestConfig {
        &self.config
    }

    /// Reads one row back, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer cannot be decoded.
    pub async fn get_row(&self, row_key: &str) -> Result<Option<Vec<HbaseCell>>, CollaboratorError> {
        let url = self.row_url(&urlencoding::encode(row_key));
        let rows = self.fetch_rows(&url).await?;
        Ok(rows.into_iter().next().map(|(_, cells)| cells))
    }

    /// Reads back every row of a device, using a `<deviceId>_*` row glob.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer cannot be decoded.
    pub async fn scan_device(
        &self,
        device_id: &DeviceId,
    ) -> Result<Vec<(String, Vec<HbaseCell>)>, CollaboratorError> {
        let url = self.row_url(&format!("{}_*", urlencoding::encode(device_id.as_str())));
        self.fetch_rows(&url).await
    }

    fn row_url(&self, encoded_row: &str) -> String {
        format!(
            "{}/{}/{encoded_row}",
            self.config.base_url,
            urlencoding::encode(&self.config.table)
        )
    }

    fn ensure_open(&self) -> Result<(), CollaboratorError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CollaboratorError::Closed("store".to_string()))
        } else {
            Ok(())
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> CollaboratorError {
        if e.is_timeout() {
            CollaboratorError::timeout(self.config.timeout)
        } else {
            CollaboratorError::Http(e)
        }
    }

    async fn fetch_rows(
        &self,
        url: &str,
    ) -> Result<Vec<(String, Vec<HbaseCell>)>, CollaboratorError> {
        self.ensure_open()?;
        tracing::debug!(url = %url, "Reading rows from HBase");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let doc: CellSetDoc = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        doc.rows.into_iter().map(decode_row).collect()
    }
}

#[async_trait]
impl ReadingStore for HbaseRestStore {
    async fn ping(&self) -> Result<(), CollaboratorError> {
        self.ensure_open()?;
        let url = format!(
            "{}/{}/schema",
            self.config.base_url,
            urlencoding::encode(&self.config.table)
        );

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        match response.status() {
            status if status.is_success() => {
                tracing::info!(table = %self.config.table, "HBase connection test successful");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                tracing::warn!(
                    table = %self.config.table,
                    "HBase reachable but table does not exist"
                );
                Ok(())
            }
            status => Err(CollaboratorError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn put(
        &self,
        row_key: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), CollaboratorError> {
        self.ensure_open()?;

        let cells = fields
            .iter()
            .map(|(qualifier, value)| CellDoc {
                column: STANDARD.encode(format!("{}:{qualifier}", self.config.column_family)),
                value: STANDARD.encode(value),
                timestamp: None,
            })
            .collect();
        let body = CellSetDoc {
            rows: vec![RowDoc {
                key: STANDARD.encode(row_key),
                cells,
            }],
        };

        let url = self.row_url(&urlencoding::encode(row_key));
        let response = self
            .client
            .put(&url)
            .header(header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(row_key, "Stored reading in HBase");
            Ok(())
        } else {
            Err(CollaboratorError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.closed.store(true, Ordering::Release);
        tracing::info!("HBase REST store closed");
        Ok(())
    }
}

fn decode_text(encoded: &str) -> Result<String, CollaboratorError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CollaboratorError::Decode(e.to_string()))
}

fn decode_row(row: RowDoc) -> Result<(String, Vec<HbaseCell>), CollaboratorError> {
    let key = decode_text(&row.key)?;
    let cells = row
        .cells
        .into_iter()
        .map(|cell| -> Result<HbaseCell, CollaboratorError> {
            let column = decode_text(&cell.column)?;
            let (family, qualifier) = column
                .split_once(':')
                .map_or((column.as_str(), ""), |(f, q)| (f, q));
            Ok(HbaseCell {
                family: family.to_string(),
                qualifier: qualifier.to_string(),
                value: decode_text(&cell.value)?,
                timestamp: cell.timestamp,
            })
        })
        .collect::<Result<Vec<_>, CollaboratorError>>()?;
    Ok((key, cells))
}
