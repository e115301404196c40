// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `sensim` library.
//!
//! This module provides the error hierarchy used across the library:
//! collaborator transport failures, template and message parsing, and
//! configuration loading.

use thiserror::Error;

use crate::backend::CollaboratorKind;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// An external collaborator call failed.
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// A message, template, or range could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A collaborator failed its connectivity check during startup.
    #[error("{collaborator} connectivity check failed: {source}")]
    Connectivity {
        /// The collaborator that could not be reached.
        collaborator: CollaboratorKind,
        /// The underlying failure.
        #[source]
        source: CollaboratorError,
    },

    /// The supervisor was started twice.
    #[error("supervisor is already started")]
    AlreadyStarted,

    /// The supervisor has not been started yet.
    #[error("supervisor is not started")]
    NotStarted,

    /// The component is shutting down and refuses new work.
    #[error("shutting down")]
    ShuttingDown,
}

/// Errors raised by the relational lookup, queue, store, and publisher.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// HTTP request failed.
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// MQTT client failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Redis command failed.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// SQL query failed.
    #[cfg(feature = "mysql")]
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Kafka producer failed.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Connection to the collaborator failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Call timed out.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Invalid URL or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The collaborator answered with a non-success status.
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        /// Status code reported by the collaborator.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The collaborator has been closed.
    #[error("closed: {0}")]
    Closed(String),

    /// The collaborator returned data that could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl CollaboratorError {
    /// Builds a timeout error from a duration.
    #[must_use]
    pub fn timeout(after: std::time::Duration) -> Self {
        Self::Timeout(u64::try_from(after.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Errors related to parsing control messages, templates, and ranges.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Expected field is missing.
    #[error("missing field: {0}")]
    MissingField(String),

    /// Unexpected document shape.
    #[error("unexpected format: {0}")]
    UnexpectedFormat(String),

    /// A range descriptor could not be interpreted.
    #[error("invalid range {range:?}: {message}")]
    InvalidRange {
        /// The offending range text.
        range: String,
        /// Description of the failure.
        message: String,
    },
}

/// Errors related to configuration loading.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing configuration key: {0}")]
    Missing(String),

    /// A key is present but its value cannot be used.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// The configuration key.
        key: String,
        /// Description of the problem.
        message: String,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn invalid_range_display() {
        let err = ParseError::InvalidRange {
            range: "a~b".to_string(),
            message: "not a number".to_string(),
        };
        assert_eq!(err.to_string(), "invalid range \"a~b\": not a number");
    }

    #[test]
    fn error_from_collaborator_error() {
        let err: Error = CollaboratorError::Closed("queue".to_string()).into();
        assert!(matches!(err, Error::Collaborator(CollaboratorError::Closed(_))));
    }

    #[test]
    fn connectivity_display_names_collaborator() {
        let err = Error::Connectivity {
            collaborator: CollaboratorKind::Store,
            source: CollaboratorError::ConnectionFailed("refused".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "store connectivity check failed: connection failed: refused"
        );
    }

    #[test]
    fn timeout_from_duration() {
        let err = CollaboratorError::timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "request timed out after 1500 ms");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::Invalid {
            key: "app.consumer.threads".to_string(),
            message: "expected an integer".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for app.consumer.threads: expected an integer"
        );
    }
}
