// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identifier type.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a simulated device.
///
/// Devices are keyed by the relational lookup's primary key rendered as a
/// string (e.g. `"13"`). The wrapper keeps device ids from being mixed up with
/// topics or row keys.
///
/// # Examples
///
/// ```
/// use sensim_lib::model::DeviceId;
///
/// let id = DeviceId::new("13");
/// assert_eq!(id.as_str(), "13");
/// assert_eq!(id.row_key(1_700_000_000_000), "13_1700000000000");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the store row key for a reading taken at `timestamp_ms`.
    #[must_use]
    pub fn row_key(&self, timestamp_ms: i64) -> String {
        format!("{}_{timestamp_ms}", self.0)
    }

    /// Returns the key used when publishing readings of this device.
    #[must_use]
    pub fn publish_key(&self) -> String {
        format!("device_{}", self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i64> for DeviceId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_number_and_string_are_equal() {
        assert_eq!(DeviceId::from(7_i64), DeviceId::from("7"));
    }

    #[test]
    fn row_key_joins_with_underscore() {
        let id = DeviceId::new("42");
        assert_eq!(id.row_key(123), "42_123");
    }

    #[test]
    fn publish_key_is_prefixed() {
        assert_eq!(DeviceId::new("42").publish_key(), "device_42");
    }

    #[test]
    fn debug_and_display_format() {
        let id = DeviceId::new("9");
        assert_eq!(format!("{id:?}"), "DeviceId(9)");
        assert_eq!(id.to_string(), "9");
    }

    #[test]
    fn hashable_and_borrowable() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(DeviceId::new("1"));
        assert!(set.contains("1"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&DeviceId::new("5")).unwrap();
        assert_eq!(json, "\"5\"");
    }
}
