// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device snapshot returned by the relational lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DeviceId;

/// Immutable description of one device and its type template.
///
/// A fresh `DeviceInfo` is fetched each time a device's stream is (re)started;
/// the running task keeps it as its snapshot for every tick.
///
/// # Examples
///
/// ```
/// use sensim_lib::model::DeviceInfo;
/// use serde_json::json;
///
/// let info = DeviceInfo::new("13", "Greenhouse probe", "temperature")
///     .with_template(json!({"temperature": {"range": "-10~40"}}));
/// assert_eq!(info.type_name(), "temperature");
/// assert!(info.template().get("temperature").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    device_id: DeviceId,
    device_name: String,
    type_name: String,
    template: Value,
}

impl DeviceInfo {
    /// Creates a device snapshot with a null template.
    #[must_use]
    pub fn new(
        device_id: impl Into<DeviceId>,
        device_name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            type_name: type_name.into(),
            template: Value::Null,
        }
    }

    /// Sets the type template document.
    #[must_use]
    pub fn with_template(mut self, template: Value) -> Self {
        self.template = template;
        self
    }

    /// Sets the type template from its stored text.
    ///
    /// Text that is not valid JSON is logged and replaced by a null template.
    #[must_use]
    pub fn with_template_text(mut self, text: Option<&str>) -> Self {
        self.template = match text {
            None => Value::Null,
            Some(text) => serde_json::from_str(text).unwrap_or_else(|e| {
                tracing::warn!(
                    device_id = %self.device_id,
                    error = %e,
                    "Template is not valid JSON"
                );
                Value::Null
            }),
        };
        self
    }

    /// Returns the device id.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the human readable device name.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Returns the device type name, which is also the control topic.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the type template document.
    #[must_use]
    pub fn template(&self) -> &Value {
        &self.template
    }
}
