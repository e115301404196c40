// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control messages popped from device-type topics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;
use crate::model::DeviceId;

/// Requested state of a device's reading stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Start, or restart, the stream.
    Start,
    /// Stop the stream.
    Stop,
}

impl DesiredState {
    /// Maps the wire state code: `1` starts, anything else stops.
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        if code == 1 { Self::Start } else { Self::Stop }
    }

    /// Returns the wire state code.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Start => 1,
            Self::Stop => 0,
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// A decoded control message.
///
/// The queue carries either a bare object `{"deviceId": .., "state": ..}` or
/// a two-element array `[className, object]` produced by typed serializers.
///
/// # Examples
///
/// ```
/// use sensim_lib::event::{ControlEvent, DesiredState};
///
/// let event = ControlEvent::decode(r#"{"deviceId": 13, "state": 1}"#)?.unwrap();
/// assert_eq!(event.device_id().as_str(), "13");
/// assert_eq!(event.state(), DesiredState::Start);
///
/// let wrapped = r#"["com.example.DeviceState", {"deviceId": "7", "state": 0}]"#;
/// let event = ControlEvent::decode(wrapped)?.unwrap();
/// assert_eq!(event.state(), DesiredState::Stop);
/// # Ok::<(), sensim_lib::ParseError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    device_id: DeviceId,
    state: DesiredState,
}

impl ControlEvent {
    /// Creates a control event.
    #[must_use]
    pub fn new(device_id: impl Into<DeviceId>, state: DesiredState) -> Self {
        Self {
            device_id: device_id.into(),
            state,
        }
    }

    /// Decodes a control message.
    ///
    /// Returns `Ok(None)` for well-formed JSON that is not a control message
    /// (either key absent).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Json`] if the text is not JSON.
    pub fn decode(text: &str) -> Result<Option<Self>, ParseError> {
        let document: Value = serde_json::from_str(text)?;

        let body = match &document {
            Value::Array(items) if items.len() >= 2 => &items[1],
            other => other,
        };

        let (Some(device_id), Some(state)) = (body.get("deviceId"), body.get("state")) else {
            return Ok(None);
        };

        let device_id = match device_id {
            Value::String(s) => DeviceId::new(s.as_str()),
            Value::Number(n) => DeviceId::new(n.to_string()),
            _ => return Ok(None),
        };

        Ok(Some(Self {
            device_id,
            state: DesiredState::from_code(state_code(state)),
        }))
    }

    /// Returns the target device.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the requested state.
    #[must_use]
    pub fn state(&self) -> DesiredState {
        self.state
    }

    /// Splits the event into its parts.
    #[must_use]
    pub fn into_parts(self) -> (DeviceId, DesiredState) {
        (self.device_id, self.state)
    }
}

/// Lenient integer coercion of the `state` field.
#[allow(clippy::cast_possible_truncation)]
fn state_code(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}
