// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composition of readings from device-type templates.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::model::DeviceInfo;

use super::range::{fallback_value, synthesize_with};

/// Attributes of the `air_component` type.
const AIR_COMPONENT: &[&str] = &["co2", "o2", "pm25"];
/// Attributes of the `soil_npk` type.
const SOIL_NPK: &[&str] = &["nitrogen", "phosphorus", "potassium"];
/// Attributes of the `soil_trace_elements` type.
const SOIL_TRACE_ELEMENTS: &[&str] = &["iron", "zinc", "copper", "manganese"];

/// A synthesized reading set: `{<typeName>: {<field>: <value>, ...}}`.
pub type ReadingSet = Map<String, Value>;

/// How a device type's reading is composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    /// One `value` field drawn from the type node's `range`.
    Scalar,
    /// One `<attr>_value` field per named attribute.
    Composite(&'static [&'static str]),
    /// Unknown type: `range` if declared, otherwise a uniform value.
    Generic,
}

impl ReadingKind {
    /// Classifies a type name (case-insensitive).
    #[must_use]
    pub fn for_type(type_name: &str) -> Self {
        match type_name.to_ascii_lowercase().as_str() {
            "temperature" | "humidity" | "soil_ph" | "wind_speed" | "wind_direction"
            | "light_intensity" => Self::Scalar,
            "air_component" => Self::Composite(AIR_COMPONENT),
            "soil_npk" => Self::Composite(SOIL_NPK),
            "soil_trace_elements" => Self::Composite(SOIL_TRACE_ELEMENTS),
            _ => Self::Generic,
        }
    }
}

/// Message published for each reading.
///
/// Serialized as `{"deviceId", "deviceType", "timestamp", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMessage {
    /// Device the reading belongs to.
    pub device_id: String,
    /// Device type name.
    pub device_type: String,
    /// Reading time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The reading set.
    pub data: ReadingSet,
}

/// A reading ready to be stored and published.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    row_key: String,
    store_fields: HashMap<String, String>,
    message: ReadingMessage,
    payload: String,
}

impl Reading {
    /// Returns the store row key (`<deviceId>_<timestampMillis>`).
    #[must_use]
    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    /// Returns the store fields: one field named after the type, holding the
    /// serialized reading set.
    #[must_use]
    pub fn store_fields(&self) -> &HashMap<String, String> {
        &self.store_fields
    }

    /// Returns the publish envelope.
    #[must_use]
    pub fn message(&self) -> &ReadingMessage {
        &self.message
    }

    /// Returns the serialized publish envelope.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Builds readings from device-type templates.
///
/// Templates are free-form JSON. The builder looks up the node named after
/// the device type and composes the reading according to [`ReadingKind`],
/// degrading to defaults instead of rejecting unknown shapes.
///
/// # Examples
///
/// ```
/// use sensim_lib::model::DeviceInfo;
/// use sensim_lib::template::ReadingBuilder;
/// use serde_json::json;
///
/// let info = DeviceInfo::new("13", "probe", "temperature")
///     .with_template(json!({"temperature": {"range": "-10~40"}}));
/// let reading = ReadingBuilder::build(&info, 1_700_000_000_000)?;
///
/// assert_eq!(reading.row_key(), "13_1700000000000");
/// let value = reading.message().data["temperature"]["value"].as_f64().unwrap();
/// assert!((-10.0..=40.0).contains(&value));
/// # Ok::<(), sensim_lib::ParseError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingBuilder;

impl ReadingBuilder {
    /// Composes the reading set for a type using the thread-local generator.
    #[must_use]
    pub fn compose(type_name: &str, template: &Value) -> ReadingSet {
        Self::compose_with(type_name, template, &mut rand::rng())
    }

    /// Composes the reading set for a type.
    ///
    /// - A template that is not a JSON object yields `{type: {value: uniform}}`.
    /// - A template without a node for the type yields an empty set.
    pub fn compose_with<R: Rng + ?Sized>(
        type_name: &str,
        template: &Value,
        rng: &mut R,
    ) -> ReadingSet {
        let mut data = ReadingSet::new();

        let Some(root) = template.as_object() else {
            tracing::warn!(
                type_name,
                "Template is not a JSON object, using default reading"
            );
            let mut fields = Map::new();
            fields.insert("value".to_string(), Value::from(fallback_value(rng)));
            data.insert(type_name.to_string(), Value::Object(fields));
            return data;
        };

        let Some(type_node) = root.get(type_name) else {
            tracing::warn!(type_name, "No template found for device type");
            return data;
        };

        let mut fields = Map::new();
        match ReadingKind::for_type(type_name) {
            ReadingKind::Scalar => {
                let value = synthesize_with(type_node.get("range"), rng);
                fields.insert("value".to_string(), Value::from(value));
            }
            ReadingKind::Composite(attributes) => {
                for attribute in attributes {
                    let node = type_node.get(*attribute).or_else(|| root.get(*attribute));
                    if let Some(node) = node {
                        let value = synthesize_with(node.get("range"), rng);
                        fields.insert(format!("{attribute}_value"), Value::from(value));
                    }
                }
            }
            ReadingKind::Generic => {
                let value = match type_node.get("range") {
                    Some(range) => synthesize_with(Some(range), rng),
                    None => fallback_value(rng),
                };
                fields.insert("value".to_string(), Value::from(value));
            }
        }

        data.insert(type_name.to_string(), Value::Object(fields));
        data
    }

    /// Builds the stored and published forms of one reading.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Json`] if the reading cannot be serialized.
    pub fn build(info: &DeviceInfo, timestamp_ms: i64) -> Result<Reading, ParseError> {
        let data = Self::compose(info.type_name(), info.template());
        Self::assemble(info, timestamp_ms, data)
    }

    /// Like [`build`](Self::build) with an explicit generator.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Json`] if the reading cannot be serialized.
    pub fn build_with<R: Rng + ?Sized>(
        info: &DeviceInfo,
        timestamp_ms: i64,
        rng: &mut R,
    ) -> Result<Reading, ParseError> {
        let data = Self::compose_with(info.type_name(), info.template(), rng);
        Self::assemble(info, timestamp_ms, data)
    }

    fn assemble(
        info: &DeviceInfo,
        timestamp_ms: i64,
        data: ReadingSet,
    ) -> Result<Reading, ParseError> {
        let mut store_fields = HashMap::with_capacity(1);
        store_fields.insert(info.type_name().to_string(), serde_json::to_string(&data)?);

        let message = ReadingMessage {
            device_id: info.device_id().to_string(),
            device_type: info.type_name().to_string(),
            timestamp: timestamp_ms,
            data,
        };
        let payload = serde_json::to_string(&message)?;

        Ok(Reading {
            row_key: info.device_id().row_key(timestamp_ms),
            store_fields,
            message,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn classifies_known_types() {
        assert_eq!(ReadingKind::for_type("temperature"), ReadingKind::Scalar);
        assert_eq!(ReadingKind::for_type("Wind_Speed"), ReadingKind::Scalar);
        assert_eq!(
            ReadingKind::for_type("soil_npk"),
            ReadingKind::Composite(SOIL_NPK)
        );
        assert_eq!(ReadingKind::for_type("rainfall"), ReadingKind::Generic);
    }

    #[test]
    fn scalar_type_draws_from_range() {
        let template = json!({"humidity": {"range": "20~90"}});
        let data = ReadingBuilder::compose_with("humidity", &template, &mut rng());

        let value = data["humidity"]["value"].as_f64().unwrap();
        assert!((20.0..=90.0).contains(&value));
        assert_eq!(data["humidity"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn composite_type_reads_attributes_from_type_node() {
        let template = json!({
            "soil_npk": {
                "nitrogen": {"range": "10~20"},
                "phosphorus": {"range": "5"},
                "potassium": {"range": "100~300"}
            }
        });
        let data = ReadingBuilder::compose_with("soil_npk", &template, &mut rng());
        let fields = data["soil_npk"].as_object().unwrap();

        assert_eq!(fields.len(), 3);
        assert!((10.0..=20.0).contains(&fields["nitrogen_value"].as_f64().unwrap()));
        assert_eq!(fields["phosphorus_value"].as_f64(), Some(5.0));
        assert!((100.0..=300.0).contains(&fields["potassium_value"].as_f64().unwrap()));
    }

    #[test]
    fn composite_type_falls_back_to_root_attributes() {
        let template = json!({
            "air_component": {},
            "co2": {"range": "400~800"},
            "pm25": {"range": "0~75"}
        });
        let data = ReadingBuilder::compose_with("air_component", &template, &mut rng());
        let fields = data["air_component"].as_object().unwrap();

        assert!(fields.contains_key("co2_value"));
        assert!(fields.contains_key("pm25_value"));
        assert!(!fields.contains_key("o2_value"));
    }

    #[test]
    fn generic_type_without_range_is_uniform() {
        let template = json!({"rainfall": {"unit": "mm"}});
        let data = ReadingBuilder::compose_with("rainfall", &template, &mut rng());

        let value = data["rainfall"]["value"].as_f64().unwrap();
        assert!((0.0..100.0).contains(&value));
    }

    #[test]
    fn generic_type_with_range_uses_it() {
        let template = json!({"rainfall": {"range": "250"}});
        let data = ReadingBuilder::compose_with("rainfall", &template, &mut rng());
        assert_eq!(data["rainfall"]["value"].as_f64(), Some(250.0));
    }

    #[test]
    fn missing_type_node_yields_empty_set() {
        let template = json!({"humidity": {"range": "20~90"}});
        let data = ReadingBuilder::compose_with("temperature", &template, &mut rng());
        assert!(data.is_empty());
    }

    #[test]
    fn non_object_template_yields_default_reading() {
        let data = ReadingBuilder::compose_with("temperature", &Value::Null, &mut rng());
        let value = data["temperature"]["value"].as_f64().unwrap();
        assert!((0.0..100.0).contains(&value));
    }

    #[test]
    fn build_produces_row_key_fields_and_envelope() {
        let info = DeviceInfo::new("13", "probe", "temperature")
            .with_template(json!({"temperature": {"range": "-10~40"}}));
        let reading = ReadingBuilder::build_with(&info, 1000, &mut rng()).unwrap();

        assert_eq!(reading.row_key(), "13_1000");

        let stored = &reading.store_fields()["temperature"];
        let stored: Value = serde_json::from_str(stored).unwrap();
        assert_eq!(stored, Value::Object(reading.message().data.clone()));

        let payload: Value = serde_json::from_str(reading.payload()).unwrap();
        assert_eq!(payload["deviceId"], "13");
        assert_eq!(payload["deviceType"], "temperature");
        assert_eq!(payload["timestamp"], 1000);
        assert!(payload["data"]["temperature"]["value"].is_number());
    }
}
