//! Reading formatter: turns one raw sensor sample into the state payload.

use super::schema::PAYLOAD_FIELDS;
use crate::sensor::RawSample;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FormatError {
    #[error("Sample field '{field}' is not a finite number ({value})")]
    NonFinite { field: &'static str, value: f64 },
}

/// A validated measurement. Fahrenheit is always derived from celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_celsius: f64,
    pub temperature_fahrenheit: f64,
    pub pressure_hpa: f64,
    pub humidity_percent: f64,
    pub gas_resistance_ohms: f64,
}

impl Reading {
    pub fn from_sample(sample: &RawSample) -> Result<Self, FormatError> {
        let temperature_celsius = finite("temperature", sample.temperature)?;
        Ok(Self {
            temperature_celsius,
            temperature_fahrenheit: celsius_to_fahrenheit(temperature_celsius),
            pressure_hpa: finite("pressure", sample.pressure)?,
            humidity_percent: finite("humidity", sample.humidity)?,
            gas_resistance_ohms: finite("gas_resistance", sample.gas_resistance)?,
        })
    }
}

pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

fn finite(field: &'static str, value: f64) -> Result<f64, FormatError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormatError::NonFinite { field, value })
    }
}

/// Formatted state payload together with the reading it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedReading {
    reading: Reading,
    payload: Map<String, Value>,
}

impl SerializedReading {
    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    /// Looks up `payload[group][member]`.
    pub fn value(&self, group: &str, member: &str) -> Option<&Value> {
        self.payload.get(group)?.get(member)
    }

    /// Dotted paths of every leaf, in wire order.
    pub fn leaf_paths(&self) -> Vec<String> {
        self.payload
            .iter()
            .flat_map(|(group, members)| {
                members
                    .as_object()
                    .into_iter()
                    .flat_map(|m| m.keys())
                    .map(move |member| format!("{}.{}", group, member))
            })
            .collect()
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.payload.clone()).to_string()
    }
}

/// Formats a raw sample. Pure: equal samples give equal payloads.
pub fn format(sample: &RawSample) -> Result<SerializedReading, FormatError> {
    let reading = Reading::from_sample(sample)?;

    let mut payload = Map::new();
    for field in PAYLOAD_FIELDS.iter() {
        let group = payload
            .entry(field.group)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(members) = group {
            members.insert(field.member.to_string(), (field.value)(&reading));
        }
    }

    Ok(SerializedReading { reading, payload })
}
