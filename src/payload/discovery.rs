//! Home Assistant MQTT device discovery.
//!
//! One device-level message on `{prefix}/device/{device_id}/config` describes
//! all five entities. The message is static for the lifetime of the process.
//!
//! Reference: https://www.home-assistant.io/integrations/mqtt/#device-discovery-payload

use super::schema::{self, PLATFORM};
use crate::config::Config;
use crate::mqtt::message::{MqQos, OutboundMessage};
use crate::mqtt::supervisor::{ConnectionSupervisor, PublishError};
use crate::mqtt::transport::Ack;
use serde::{Serialize, Serializer};
use std::time::Duration;
use tracing::{debug, info};

pub const MANUFACTURER: &str = "Bosch";
pub const MODEL: &str = "BME680";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMetadata {
    pub name: String,
    #[serde(rename = "mf")]
    pub manufacturer: String,
    #[serde(rename = "mdl")]
    pub model: String,
    #[serde(rename = "ids")]
    pub unique_ids: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginMetadata {
    pub name: String,
    pub url: String,
    #[serde(rename = "sw")]
    pub software_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDescriptor {
    #[serde(skip)]
    pub key: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "platform")]
    pub platform_kind: String,
    pub device_class: String,
    #[serde(rename = "unit_of_measurement")]
    pub unit: Option<String>,
    #[serde(rename = "suggested_display_precision")]
    pub display_precision: u8,
    #[serde(rename = "value_template", serialize_with = "value_template")]
    pub value_path: String,
    pub unique_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDescriptor {
    pub device: DeviceMetadata,
    pub origin: OriginMetadata,
    #[serde(serialize_with = "components_by_key")]
    pub components: Vec<FieldDescriptor>,
    pub state_topic: String,
}

impl DiscoveryDescriptor {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn value_template<S: Serializer>(path: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{{{{ value_json.{} }}}}", path))
}

fn components_by_key<S: Serializer>(
    components: &[FieldDescriptor],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(components.iter().map(|c| (c.key.as_str(), c)))
}

/// Builds the descriptor from configuration. Deterministic.
pub fn build_descriptor(config: &Config) -> DiscoveryDescriptor {
    let device_id = &config.discovery.device_id;

    let components = schema::advertised()
        .map(|(field, component)| FieldDescriptor {
            key: component.key.to_string(),
            display_name: component.name.to_string(),
            platform_kind: PLATFORM.to_string(),
            device_class: component.device_class.to_string(),
            unit: component.unit.map(str::to_string),
            display_precision: component.precision,
            value_path: field.value_path(),
            unique_id: format!("{}_{}", device_id, component.key),
        })
        .collect();

    DiscoveryDescriptor {
        device: DeviceMetadata {
            name: device_id.to_uppercase(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            unique_ids: format!("{}_{}", MODEL, device_id),
        },
        origin: OriginMetadata {
            name: env!("CARGO_PKG_NAME").to_string(),
            url: config.discovery.origin_url.clone(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        components,
        state_topic: config.bridge.data_topic.clone(),
    }
}

/// Serialized descriptor plus where and how to publish it.
#[derive(Debug, Clone)]
pub struct DiscoveryAnnouncer {
    message: OutboundMessage,
}

impl DiscoveryAnnouncer {
    pub fn new(
        descriptor: &DiscoveryDescriptor,
        topic: impl Into<String>,
        retain: bool,
    ) -> Result<Self, serde_json::Error> {
        let payload = descriptor.to_json()?;
        Ok(Self {
            message: OutboundMessage::new(topic, payload.into_bytes(), MqQos::ExactlyOnce, retain),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, serde_json::Error> {
        Self::new(
            &build_descriptor(config),
            config.discovery_topic(),
            config.discovery.retain,
        )
    }

    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    pub async fn send(
        &self,
        supervisor: &mut ConnectionSupervisor,
        timeout: Duration,
    ) -> Result<Ack, PublishError> {
        debug!("Sending discovery descriptor: {}", self.message);
        let ack = supervisor.publish(&self.message, timeout).await?;
        info!(topic = %self.message.topic, "Discovery descriptor published");
        Ok(ack)
    }
}
