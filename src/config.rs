//! # Process Configuration
//!
//! Builds the immutable [`Config`] once at startup. Values are layered:
//!
//! ```text
//! defaults ──► optional TOML file ($BME680_MQTT_CONFIG) ──► environment
//! ```
//!
//! Environment access goes through an injected lookup function so that the
//! rest of the daemon never reads process state directly.

use crate::mqtt::config::MqttConfig;
use serde::Deserialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_FILE_ENV: &str = "BME680_MQTT_CONFIG";

pub const DEFAULT_ORIGIN_URL: &str = "https://github.com/lillian-alicia/bme680-mqtt";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When the discovery descriptor is (re)published.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// At most one announcement attempt per process run.
    #[default]
    Once,
    /// Announce again after every new broker session.
    OnConnect,
}

impl FromStr for DiscoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(DiscoveryMode::Once),
            "on_connect" | "on-connect" | "reconnect" => Ok(DiscoveryMode::OnConnect),
            other => Err(format!("expected 'once' or 'on_connect', got '{}'", other)),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    pub i2c_bus: u8,
    pub i2c_address: u16,
    /// Consecutive sampling failures tolerated before the loop gives up.
    pub failure_limit: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            i2c_address: 0x76,
            failure_limit: 5,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub data_topic: String,
    pub poll_interval_secs: u64,
    pub publish_timeout_secs: u64,
    pub backoff_secs: u64,
    /// Enables exponential backoff capped at this value.
    pub backoff_max_secs: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_topic: "bme680".to_string(),
            poll_interval_secs: 60,
            publish_timeout_secs: 5,
            backoff_secs: 30,
            backoff_max_secs: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub prefix: String,
    pub device_id: String,
    pub retain: bool,
    pub mode: DiscoveryMode,
    pub origin_url: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefix: "homeassistant".to_string(),
            device_id: "bme680".to_string(),
            retain: true,
            mode: DiscoveryMode::Once,
            origin_url: DEFAULT_ORIGIN_URL.to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub sensor: SensorConfig,
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub async fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok()).await
    }

    /// Loads the configuration using `lookup` in place of the environment.
    pub async fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_FILE_ENV) {
            Some(path) => Self::from_toml_file(Path::new(&path)).await?,
            None => {
                debug!("No config file given, starting from defaults");
                Config::default()
            }
        };

        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration file {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlays every recognised environment key onto `self`.
    pub fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bus) = parse_var(lookup, "I2C_BUS")? {
            self.sensor.i2c_bus = bus;
        }
        if let Some(raw) = lookup("I2C_ADDR") {
            self.sensor.i2c_address = parse_i2c_address(&raw)?;
        }
        if let Some(limit) = parse_var(lookup, "SENSOR_FAILURE_LIMIT")? {
            self.sensor.failure_limit = limit;
        }

        if let Some(host) = lookup("MQTT_ADDR") {
            self.mqtt.host = host;
        }
        if let Some(port) = parse_var(lookup, "MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(client_id);
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(timeout) = parse_var(lookup, "MQTT_CONNECT_TIMEOUT")? {
            self.mqtt.connect_timeout_secs = timeout;
        }

        if let Some(topic) = lookup("MQTT_TOPIC") {
            self.bridge.data_topic = topic;
        }
        if let Some(poll) = parse_var(lookup, "POLL_TIME")? {
            self.bridge.poll_interval_secs = poll;
        }
        if let Some(timeout) = parse_var(lookup, "PUBLISH_TIMEOUT")? {
            self.bridge.publish_timeout_secs = timeout;
        }
        if let Some(backoff) = parse_var(lookup, "BACKOFF_TIME")? {
            self.bridge.backoff_secs = backoff;
        }
        if let Some(max) = parse_var(lookup, "BACKOFF_MAX")? {
            self.bridge.backoff_max_secs = Some(max);
        }

        if let Some(prefix) = lookup("DISCOVERY_PREFIX") {
            self.discovery.prefix = prefix;
        }
        if let Some(device_id) = lookup("DISCOVERY_DEVICE_ID") {
            self.discovery.device_id = device_id;
        }
        if let Some(raw) = lookup("DISCOVERY_RETAIN") {
            self.discovery.retain = parse_bool("DISCOVERY_RETAIN", &raw)?;
        }
        if let Some(mode) = parse_var(lookup, "DISCOVERY_MODE")? {
            self.discovery.mode = mode;
        }
        if let Some(url) = lookup("DISCOVERY_ORIGIN_URL") {
            self.discovery.origin_url = url;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.device_id.trim().is_empty() {
            return Err(ConfigError::Invalid("device id must not be empty".into()));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker address must not be empty".into()));
        }
        if self.bridge.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll interval must be at least 1s".into()));
        }
        if self.bridge.publish_timeout_secs == 0 {
            return Err(ConfigError::Invalid("publish timeout must be at least 1s".into()));
        }
        if self.bridge.backoff_secs == 0 {
            return Err(ConfigError::Invalid("backoff interval must be at least 1s".into()));
        }
        if let Some(max) = self.bridge.backoff_max_secs {
            if max < self.bridge.backoff_secs {
                return Err(ConfigError::Invalid(format!(
                    "backoff maximum ({}s) is below the backoff interval ({}s)",
                    max, self.bridge.backoff_secs
                )));
            }
        }
        validate_topic("data topic", &self.bridge.data_topic)?;
        validate_topic("discovery topic", &self.discovery_topic())?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.poll_interval_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.publish_timeout_secs)
    }

    /// `{prefix}/device/{device_id}/config`
    pub fn discovery_topic(&self) -> String {
        format!(
            "{}/device/{}/config",
            self.discovery.prefix, self.discovery.device_id
        )
    }

    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("bme680-{}", self.discovery.device_id))
    }
}

fn validate_topic(what: &str, topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", what)));
    }
    if topic.contains(['+', '#']) {
        return Err(ConfigError::Invalid(format!(
            "{} '{}' contains MQTT wildcards",
            what, topic
        )));
    }
    Ok(())
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Accepts decimal (`118`) and hexadecimal (`0x76`) addresses.
fn parse_i2c_address(raw: &str) -> Result<u16, ConfigError> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };

    parsed.map_err(|e| ConfigError::InvalidValue {
        key: "I2C_ADDR",
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mqtt_handler::keep_alive_for;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[tokio::test]
    async fn defaults_match_reference_deployment() {
        let config = Config::load_with(|_| None).await.unwrap();

        assert_eq!(config.sensor.i2c_address, 0x76);
        assert_eq!(config.mqtt.endpoint(), "127.0.0.1:1883");
        assert_eq!(config.bridge.data_topic, "bme680");
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.bridge.backoff_secs, 30);
        assert_eq!(config.discovery_topic(), "homeassistant/device/bme680/config");
        assert_eq!(config.client_id(), "bme680-bme680");
        assert!(config.discovery.retain);
        assert_eq!(config.discovery.mode, DiscoveryMode::Once);
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let lookup = lookup_from(&[
            ("I2C_ADDR", "0x77"),
            ("MQTT_ADDR", "broker.lan"),
            ("MQTT_PORT", "8883"),
            ("MQTT_TOPIC", "garage/climate"),
            ("POLL_TIME", "15"),
            ("DISCOVERY_PREFIX", "ha"),
            ("DISCOVERY_DEVICE_ID", "garage"),
            ("DISCOVERY_RETAIN", "no"),
            ("DISCOVERY_MODE", "on_connect"),
        ]);

        let config = Config::load_with(lookup).await.unwrap();

        assert_eq!(config.sensor.i2c_address, 0x77);
        assert_eq!(config.mqtt.endpoint(), "broker.lan:8883");
        assert_eq!(config.bridge.data_topic, "garage/climate");
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.discovery_topic(), "ha/device/garage/config");
        assert!(!config.discovery.retain);
        assert_eq!(config.discovery.mode, DiscoveryMode::OnConnect);
    }

    #[test]
    fn decimal_i2c_address_is_accepted() {
        assert_eq!(parse_i2c_address("118").unwrap(), 0x76);
        assert!(parse_i2c_address("0xZZ").is_err());
    }

    #[tokio::test]
    async fn malformed_number_names_the_key() {
        let err = Config::load_with(lookup_from(&[("MQTT_PORT", "eighteen")]))
            .await
            .unwrap_err();

        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "MQTT_PORT");
                assert_eq!(value, "eighteen");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_poll_interval_is_rejected() {
        let err = Config::load_with(lookup_from(&[("POLL_TIME", "0")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn largest_poll_interval_keeps_keep_alive_in_range() {
        let config = Config::load_with(lookup_from(&[("POLL_TIME", "18446744073709551615")]))
            .await
            .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_secs(u64::MAX));
        assert_eq!(
            keep_alive_for(config.poll_interval(), Duration::from_secs(config.bridge.backoff_secs)),
            Duration::from_secs(u16::MAX as u64)
        );
    }

    #[tokio::test]
    async fn wildcard_topic_is_rejected() {
        let err = Config::load_with(lookup_from(&[("MQTT_TOPIC", "sensors/#")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn backoff_max_below_backoff_is_rejected() {
        let err = Config::load_with(lookup_from(&[("BACKOFF_TIME", "30"), ("BACKOFF_MAX", "10")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn toml_sections_fill_in_over_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sensor]
            i2c_address = 0x77

            [mqtt]
            host = "10.0.0.2"
            username = "sensor"

            [bridge]
            poll_interval_secs = 120
            backoff_max_secs = 300

            [discovery]
            mode = "on_connect"
            "#,
        )
        .unwrap();

        assert_eq!(config.sensor.i2c_address, 0x77);
        assert_eq!(config.sensor.i2c_bus, 1);
        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.username.as_deref(), Some("sensor"));
        assert_eq!(config.bridge.poll_interval_secs, 120);
        assert_eq!(config.bridge.backoff_max_secs, Some(300));
        assert_eq!(config.discovery.mode, DiscoveryMode::OnConnect);
    }

    #[test]
    fn environment_wins_over_file() {
        let mut config: Config = toml::from_str("[bridge]\ndata_topic = \"from-file\"\n").unwrap();
        config
            .apply_env(&lookup_from(&[("MQTT_TOPIC", "from-env")]))
            .unwrap();
        assert_eq!(config.bridge.data_topic, "from-env");
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[bridge]\npoll = 5\n");
        assert!(parsed.is_err());
    }
}
