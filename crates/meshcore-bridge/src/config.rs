//! Configuration types for the MeshCore bridge
//!
//! This module provides the configuration handed to the bridge at startup:
//! local mesh identity, broker connection, serial device and reconnect
//! behavior for each link. It is built once and read-only afterwards.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Default root topic on the broker
pub const DEFAULT_ROOT_TOPIC: &str = "meshcore";

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default baud rate for MeshCore serial devices
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default serial read timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Default capacity of the bus → mesh queue
pub const DEFAULT_INBOUND_QUEUE_SIZE: usize = 256;

/// Main configuration for the bridge
///
/// Unknown keys are rejected so a misspelled setting fails at startup
/// instead of silently falling back to its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Local mesh identity
    pub mesh: MeshConfig,

    /// Broker connection
    pub mqtt: MqttConfig,

    /// Serial device
    pub serial: SerialConfig,

    /// Reconnection settings for both links
    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Capacity of the queue between the bus client and the serial writer
    #[serde(default = "default_inbound_queue_size")]
    pub inbound_queue_size: usize,
}

fn default_inbound_queue_size() -> usize {
    DEFAULT_INBOUND_QUEUE_SIZE
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mesh: MeshConfig::default(),
            mqtt: MqttConfig::default(),
            serial: SerialConfig::default(),
            reconnect: ReconnectSettings::default(),
            inbound_queue_size: DEFAULT_INBOUND_QUEUE_SIZE,
        }
    }
}

/// Local mesh identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Identifier this bridge tags its traffic with
    pub id: String,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    /// Broker host name or address
    pub broker: String,

    /// Broker port (default: 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Optional username
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password, only used together with `username`
    #[serde(default)]
    pub password: Option<String>,

    /// Topic prefix shared by all bridges (default: "meshcore")
    #[serde(default = "default_root_topic")]
    pub root_topic: String,

    /// Client identifier (default: "meshcore-bridge-{mesh id}")
    #[serde(default)]
    pub client_id: Option<String>,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_root_topic() -> String {
    DEFAULT_ROOT_TOPIC.to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: String::new(),
            port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            root_topic: default_root_topic(),
            client_id: None,
            keep_alive: default_keep_alive(),
        }
    }
}

/// Serial device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SerialConfig {
    /// Path to serial port (e.g., /dev/ttyUSB0, COM3)
    pub port: PathBuf,

    /// Baud rate (default: 115200). `baud` is accepted as well.
    #[serde(default = "default_baud_rate", alias = "baud")]
    pub baud_rate: u32,

    /// Read timeout handed to the serial driver
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout() -> Duration {
    Duration::from_millis(DEFAULT_TIMEOUT_MS)
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: PathBuf::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: default_timeout(),
        }
    }
}

/// Reconnect settings, one per link
///
/// Keys left out of a link's section keep that link's default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectSettings {
    /// Serial device backoff
    #[serde(
        default = "ReconnectConfig::serial_default",
        deserialize_with = "deserialize_serial_reconnect"
    )]
    pub serial: ReconnectConfig,

    /// Broker backoff
    #[serde(
        default = "ReconnectConfig::bus_default",
        deserialize_with = "deserialize_bus_reconnect"
    )]
    pub bus: ReconnectConfig,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            serial: ReconnectConfig::serial_default(),
            bus: ReconnectConfig::bus_default(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectConfig {
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Ceiling the delay doubles up to
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

/// One link's reconnect section as written in the file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReconnectOverrides {
    #[serde(default, deserialize_with = "humantime_serde::deserialize_option")]
    initial_delay: Option<Duration>,
    #[serde(default, deserialize_with = "humantime_serde::deserialize_option")]
    max_delay: Option<Duration>,
}

impl ReconnectOverrides {
    fn apply(self, base: ReconnectConfig) -> ReconnectConfig {
        ReconnectConfig::new(
            self.initial_delay.unwrap_or(base.initial_delay),
            self.max_delay.unwrap_or(base.max_delay),
        )
    }
}

fn deserialize_serial_reconnect<'de, D>(
    deserializer: D,
) -> std::result::Result<ReconnectConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<ReconnectOverrides>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overrides.apply(ReconnectConfig::serial_default()))
}

fn deserialize_bus_reconnect<'de, D>(
    deserializer: D,
) -> std::result::Result<ReconnectConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<ReconnectOverrides>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overrides.apply(ReconnectConfig::bus_default()))
}

impl ReconnectConfig {
    /// Create a config with explicit bounds
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Serial device default: 1s doubling up to 60s
    pub fn serial_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Broker default: 1s doubling up to 120s
    pub fn bus_default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120))
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::ConfigLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|e| match e {
            BridgeError::ConfigLoad { reason, .. } => BridgeError::ConfigLoad {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| BridgeError::ConfigLoad {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;

        let missing = missing_keys(&value);
        if !missing.is_empty() {
            return Err(BridgeError::MissingConfig(missing.join(", ")));
        }

        let config: BridgeConfig =
            serde_yaml::from_value(value).map_err(|e| BridgeError::ConfigLoad {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let id = &self.mesh.id;
        if id.is_empty() {
            errors.push("mesh.id must not be empty".to_string());
        } else if id.contains(['/', '+', '#']) {
            errors.push(format!("mesh.id '{}' must not contain '/', '+' or '#'", id));
        }

        if self.mqtt.broker.trim().is_empty() {
            errors.push("mqtt.broker must not be empty".to_string());
        }
        let root = &self.mqtt.root_topic;
        if root.is_empty() {
            errors.push("mqtt.root_topic must not be empty".to_string());
        } else if root.contains(['+', '#']) {
            errors.push(format!("mqtt.root_topic '{}' must not contain wildcards", root));
        } else if root.split('/').any(str::is_empty) {
            errors.push(format!(
                "mqtt.root_topic '{}' must not start or end with '/' or contain '//'",
                root
            ));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            errors.push("mqtt.password requires mqtt.username".to_string());
        }

        if self.serial.port.as_os_str().is_empty() {
            errors.push("serial.port must not be empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            errors.push("serial.baud_rate must be positive".to_string());
        }

        for (name, reconnect) in [
            ("serial", &self.reconnect.serial),
            ("bus", &self.reconnect.bus),
        ] {
            if reconnect.initial_delay.is_zero() {
                errors.push(format!("reconnect.{}.initial_delay must be positive", name));
            }
            if reconnect.initial_delay > reconnect.max_delay {
                errors.push(format!(
                    "reconnect.{}.initial_delay exceeds max_delay",
                    name
                ));
            }
        }

        if self.inbound_queue_size == 0 {
            errors.push("inbound_queue_size must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::InvalidConfig(errors.join("; ")))
        }
    }

    /// Topic this bridge publishes local traffic on
    pub fn publish_topic(&self) -> String {
        format!("{}/{}", self.mqtt.root_topic, self.mesh.id)
    }

    /// Filter matching traffic from every mesh
    pub fn subscribe_filter(&self) -> String {
        format!("{}/+", self.mqtt.root_topic)
    }

    /// Client identifier presented to the broker
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("meshcore-bridge-{}", self.mesh.id))
    }
}

fn missing_keys(value: &serde_yaml::Value) -> Vec<&'static str> {
    const REQUIRED: &[(&str, &str, &str)] = &[
        ("mqtt", "broker", "mqtt.broker"),
        ("mesh", "id", "mesh.id"),
        ("serial", "port", "serial.port"),
    ];

    REQUIRED
        .iter()
        .filter(|(section, key, _)| {
            value
                .get(*section)
                .and_then(|s| s.get(*key))
                .map_or(true, serde_yaml::Value::is_null)
        })
        .map(|(_, _, name)| *name)
        .collect()
}

/// Builder for BridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: BridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local mesh id
    pub fn mesh_id(mut self, id: impl Into<String>) -> Self {
        self.config.mesh.id = id.into();
        self
    }

    /// Set broker host and port
    pub fn broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.broker = host.into();
        self.config.mqtt.port = port;
        self
    }

    /// Set broker credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.mqtt.username = Some(username.into());
        self.config.mqtt.password = Some(password.into());
        self
    }

    /// Set the root topic
    pub fn root_topic(mut self, root: impl Into<String>) -> Self {
        self.config.mqtt.root_topic = root.into();
        self
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.serial.port = port.into();
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.serial.port = port.into();
        self.config.serial.baud_rate = baud_rate;
        self
    }

    /// Set serial backoff bounds
    pub fn serial_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect.serial = reconnect;
        self
    }

    /// Set broker backoff bounds
    pub fn bus_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect.bus = reconnect;
        self
    }

    /// Set the bus → mesh queue capacity
    pub fn inbound_queue_size(mut self, size: usize) -> Self {
        self.config.inbound_queue_size = size;
        self
    }

    /// Build the configuration without validating it
    pub fn build(self) -> BridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
