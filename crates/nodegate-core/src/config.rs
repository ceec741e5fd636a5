//! Gateway configuration.
//!
//! Loaded from a TOML file (every field has a default) and then overridden by
//! `NODEGATE_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default broker settings.
pub mod defaults {
    pub const MQTT_HOST: &str = "127.0.0.1";
    pub const MQTT_PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    /// Depth of each per-device inbound queue.
    pub const LANE_CAPACITY: usize = 64;
    /// Seconds a device lane may sit empty before it is closed.
    pub const LANE_IDLE_SECS: u64 = 30;
}

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "NODEGATE_MQTT_HOST";
    pub const MQTT_PORT: &str = "NODEGATE_MQTT_PORT";
    pub const MQTT_CLIENT_ID: &str = "NODEGATE_MQTT_CLIENT_ID";
    pub const MQTT_USERNAME: &str = "NODEGATE_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "NODEGATE_MQTT_PASSWORD";
    pub const TOPIC_PREFIX: &str = "NODEGATE_TOPIC_PREFIX";
    pub const SCHEMA_DIR: &str = "NODEGATE_SCHEMA_DIR";
    pub const SCHEMA_STORE: &str = "NODEGATE_SCHEMA_STORE";
    pub const DEFAULT_DEVICE_TYPE: &str = "NODEGATE_DEFAULT_DEVICE_TYPE";
    pub const ACCEPT_DECLARED_CHANNELS: &str = "NODEGATE_ACCEPT_DECLARED_CHANNELS";
    /// Set to `true` for JSON log lines.
    pub const LOG_JSON: &str = "NODEGATE_LOG_JSON";
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Generated per process when absent.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: defaults::MQTT_HOST.to_string(),
            port: defaults::MQTT_PORT,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
        }
    }
}

impl MqttSettings {
    /// Client id to present to the broker.
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("nodegate-{}", uuid::Uuid::new_v4()))
    }
}

/// Topic layout settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    /// Optional root segment placed before `up/` and `down/`.
    pub prefix: Option<String>,
}

/// Where device schemas come from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    /// Directory of `*.json` schema documents loaded at startup.
    pub dir: Option<PathBuf>,
    /// redb schema store.
    pub store_path: Option<PathBuf>,
}

/// Provisioning settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    /// Device type used when a request does not name one.
    pub default_device_type: Option<String>,
    /// Build a schema from the channels a device declares in its request
    /// when no published schema exists for its type.
    pub accept_declared_channels: bool,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            default_device_type: None,
            accept_declared_channels: true,
        }
    }
}

/// Gateway runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub lane_capacity: usize,
    pub lane_idle_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            lane_capacity: defaults::LANE_CAPACITY,
            lane_idle_secs: defaults::LANE_IDLE_SECS,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub mqtt: MqttSettings,
    pub topics: TopicSettings,
    pub schemas: SchemaSettings,
    pub provisioning: ProvisioningSettings,
    pub gateway: RuntimeSettings,
}

impl GatewayConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Load from an optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(env_vars::MQTT_HOST) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup(env_vars::MQTT_PORT) {
            self.mqtt.port = port
                .parse()
                .map_err(|_| Error::Config(format!("{} is not a port: {}", env_vars::MQTT_PORT, port)))?;
        }
        if let Some(id) = lookup(env_vars::MQTT_CLIENT_ID) {
            self.mqtt.client_id = Some(id);
        }
        if let Some(user) = lookup(env_vars::MQTT_USERNAME) {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = lookup(env_vars::MQTT_PASSWORD) {
            self.mqtt.password = Some(pass);
        }
        if let Some(prefix) = lookup(env_vars::TOPIC_PREFIX) {
            self.topics.prefix = Some(prefix);
        }
        if let Some(dir) = lookup(env_vars::SCHEMA_DIR) {
            self.schemas.dir = Some(PathBuf::from(dir));
        }
        if let Some(store) = lookup(env_vars::SCHEMA_STORE) {
            self.schemas.store_path = Some(PathBuf::from(store));
        }
        if let Some(device_type) = lookup(env_vars::DEFAULT_DEVICE_TYPE) {
            self.provisioning.default_device_type = Some(device_type);
        }
        if let Some(accept) = lookup(env_vars::ACCEPT_DECLARED_CHANNELS) {
            self.provisioning.accept_declared_channels = accept.parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be true or false: {}",
                    env_vars::ACCEPT_DECLARED_CHANNELS,
                    accept
                ))
            })?;
        }
        self.validate()
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(Error::Config("mqtt.host must not be empty".to_string()));
        }
        if self.gateway.lane_capacity == 0 {
            return Err(Error::Config("gateway.lane_capacity must be positive".to_string()));
        }
        if self.gateway.lane_idle_secs == 0 {
            return Err(Error::Config("gateway.lane_idle_secs must be positive".to_string()));
        }
        if let Some(prefix) = &self.topics.prefix {
            if prefix.is_empty() || prefix.contains(['+', '#']) {
                return Err(Error::Config(format!("invalid topic prefix: {:?}", prefix)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.gateway.lane_capacity, defaults::LANE_CAPACITY);
        assert!(config.topics.prefix.is_none());
        assert!(config.provisioning.accept_declared_channels);
    }

    #[test]
    fn test_partial_toml() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [mqtt]
            port = 8883

            [provisioning]
            default_device_type = "AC"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.provisioning.default_device_type.as_deref(), Some("AC"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::MQTT_HOST, "broker.local"),
            (env_vars::MQTT_PORT, "1884"),
            (env_vars::TOPIC_PREFIX, "site-a"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.topics.prefix.as_deref(), Some("site-a"));
    }

    #[test]
    fn test_declared_channels_switch() {
        let config = GatewayConfig::from_toml_str(
            "[provisioning]\naccept_declared_channels = false\n",
        )
        .unwrap();
        assert!(!config.provisioning.accept_declared_channels);

        let mut config = GatewayConfig::default();
        let err = config
            .apply_overrides(|k| (k == env_vars::ACCEPT_DECLARED_CHANNELS).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_overrides(|k| (k == env_vars::MQTT_PORT).then(|| "abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_wildcard_prefix_rejected() {
        let result = GatewayConfig::from_toml_str("[topics]\nprefix = \"a/+\"\n");
        assert!(result.is_err());
    }
}
