//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `switchyard.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use serde::Deserialize;

use switchyard_adapter_broker_memory::BrokerConfig;
use switchyard_adapter_mqtt::MqttConfig;
use switchyard_app::config::{BridgeConfig, BusConfig};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event aggregator and query settings.
    pub bus: BusConfig,
    /// Device message broker bridge settings.
    pub bridge: BridgeConfig,
    /// Embedded broker settings.
    pub broker: BrokerConfig,
    /// External MQTT broker settings.
    pub mqtt: MqttConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Integration toggles.
    pub integrations: IntegrationsConfig,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Per-integration toggles.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    /// Relay device messages to and from an external MQTT broker.
    pub mqtt_enabled: bool,
}

impl Config {
    /// Load configuration from `switchyard.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or if the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("switchyard.toml")?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("SWITCHYARD_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("SWITCHYARD_MQTT_HOST") {
            self.mqtt.broker_host = val;
        }
        if let Some(port) = var("SWITCHYARD_MQTT_PORT").and_then(|val| val.parse().ok()) {
            self.mqtt.broker_port = port;
        }
        if let Some(enabled) = var("SWITCHYARD_MQTT_ENABLED").and_then(|val| val.parse().ok()) {
            self.integrations.mqtt_enabled = enabled;
        }
        if let Some(timeout) = var("SWITCHYARD_QUERY_TIMEOUT_MS").and_then(|val| val.parse().ok()) {
            self.bus.query_timeout_ms = timeout;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.query_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "bus.query_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.bus.result_check_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "bus.result_check_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.bus.response_buffer == Some(0) {
            return Err(ConfigError::Validation("bus.response_buffer must be non-zero".to_string()));
        }
        if self.broker.ack_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "broker.ack_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.bridge.loopback_client_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bridge.loopback_client_id must not be empty".to_string(),
            ));
        }
        if self.integrations.mqtt_enabled {
            self.mqtt
                .validate()
                .map_err(|err| ConfigError::Validation(format!("mqtt: {err}")))?;
            if format!("{}.uplink", self.mqtt.client_id) == self.bridge.loopback_client_id {
                return Err(ConfigError::Validation(
                    "bridge.loopback_client_id collides with the MQTT uplink session".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: [
                "switchyardd=info",
                "switchyard_app=info",
                "switchyard_adapter_broker_memory=info",
                "switchyard_adapter_mqtt=info",
            ]
            .join(","),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.bus.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.bus.response_buffer, None);
        assert_eq!(config.bridge.loopback_client_id, "switchyard.loopback");
        assert_eq!(config.broker.max_sessions, None);
        assert!(!config.integrations.mqtt_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bus.query_timeout_ms, 5_000);
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            [bus]
            query_timeout_ms = 1500
            result_check_interval_ms = 100
            response_buffer = 16

            [bridge]
            loopback_client_id = 'hub.loopback'

            [broker]
            ack_timeout_ms = 2000
            max_sessions = 32

            [mqtt]
            broker_host = 'mqtt.lan'
            import_topics = ['zigbee2mqtt/#']

            [logging]
            filter = 'debug'

            [integrations]
            mqtt_enabled = true
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bus.query_timeout_ms, 1500);
        assert_eq!(config.bus.response_buffer, Some(16));
        assert_eq!(config.bridge.loopback_client_id, "hub.loopback");
        assert_eq!(config.broker.max_sessions, Some(32));
        assert_eq!(config.mqtt.broker_host, "mqtt.lan");
        assert_eq!(config.logging.filter, "debug");
        assert!(config.integrations.mqtt_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_return_default_when_file_not_found() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.bus.query_timeout_ms, 5_000);
    }

    #[test]
    fn should_apply_environment_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("SWITCHYARD_LOG", "trace"),
            ("SWITCHYARD_MQTT_HOST", "broker.local"),
            ("SWITCHYARD_MQTT_PORT", "8883"),
            ("SWITCHYARD_MQTT_ENABLED", "true"),
            ("SWITCHYARD_QUERY_TIMEOUT_MS", "750"),
        ]));
        assert_eq!(config.logging.filter, "trace");
        assert_eq!(config.mqtt.broker_host, "broker.local");
        assert_eq!(config.mqtt.broker_port, 8883);
        assert!(config.integrations.mqtt_enabled);
        assert_eq!(config.bus.query_timeout_ms, 750);
    }

    #[test]
    fn should_prefer_rust_log_over_switchyard_log() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[("SWITCHYARD_LOG", "debug"), ("RUST_LOG", "warn")]));
        assert_eq!(config.logging.filter, "warn");
    }

    #[test]
    fn should_ignore_unparsable_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[("SWITCHYARD_MQTT_PORT", "not-a-port")]));
        assert_eq!(config.mqtt.broker_port, 1883);
    }

    #[test]
    fn should_reject_zero_query_timeout() {
        let mut config = Config::default();
        config.bus.query_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_reject_zero_response_buffer() {
        let mut config = Config::default();
        config.bus.response_buffer = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_validate_mqtt_only_when_enabled() {
        let mut config = Config::default();
        config.mqtt.qos = 7;
        assert!(config.validate().is_ok());

        config.integrations.mqtt_enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn should_reject_loopback_id_colliding_with_uplink() {
        let mut config = Config::default();
        config.integrations.mqtt_enabled = true;
        config.bridge.loopback_client_id = "switchyard.uplink".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_report_parse_error_for_invalid_toml() {
        let result: Result<Config, _> = toml::from_str("invalid {{{");
        assert!(result.is_err());
    }
}
