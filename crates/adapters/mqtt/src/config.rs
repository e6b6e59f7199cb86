//! MQTT uplink configuration.

use std::time::Duration;

use serde::Deserialize;

use switchyard_domain::qos::QualityOfService;
use switchyard_domain::topic::validate_topic_filter;

use crate::error::MqttError;

/// Configuration for the MQTT uplink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address.
    pub broker_host: String,
    /// MQTT broker port.
    pub broker_port: u16,
    /// MQTT client identifier. The loopback session is named `{client_id}.uplink`.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Filters subscribed on the external broker and relayed inward.
    pub import_topics: Vec<String>,
    /// Filters subscribed on the embedded broker and relayed outward.
    pub export_topics: Vec<String>,
    /// QoS level (0, 1 or 2) used for subscriptions on both sides.
    pub qos: u8,
    /// Capacity of the rumqttc request channel.
    pub channel_capacity: usize,
    /// Pause after a connection error before polling again, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "switchyard".to_string(),
            keep_alive_secs: 30,
            import_topics: vec!["#".to_string()],
            export_topics: Vec::new(),
            qos: 0,
            channel_capacity: 64,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl MqttConfig {
    /// Keep-alive as a [`Duration`].
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Reconnect delay as a [`Duration`].
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Configured QoS level.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::Validation`] for a level above 2.
    pub fn quality_of_service(&self) -> Result<QualityOfService, MqttError> {
        Ok(QualityOfService::try_from(self.qos)?)
    }

    /// Check the configuration before connecting.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::InvalidConfig`] for an empty host or client id,
    /// a zero channel capacity or a zero keep-alive, and
    /// [`MqttError::Validation`] for a bad QoS level or topic filter.
    pub fn validate(&self) -> Result<(), MqttError> {
        if self.broker_host.trim().is_empty() {
            return Err(MqttError::InvalidConfig("broker_host must not be empty"));
        }
        if self.client_id.trim().is_empty() {
            return Err(MqttError::InvalidConfig("client_id must not be empty"));
        }
        if self.channel_capacity == 0 {
            return Err(MqttError::InvalidConfig("channel_capacity must be greater than 0"));
        }
        if self.keep_alive_secs == 0 {
            return Err(MqttError::InvalidConfig("keep_alive_secs must be greater than 0"));
        }
        self.quality_of_service()?;
        for filter in self.import_topics.iter().chain(&self.export_topics) {
            validate_topic_filter(filter)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use switchyard_domain::error::ValidationError;

    use super::*;

    #[test]
    fn should_have_sensible_defaults() {
        let config = MqttConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.client_id, "switchyard");
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.import_topics, vec!["#"]);
        assert!(config.export_topics.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            broker_host = "mqtt.example.com"
            broker_port = 8883
            client_id = "my-hub"
            keep_alive_secs = 60
            import_topics = ["zigbee2mqtt/#"]
            export_topics = ["zigbee2mqtt/+/set"]
            qos = 1
        "#;
        let config: MqttConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.broker_host, "mqtt.example.com");
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.client_id, "my-hub");
        assert_eq!(config.import_topics, vec!["zigbee2mqtt/#"]);
        assert_eq!(config.export_topics, vec!["zigbee2mqtt/+/set"]);
        assert_eq!(config.quality_of_service().unwrap(), QualityOfService::AtLeastOnce);
    }

    #[test]
    fn should_use_defaults_for_missing_fields() {
        let config: MqttConfig = toml::from_str(r#"broker_host = "192.168.1.100""#).unwrap();
        assert_eq!(config.broker_host, "192.168.1.100");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn should_reject_empty_host() {
        let config = MqttConfig {
            broker_host: " ".to_string(),
            ..MqttConfig::default()
        };
        assert!(matches!(config.validate(), Err(MqttError::InvalidConfig(_))));
    }

    #[test]
    fn should_reject_zero_keep_alive() {
        let config = MqttConfig {
            keep_alive_secs: 0,
            ..MqttConfig::default()
        };
        assert!(matches!(config.validate(), Err(MqttError::InvalidConfig(_))));
    }

    #[test]
    fn should_reject_unknown_qos_level() {
        let config = MqttConfig {
            qos: 3,
            ..MqttConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MqttError::Validation(ValidationError::InvalidQos(3)))
        ));
    }

    #[test]
    fn should_reject_malformed_topic_filter() {
        let config = MqttConfig {
            export_topics: vec!["a/#/b".to_string()],
            ..MqttConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MqttError::Validation(ValidationError::InvalidTopicFilter(_)))
        ));
    }
}
