//! Embedded broker configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default time a loopback client waits for an acknowledgement.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

/// Configuration for the embedded broker and its loopback clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long a loopback client waits for `ConnAck`/`SubAck`/`PubAck`, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Maximum number of concurrent sessions; unlimited when absent.
    pub max_sessions: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_sessions: None,
        }
    }
}

impl BrokerConfig {
    /// Acknowledgement timeout as a [`Duration`].
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_have_sensible_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_sessions, None);
    }

    #[test]
    fn should_deserialize_from_toml() {
        let config: BrokerConfig =
            toml::from_str("ack_timeout_ms = 250\nmax_sessions = 8").unwrap();
        assert_eq!(config.ack_timeout_ms, 250);
        assert_eq!(config.max_sessions, Some(8));
    }

    #[test]
    fn should_use_defaults_for_missing_fields() {
        let config: BrokerConfig = toml::from_str("max_sessions = 2").unwrap();
        assert_eq!(config.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
    }
}
