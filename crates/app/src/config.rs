//! Tunables for the bus and the broker bridge.
//!
//! Both structs deserialize from their own TOML section (`[bus]`,
//! `[bridge]`) and fall back to defaults for every missing field.

use std::time::Duration;

use serde::Deserialize;

/// Default query deadline in milliseconds.
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 5_000;

/// Default pause between result-check rounds in milliseconds.
pub const DEFAULT_RESULT_CHECK_INTERVAL_MS: u64 = 250;

/// Client id of the loopback client the bridge injects into the broker.
pub const DEFAULT_LOOPBACK_CLIENT_ID: &str = "switchyard.loopback";

/// Bus-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Deadline applied to queries that do not pass their own.
    pub query_timeout_ms: u64,
    /// Pause between rounds of `query_with_result_check`.
    pub result_check_interval_ms: u64,
    /// Capacity of each query's response channel. `None` is unbounded;
    /// with `Some(n)` responses beyond `n` unread ones are dropped.
    pub response_buffer: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            result_check_interval_ms: DEFAULT_RESULT_CHECK_INTERVAL_MS,
            response_buffer: None,
        }
    }
}

impl BusConfig {
    /// Default query deadline.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Pause between result-check rounds.
    #[must_use]
    pub fn result_check_interval(&self) -> Duration {
        Duration::from_millis(self.result_check_interval_ms)
    }
}

/// Broker bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Client id used for the injected loopback client.
    pub loopback_client_id: String,
    /// Keep-alive announced by the loopback client.
    pub keep_alive_secs: u64,
    /// How long `close` waits for in-flight bus dispatches of inbound
    /// messages before aborting them.
    pub drain_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            loopback_client_id: DEFAULT_LOOPBACK_CLIENT_ID.to_string(),
            keep_alive_secs: 3_600,
            drain_timeout_ms: 1_000,
        }
    }
}

impl BridgeConfig {
    /// Keep-alive as a [`Duration`].
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Grace period for in-flight inbound dispatches on close.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_use_defaults_when_section_is_empty() {
        let config: BusConfig = toml::from_str("").unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
        assert!(config.response_buffer.is_none());
    }

    #[test]
    fn should_parse_partial_bus_section() {
        let config: BusConfig = toml::from_str(
            r"
            query_timeout_ms = 1500
            response_buffer = 32
            ",
        )
        .unwrap();
        assert_eq!(config.query_timeout(), Duration::from_millis(1500));
        assert_eq!(config.result_check_interval_ms, DEFAULT_RESULT_CHECK_INTERVAL_MS);
        assert_eq!(config.response_buffer, Some(32));
    }

    #[test]
    fn should_default_bridge_keep_alive_to_one_hour() {
        let config = BridgeConfig::default();
        assert_eq!(config.keep_alive(), Duration::from_secs(3600));
        assert_eq!(config.loopback_client_id, "switchyard.loopback");
        assert_eq!(config.drain_timeout(), Duration::from_secs(1));
    }
}
