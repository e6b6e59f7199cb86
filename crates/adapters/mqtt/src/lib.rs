//! # switchyard-adapter-mqtt
//!
//! MQTT uplink — connects the embedded broker to an external MQTT broker.
//!
//! ## Responsibilities
//! - Connect to the external broker with `rumqttc`
//! - Import: subscribe to `import_topics` and republish every message into
//!   the embedded broker through a loopback session
//! - Export: subscribe the loopback session (with `no_local`) to
//!   `export_topics` and forward matching messages to the external broker
//!
//! ## Dependency rule
//! Same as other adapters: depends on `switchyard-app` and `switchyard-domain`.

pub mod config;
pub mod error;
mod qos;
mod uplink;

pub use config::MqttConfig;
pub use error::MqttError;
pub use uplink::MqttUplink;
