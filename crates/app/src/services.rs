//! Application services — components built on top of the bus.
//!
//! Each service accepts port implementations via generic parameters
//! (constructor injection), keeping this layer decoupled from concrete adapters.

pub mod api;
pub mod broker_api;
pub mod device_message_broker;
pub mod script_registry;

pub use api::ApiCall;
pub use device_message_broker::{BridgeError, BridgeState, DeviceMessageBroker};
pub use script_registry::ScriptRegistry;
