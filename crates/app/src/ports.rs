//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the messaging core and the outside world.
//! They are defined here (in `app`) so that both the bridge service and the
//! adapter layer can depend on them without creating circular dependencies.

pub mod broker;
pub mod scripting;

pub use broker::{
    BrokerError, ConnectedClient, EmbeddedBroker, LoopbackChannel, WireClient, WireClientFactory,
};
pub use scripting::{ScriptCallError, ScriptProxy, ScriptProxyFactory, ScriptingHost};
