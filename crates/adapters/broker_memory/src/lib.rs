//! # switchyard-adapter-broker-memory
//!
//! In-process broker for device messages.
//!
//! ## Responsibilities
//! - [`MemoryBroker`] — implements `EmbeddedBroker`: one task per injected
//!   session, topic-filter routing, QoS downgrade, `no_local`
//! - [`LoopbackClient`] — implements `WireClient` over a loopback channel,
//!   pairing requests with their acknowledgements
//!
//! ## Dependency rule
//! Depends on `switchyard-app` (port traits) and `switchyard-domain` only.

mod broker;
mod client;
pub mod config;

pub use broker::MemoryBroker;
pub use client::{LoopbackClient, LoopbackClientFactory};
pub use config::BrokerConfig;
