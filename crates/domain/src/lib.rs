//! # switchyard-domain
//!
//! Pure message model for the switchyard home-hub bus.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps
//! - Define **message kinds** (stable type identity, no runtime reflection)
//! - Define **messages** and the **envelopes** handed to subscribers
//! - Define **filters** (topic patterns and payload predicates)
//! - Define the **wire shape**: device messages, QoS levels, topic rules and
//!   the control packets exchanged over loopback channels
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or async runtimes.

pub mod error;
pub mod id;
pub mod time;

pub mod device_message;
pub mod filter;
pub mod message;
pub mod packet;
pub mod qos;
pub mod topic;
