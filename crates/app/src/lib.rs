//! # switchyard-app
//!
//! The messaging core and its **port definitions** (traits).
//!
//! ## Responsibilities
//! - [`registry`] — token → handler descriptor, snapshot reads
//! - [`behavior`] — middleware chain wrapping dispatch and query execution
//! - [`event_aggregator`] — publish/subscribe with per-handler fault isolation
//! - [`query`] — the four request/response patterns with timeout and cancellation
//! - Define **port traits** that adapters implement:
//!   - `EmbeddedBroker` — in-process broker accepting injected clients
//!   - `WireClient` / `WireClientFactory` — clients speaking over loopback channels
//!   - `ScriptingHost` — registration point for script proxies
//! - [`services`] — the broker bridge, API-call wrappers and script proxies
//!
//! ## Dependency rule
//! Depends on `switchyard-domain` only (plus `tokio`/`futures` for async plumbing).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod behavior;
pub mod config;
pub mod event_aggregator;
mod pending;
pub mod ports;
pub mod query;
pub mod registry;
pub mod services;

pub use behavior::{Behavior, BehaviorChain};
pub use event_aggregator::{CallOptions, DeliveryReport, EventAggregator, MessageStream};
pub use query::ResultStream;
pub use registry::{HandlerDescriptor, InvocationKind, KindSelector};
