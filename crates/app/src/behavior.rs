//! Behavior chain — ordered middleware around handler invocations and queries.
//!
//! A [`Behavior`] receives the [`InvocationContext`] and a [`Next`]
//! continuation. Calling [`Next::run`] proceeds to the following behavior or,
//! at the end of the chain, to the wrapped work. Not calling it
//! short-circuits the invocation. `Next` is `Copy`, so a behavior may run it
//! several times (retry).
//!
//! For publishes the chain wraps each handler invocation separately. For
//! queries it wraps the query's full span.

pub mod circuit_breaker;
pub mod logging;
pub mod priority;
pub mod retry;
pub mod throttle;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use switchyard_domain::error::BusError;
use switchyard_domain::id::{CorrelationId, SubscriptionToken};
use switchyard_domain::message::{AnyMessage, MessageKind};

use crate::registry::HandlerDescriptor;

pub use circuit_breaker::CircuitBreakerBehavior;
pub use logging::LoggingBehavior;
pub use priority::PriorityBehavior;
pub use retry::RetryBehavior;
pub use throttle::ThrottleBehavior;

/// Which query pattern is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPattern {
    /// First response wins.
    First,
    /// Repeat until a response equals the expected value.
    ResultCheck,
    /// Stream of every response.
    Results,
    /// First response is republished on the bus.
    Republish,
}

/// What a chain run wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// One handler invocation during a publish.
    Dispatch {
        /// The handler being invoked.
        token: SubscriptionToken,
    },
    /// A whole query.
    Query {
        /// The query pattern.
        pattern: QueryPattern,
    },
}

/// Metadata visible to behaviors.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// What is being wrapped.
    pub scope: Scope,
    /// Kind of the published message.
    pub message_kind: MessageKind,
    /// Topic of the published message.
    pub topic: Arc<str>,
    /// Correlation id of the publish or query.
    pub correlation_id: CorrelationId,
}

impl InvocationContext {
    /// Context for one handler invocation.
    #[must_use]
    pub fn dispatch(
        token: SubscriptionToken,
        message: &AnyMessage,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            scope: Scope::Dispatch { token },
            message_kind: message.kind(),
            topic: Arc::from(message.topic()),
            correlation_id,
        }
    }

    /// Context for a query span.
    #[must_use]
    pub fn query(
        pattern: QueryPattern,
        message: &AnyMessage,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            scope: Scope::Query { pattern },
            message_kind: message.kind(),
            topic: Arc::from(message.topic()),
            correlation_id,
        }
    }

    /// Stable key for per-target state: the handler token for dispatches,
    /// the message kind for queries.
    #[must_use]
    pub fn key(&self) -> String {
        match self.scope {
            Scope::Dispatch { token } => token.to_string(),
            Scope::Query { .. } => format!("query:{}", self.message_kind),
        }
    }
}

/// The work at the end of a chain.
pub type Terminal<'a> = dyn Fn() -> BoxFuture<'a, Result<(), BusError>> + Send + Sync + 'a;

/// A middleware step.
pub trait Behavior: Send + Sync + fmt::Debug {
    /// Wrap the rest of the chain.
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>>;

    /// Reorder the handlers resolved for a publish. Defaults to no change.
    fn order(&self, _handlers: &mut Vec<Arc<HandlerDescriptor>>) {}
}

/// Continuation handed to a behavior.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    behaviors: &'a [Arc<dyn Behavior>],
    ctx: &'a InvocationContext,
    terminal: &'a Terminal<'a>,
}

impl<'a> Next<'a> {
    /// Run the remaining behaviors and the wrapped work.
    pub fn run(self) -> BoxFuture<'a, Result<(), BusError>> {
        match self.behaviors.split_first() {
            Some((head, rest)) => head.handle(
                self.ctx,
                Next {
                    behaviors: rest,
                    ..self
                },
            ),
            None => (self.terminal)(),
        }
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.behaviors.len())
            .finish_non_exhaustive()
    }
}

/// Ordered list of behaviors. Cloning shares the behaviors and their state.
#[derive(Debug, Clone, Default)]
pub struct BehaviorChain {
    behaviors: Vec<Arc<dyn Behavior>>,
}

impl BehaviorChain {
    /// An empty chain: invocations run unwrapped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a behavior. The first appended is the outermost.
    #[must_use]
    pub fn with(self, behavior: impl Behavior + 'static) -> Self {
        self.with_shared(Arc::new(behavior))
    }

    /// Append a behavior shared with other chains.
    #[must_use]
    pub fn with_shared(mut self, behavior: Arc<dyn Behavior>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// Number of behaviors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    /// Let every behavior reorder `handlers`, outermost first.
    pub fn order(&self, handlers: &mut Vec<Arc<HandlerDescriptor>>) {
        for behavior in &self.behaviors {
            behavior.order(handlers);
        }
    }

    /// Run `terminal` wrapped by every behavior.
    pub fn run<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        terminal: &'a Terminal<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Next {
            behaviors: &self.behaviors,
            ctx,
            terminal,
        }
        .run()
    }
}
