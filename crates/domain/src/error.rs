//! Error types shared across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`BusError`]
//! via `#[from]` or an explicit `into_domain()`.

use std::time::Duration;

use crate::id::SubscriptionToken;

/// Boxed error produced by a subscriber callback or a transport.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error for every bus operation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// An argument was rejected at the call boundary. Nothing was delivered.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A subscriber returned an error or panicked.
    #[error("handler {token} faulted")]
    HandlerFault {
        /// Subscription whose handler faulted.
        token: SubscriptionToken,
        /// What the handler reported.
        #[source]
        source: HandlerError,
    },

    /// Sending over the wire failed.
    #[error("transport error")]
    Transport(#[source] HandlerError),

    /// A query deadline elapsed without a qualifying response.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A circuit breaker rejected the invocation.
    #[error("circuit open for {key}, retry in {remaining:?}")]
    CircuitOpen {
        /// Key the breaker tracks (handler token or query kind).
        key: String,
        /// Time until the breaker half-opens.
        remaining: Duration,
    },

    /// The bus was shut down while the operation was in flight.
    #[error("bus is shut down")]
    Closed,

    /// A behavior completed the query without letting it produce a response.
    #[error("query completed without a response")]
    Unanswered,
}

impl BusError {
    /// Whether the error is a subscriber fault (as opposed to a coordinator error).
    #[must_use]
    pub fn is_handler_fault(&self) -> bool {
        matches!(self, Self::HandlerFault { .. })
    }
}

/// Rejected arguments.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Topic name is empty.
    #[error("topic must not be empty")]
    EmptyTopic,

    /// Publish topics are concrete names and cannot carry `+` or `#`.
    #[error("topic {0:?} must not contain wildcards")]
    WildcardInTopic(String),

    /// Subscription filter violates the wildcard placement rules.
    #[error("invalid topic filter {0:?}")]
    InvalidTopicFilter(String),

    /// Topic pattern is not a valid regular expression.
    #[error("invalid topic pattern")]
    InvalidPattern(#[from] regex::Error),

    /// QoS level outside `0..=2`.
    #[error("invalid quality of service level {0}")]
    InvalidQos(u8),

    /// An API call parameter could not be decoded.
    #[error("invalid parameter")]
    InvalidParameter(#[from] serde_json::Error),
}

/// Panic payload captured from a subscriber.
#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {message}")]
pub struct HandlerPanic {
    /// Panic message when it was a string, a placeholder otherwise.
    pub message: String,
}

impl HandlerPanic {
    /// Build from the payload returned by `catch_unwind`.
    #[must_use]
    pub fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }
}
