//! Messages, message kinds and the envelopes handed to subscribers.
//!
//! A message type opts into the bus by implementing [`BusMessage`], which
//! gives it a stable [`MessageKind`]. Matching is done on kinds, never on
//! runtime type introspection. Kinds are dotted names; a kind belongs to
//! every prefix family (`sensor.temperature` belongs to `sensor`).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::id::{CorrelationId, SubscriptionToken};
use crate::qos::QualityOfService;
use crate::time::Timestamp;

/// Stable identity of a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(&'static str);

impl MessageKind {
    /// Wrap a static dotted name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The dotted name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }

    /// Whether `self` equals `family` or is nested below it.
    #[must_use]
    pub fn belongs_to(self, family: MessageKind) -> bool {
        match self.0.strip_prefix(family.0) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A payload type that can travel on the bus.
pub trait BusMessage: Send + Sync + 'static {
    /// Stable identity used for subscriber resolution. Must be unique per
    /// type: a typed handler receiving a message of another type with the
    /// same kind reports a fault.
    const KIND: MessageKind;
}

/// Implement [`BusMessage`] for a type.
///
/// ```ignore
/// bus_message!(MotionDetected, "presence.motion");
/// ```
#[macro_export]
macro_rules! bus_message {
    ($name:ty, $kind:literal) => {
        impl $crate::message::BusMessage for $name {
            const KIND: $crate::message::MessageKind = $crate::message::MessageKind::new($kind);
        }
    };
}

/// A typed payload in transit.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T> {
    topic: String,
    payload: T,
    qos: QualityOfService,
}

impl<T> Message<T> {
    /// Create a message on `topic` with [`QualityOfService::AtMostOnce`].
    pub fn new(topic: impl Into<String>, payload: T) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos: QualityOfService::default(),
        }
    }

    /// Override the quality of service.
    #[must_use]
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    /// Topic the message was published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Borrow the payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Requested quality of service.
    #[must_use]
    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    /// Consume the message and return its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: BusMessage> From<T> for Message<T> {
    /// Publish on a topic named after the message kind.
    fn from(payload: T) -> Self {
        Self::new(T::KIND.as_str(), payload)
    }
}

/// A message with its payload type erased, as stored during dispatch.
#[derive(Clone)]
pub struct AnyMessage {
    kind: MessageKind,
    topic: Arc<str>,
    qos: QualityOfService,
    inner: Arc<dyn Any + Send + Sync>,
}

impl AnyMessage {
    /// Erase a typed message.
    pub fn new<T: BusMessage>(message: Message<T>) -> Self {
        Self {
            kind: T::KIND,
            topic: Arc::from(message.topic()),
            qos: message.qos(),
            inner: Arc::new(message),
        }
    }

    /// Kind of the erased payload.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Topic of the erased message.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Requested quality of service.
    #[must_use]
    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    /// Recover the typed message, sharing the allocation.
    #[must_use]
    pub fn downcast<T: BusMessage>(&self) -> Option<Arc<Message<T>>> {
        Arc::clone(&self.inner).downcast::<Message<T>>().ok()
    }

    /// Borrow the typed payload, if it is a `T`.
    #[must_use]
    pub fn payload<T: BusMessage>(&self) -> Option<&T> {
        self.inner
            .downcast_ref::<Message<T>>()
            .map(Message::payload)
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("kind", &self.kind)
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

/// Delivery metadata attached to one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Correlates the publish (or query) with its responses.
    pub correlation_id: CorrelationId,
    /// When the dispatcher created the envelope.
    pub timestamp: Timestamp,
    /// The subscription that matched.
    pub token: SubscriptionToken,
}

/// Typed delivery context passed to one handler.
pub struct MessageEnvelope<T> {
    message: Arc<Message<T>>,
    delivery: Delivery,
}

impl<T> MessageEnvelope<T> {
    /// Wrap a shared message with its delivery metadata.
    #[must_use]
    pub fn new(message: Arc<Message<T>>, delivery: Delivery) -> Self {
        Self { message, delivery }
    }

    /// The message being delivered.
    #[must_use]
    pub fn message(&self) -> &Message<T> {
        &self.message
    }

    /// Shortcut for `message().payload()`.
    #[must_use]
    pub fn payload(&self) -> &T {
        self.message.payload()
    }

    /// Shortcut for `message().topic()`.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    /// Correlation id of the publish or query that produced this delivery.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.delivery.correlation_id
    }

    /// When the envelope was created.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.delivery.timestamp
    }

    /// The matched subscription.
    #[must_use]
    pub fn token(&self) -> SubscriptionToken {
        self.delivery.token
    }
}

impl<T> Clone for MessageEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            message: Arc::clone(&self.message),
            delivery: self.delivery,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for MessageEnvelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("message", &self.message)
            .field("delivery", &self.delivery)
            .finish()
    }
}

/// Delivery context for subscriptions that select a kind family rather than
/// a single type.
#[derive(Debug, Clone)]
pub struct DynamicEnvelope {
    message: AnyMessage,
    delivery: Delivery,
}

impl DynamicEnvelope {
    /// Wrap an erased message with its delivery metadata.
    #[must_use]
    pub fn new(message: AnyMessage, delivery: Delivery) -> Self {
        Self { message, delivery }
    }

    /// The erased message.
    #[must_use]
    pub fn message(&self) -> &AnyMessage {
        &self.message
    }

    /// Kind of the delivered payload.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Topic of the delivered message.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.message.topic()
    }

    /// Borrow the payload as `T`, if that is its type.
    #[must_use]
    pub fn payload<T: BusMessage>(&self) -> Option<&T> {
        self.message.payload::<T>()
    }

    /// Correlation id of the publish.
    #[must_use]
    pub fn correlation_id(&self) -> CorrelationId {
        self.delivery.correlation_id
    }

    /// The matched subscription.
    #[must_use]
    pub fn token(&self) -> SubscriptionToken {
        self.delivery.token
    }
}
