//! Subscription registry — token → handler descriptor.
//!
//! Writers replace the whole descriptor list (copy-on-write) under a short
//! write lock. Readers clone the current `Arc` and resolve against it, so a
//! publish never observes a half-applied registration and never holds the
//! lock while handlers run.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::{self, BoxFuture};

use switchyard_domain::error::{BusError, HandlerError, HandlerPanic};
use switchyard_domain::filter::MessageFilter;
use switchyard_domain::id::SubscriptionToken;
use switchyard_domain::message::{
    AnyMessage, BusMessage, Delivery, DynamicEnvelope, MessageEnvelope, MessageKind,
};

/// A response produced by a result handler, with its type erased.
pub type Response = Arc<dyn Any + Send + Sync>;

/// Which message kinds a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindSelector {
    /// Exactly one kind. Used by typed subscriptions.
    Exact(MessageKind),
    /// The kind and every kind nested below it (`sensor` covers `sensor.temperature`).
    Family(MessageKind),
    /// Every message.
    All,
}

impl KindSelector {
    /// Whether a message of `kind` is selected.
    #[must_use]
    pub fn covers(self, kind: MessageKind) -> bool {
        match self {
            Self::Exact(expected) => expected == kind,
            Self::Family(family) => kind.belongs_to(family),
            Self::All => true,
        }
    }
}

/// How the handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    /// Runs inline on the publishing task.
    Sync,
    /// Awaited by the publishing task, result discarded.
    Async,
    /// Awaited; the value is offered to the originating query.
    AsyncWithResult,
}

type SyncCallback = dyn Fn(&AnyMessage, Delivery) -> Result<(), HandlerError> + Send + Sync;
type AsyncCallback =
    dyn Fn(&AnyMessage, Delivery) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;
type ResponseFuture = BoxFuture<'static, Result<Option<Response>, HandlerError>>;
type ResultCallback = dyn Fn(&AnyMessage, Delivery) -> ResponseFuture + Send + Sync;

enum Callback {
    Sync(Box<SyncCallback>),
    Async(Box<AsyncCallback>),
    WithResult(Box<ResultCallback>),
}

/// Binding between a kind selector, an optional filter and a callback.
pub struct HandlerDescriptor {
    token: SubscriptionToken,
    selector: KindSelector,
    filter: Option<MessageFilter>,
    callback: Callback,
}

impl HandlerDescriptor {
    /// Typed handler running inline.
    pub fn sync<T, F>(filter: Option<MessageFilter>, handler: F) -> Self
    where
        T: BusMessage,
        F: Fn(MessageEnvelope<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let callback = move |message: &AnyMessage, delivery: Delivery| {
            match message.downcast::<T>() {
                Some(typed) => handler(MessageEnvelope::new(typed, delivery)),
                None => Err(kind_collision::<T>(message)),
            }
        };
        Self::new(KindSelector::Exact(T::KIND), filter, Callback::Sync(Box::new(callback)))
    }

    /// Typed handler building a fresh callback for every delivery.
    pub fn from_factory<T, M, H>(filter: Option<MessageFilter>, factory: M) -> Self
    where
        T: BusMessage,
        M: Fn() -> H + Send + Sync + 'static,
        H: FnOnce(MessageEnvelope<T>) -> Result<(), HandlerError>,
    {
        Self::sync(filter, move |envelope: MessageEnvelope<T>| factory()(envelope))
    }

    /// Typed handler awaited by the publisher.
    pub fn asynchronous<T, F, Fut>(filter: Option<MessageFilter>, handler: F) -> Self
    where
        T: BusMessage,
        F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let callback = move |message: &AnyMessage, delivery: Delivery| {
            match message.downcast::<T>() {
                Some(typed) => handler(MessageEnvelope::new(typed, delivery)).boxed(),
                None => future::ready(Err(kind_collision::<T>(message))).boxed(),
            }
        };
        Self::new(KindSelector::Exact(T::KIND), filter, Callback::Async(Box::new(callback)))
    }

    /// Typed handler whose value answers a query.
    pub fn with_result<T, R, F, Fut>(filter: Option<MessageFilter>, handler: F) -> Self
    where
        T: BusMessage,
        R: Send + Sync + 'static,
        F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let callback = move |message: &AnyMessage, delivery: Delivery| -> ResponseFuture {
            match message.downcast::<T>() {
                Some(typed) => handler(MessageEnvelope::new(typed, delivery))
                    .map(|outcome| outcome.map(|value| Some(Arc::new(value) as Response)))
                    .boxed(),
                None => future::ready(Err(kind_collision::<T>(message))).boxed(),
            }
        };
        Self::new(
            KindSelector::Exact(T::KIND),
            filter,
            Callback::WithResult(Box::new(callback)),
        )
    }

    /// Untyped handler selecting a kind family or every message.
    pub fn dynamic<F>(selector: KindSelector, filter: Option<MessageFilter>, handler: F) -> Self
    where
        F: Fn(DynamicEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let callback = move |message: &AnyMessage, delivery: Delivery| {
            handler(DynamicEnvelope::new(message.clone(), delivery))
        };
        Self::new(selector, filter, Callback::Sync(Box::new(callback)))
    }

    fn new(selector: KindSelector, filter: Option<MessageFilter>, callback: Callback) -> Self {
        Self {
            token: SubscriptionToken::new(),
            selector,
            filter,
            callback,
        }
    }

    /// Token identifying this subscription.
    #[must_use]
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// Kinds the subscription receives.
    #[must_use]
    pub fn selector(&self) -> KindSelector {
        self.selector
    }

    /// Filter attached at subscribe time.
    #[must_use]
    pub fn filter(&self) -> Option<&MessageFilter> {
        self.filter.as_ref()
    }

    /// How the callback is invoked.
    #[must_use]
    pub fn invocation_kind(&self) -> InvocationKind {
        match self.callback {
            Callback::Sync(_) => InvocationKind::Sync,
            Callback::Async(_) => InvocationKind::Async,
            Callback::WithResult(_) => InvocationKind::AsyncWithResult,
        }
    }

    /// Whether `message` is selected by kind and accepted by the filter.
    #[must_use]
    pub fn matches(&self, message: &AnyMessage) -> bool {
        self.selector.covers(message.kind())
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.accepts(message))
    }

    /// Invoke the callback, turning returned errors and panics into
    /// [`BusError::HandlerFault`].
    ///
    /// Sync callbacks run before this returns; the future only carries their
    /// outcome.
    pub fn invoke(
        &self,
        message: &AnyMessage,
        delivery: Delivery,
    ) -> BoxFuture<'static, Result<Option<Response>, BusError>> {
        let token = self.token;
        match &self.callback {
            Callback::Sync(callback) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(message, delivery)));
                let result = match outcome {
                    Ok(result) => result.map(|()| None).map_err(|source| fault(token, source)),
                    Err(payload) => Err(panicked(token, payload.as_ref())),
                };
                future::ready(result).boxed()
            }
            Callback::Async(callback) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(message, delivery))) {
                    Ok(pending) => settle(token, pending.map(|outcome| outcome.map(|()| None))),
                    Err(payload) => future::ready(Err(panicked(token, payload.as_ref()))).boxed(),
                }
            }
            Callback::WithResult(callback) => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(message, delivery))) {
                    Ok(pending) => settle(token, pending),
                    Err(payload) => future::ready(Err(panicked(token, payload.as_ref()))).boxed(),
                }
            }
        }
    }
}

/// A message selected by kind is not of the handler's type: two types
/// declare the same kind.
fn kind_collision<T: BusMessage>(message: &AnyMessage) -> HandlerError {
    tracing::warn!(
        kind = %message.kind(),
        expected = std::any::type_name::<T>(),
        "message kind shared by more than one type"
    );
    format!(
        "message of kind {} is not a {}",
        message.kind(),
        std::any::type_name::<T>()
    )
    .into()
}

fn settle<F>(
    token: SubscriptionToken,
    pending: F,
) -> BoxFuture<'static, Result<Option<Response>, BusError>>
where
    F: Future<Output = Result<Option<Response>, HandlerError>> + Send + 'static,
{
    AssertUnwindSafe(pending)
        .catch_unwind()
        .map(move |outcome| match outcome {
            Ok(result) => result.map_err(|source| fault(token, source)),
            Err(payload) => Err(panicked(token, payload.as_ref())),
        })
        .boxed()
}

fn fault(token: SubscriptionToken, source: HandlerError) -> BusError {
    BusError::HandlerFault { token, source }
}

fn panicked(token: SubscriptionToken, payload: &(dyn Any + Send)) -> BusError {
    fault(token, Box::new(HandlerPanic::from_payload(payload)))
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("token", &self.token)
            .field("selector", &self.selector)
            .field("filter", &self.filter)
            .field("invocation", &self.invocation_kind())
            .finish()
    }
}

type Snapshot = Arc<Vec<Arc<HandlerDescriptor>>>;

/// Thread-safe set of subscriptions, kept in registration order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Snapshot>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor and return its token.
    pub fn register(&self, descriptor: HandlerDescriptor) -> SubscriptionToken {
        let token = descriptor.token();
        let descriptor = Arc::new(descriptor);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(descriptor);
        *entries = Arc::new(next);
        token
    }

    /// Remove a subscription. Unknown or already revoked tokens are ignored.
    ///
    /// Returns whether something was removed.
    pub fn revoke(&self, token: SubscriptionToken) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|entry| entry.token() == token) {
            return false;
        }
        let next = entries
            .iter()
            .filter(|entry| entry.token() != token)
            .cloned()
            .collect();
        *entries = Arc::new(next);
        true
    }

    /// Whether `token` is currently registered.
    #[must_use]
    pub fn contains(&self, token: SubscriptionToken) -> bool {
        self.snapshot().iter().any(|entry| entry.token() == token)
    }

    /// Drop every subscription at once.
    pub fn clear(&self) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::default();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current descriptor list.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Descriptors matching `message`, in registration order.
    ///
    /// A publish-time `filter` gates the whole message: when it rejects the
    /// message nothing matches.
    #[must_use]
    pub fn resolve(
        &self,
        message: &AnyMessage,
        filter: Option<&MessageFilter>,
    ) -> Vec<Arc<HandlerDescriptor>> {
        if filter.is_some_and(|filter| !filter.accepts(message)) {
            return Vec::new();
        }
        self.snapshot()
            .iter()
            .filter(|entry| entry.matches(message))
            .cloned()
            .collect()
    }
}
