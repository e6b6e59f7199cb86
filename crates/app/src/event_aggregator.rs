//! The bus — subscription management and publish with per-handler fault
//! isolation.
//!
//! ## Delivery
//! `publish` resolves matching handlers against a registry snapshot, lets
//! the effective behavior chain reorder them, then invokes them one after
//! the other, each wrapped by the chain. A handler that returns an error or
//! panics is logged and counted; delivery continues with the next handler.
//! Independent publishes run concurrently and share nothing but the
//! snapshot.

use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{FutureExt, Stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use switchyard_domain::error::{BusError, HandlerError, ValidationError};
use switchyard_domain::filter::MessageFilter;
use switchyard_domain::id::{CorrelationId, SubscriptionToken};
use switchyard_domain::message::{
    AnyMessage, BusMessage, Delivery, DynamicEnvelope, Message, MessageEnvelope,
};
use switchyard_domain::time::now;

use crate::behavior::{BehaviorChain, InvocationContext, Terminal};
use crate::config::BusConfig;
use crate::pending::PendingQueries;
use crate::registry::{HandlerDescriptor, KindSelector, SubscriptionRegistry};

/// Per-call options for publishes and queries.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Publish-time filter; a rejected message reaches no handler.
    pub filter: Option<MessageFilter>,
    /// Caller-side cancellation.
    pub cancellation: Option<CancellationToken>,
    /// Replaces the bus default chain for this call.
    pub behaviors: Option<BehaviorChain>,
    /// Query deadline; the bus default applies when unset.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    /// Gate the message with `filter`.
    #[must_use]
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Abort when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Use `chain` instead of the bus default.
    #[must_use]
    pub fn with_behaviors(mut self, chain: BehaviorChain) -> Self {
        self.behaviors = Some(chain);
        self
    }

    /// Override the query deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error, panicked or were rejected by a behavior.
    pub faulted: usize,
}

impl DeliveryReport {
    /// Handlers the message was dispatched to.
    #[must_use]
    pub fn matched(&self) -> usize {
        self.delivered + self.faulted
    }
}

pub(crate) struct Inner {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) default_behavior: RwLock<BehaviorChain>,
    pub(crate) pending: Arc<PendingQueries>,
    pub(crate) config: BusConfig,
    pub(crate) shutdown: CancellationToken,
}

/// In-process typed publish/subscribe/query bus. Cheap to clone.
#[derive(Clone)]
pub struct EventAggregator {
    pub(crate) inner: Arc<Inner>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for EventAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventAggregator")
            .field("subscriptions", &self.subscription_count())
            .field("pending_queries", &self.pending_queries())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl EventAggregator {
    /// Create a bus with an empty default behavior chain.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: SubscriptionRegistry::new(),
                default_behavior: RwLock::new(BehaviorChain::new()),
                pending: Arc::new(PendingQueries::new(config.response_buffer)),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    // -- subscriptions -----------------------------------------------------

    /// Subscribe a handler that runs inline on the publishing task.
    pub fn subscribe<T, F>(&self, handler: F, filter: Option<MessageFilter>) -> SubscriptionToken
    where
        T: BusMessage,
        F: Fn(MessageEnvelope<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(HandlerDescriptor::sync(filter, handler))
    }

    /// Subscribe a handler whose future the publisher awaits.
    pub fn subscribe_async<T, F, Fut>(
        &self,
        handler: F,
        filter: Option<MessageFilter>,
    ) -> SubscriptionToken
    where
        T: BusMessage,
        F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(HandlerDescriptor::asynchronous(filter, handler))
    }

    /// Subscribe a handler that answers queries for `T` with an `R`.
    pub fn subscribe_for_result<T, R, F, Fut>(
        &self,
        handler: F,
        filter: Option<MessageFilter>,
    ) -> SubscriptionToken
    where
        T: BusMessage,
        R: Send + Sync + 'static,
        F: Fn(MessageEnvelope<T>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.register(HandlerDescriptor::with_result(filter, handler))
    }

    /// Subscribe to a whole kind family, or to everything.
    pub fn subscribe_dynamic<F>(
        &self,
        selector: KindSelector,
        handler: F,
        filter: Option<MessageFilter>,
    ) -> SubscriptionToken
    where
        F: Fn(DynamicEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(HandlerDescriptor::dynamic(selector, filter, handler))
    }

    /// Subscribe a factory; each delivery runs a freshly built handler.
    pub fn subscribe_with_factory<T, M, H>(
        &self,
        factory: M,
        filter: Option<MessageFilter>,
    ) -> SubscriptionToken
    where
        T: BusMessage,
        M: Fn() -> H + Send + Sync + 'static,
        H: FnOnce(MessageEnvelope<T>) -> Result<(), HandlerError>,
    {
        self.register(HandlerDescriptor::from_factory(filter, factory))
    }

    /// Stream every `T` published from now on. Dropping the stream
    /// unsubscribes it.
    #[must_use]
    pub fn observe<T: BusMessage>(&self) -> MessageStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.subscribe::<T, _>(
            move |envelope| {
                // Closed only while the stream is being dropped.
                let _ = tx.send(envelope);
                Ok(())
            },
            None,
        );
        MessageStream {
            inner: UnboundedReceiverStream::new(rx),
            bus: Arc::downgrade(&self.inner),
            token,
        }
    }

    fn register(&self, descriptor: HandlerDescriptor) -> SubscriptionToken {
        let token = self.inner.registry.register(descriptor);
        tracing::trace!(%token, "subscription added");
        token
    }

    /// Remove a subscription. Unknown or repeated tokens are a no-op.
    ///
    /// Returns whether the token was registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let removed = self.inner.registry.revoke(token);
        if removed {
            tracing::trace!(%token, "subscription removed");
        }
        removed
    }

    /// Whether `token` is registered.
    #[must_use]
    pub fn is_subscribed(&self, token: SubscriptionToken) -> bool {
        self.inner.registry.contains(token)
    }

    /// Remove every subscription.
    pub fn clear_subscriptions(&self) {
        self.inner.registry.clear();
        tracing::debug!("all subscriptions cleared");
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Handlers that a publish of `message` would invoke, in invocation
    /// order under the default chain.
    #[must_use]
    pub fn resolve(
        &self,
        message: &AnyMessage,
        filter: Option<&MessageFilter>,
    ) -> Vec<Arc<HandlerDescriptor>> {
        let mut handlers = self.inner.registry.resolve(message, filter);
        self.default_behavior().order(&mut handlers);
        handlers
    }

    // -- behaviors ---------------------------------------------------------

    /// The chain used when a call does not pass its own.
    #[must_use]
    pub fn default_behavior(&self) -> BehaviorChain {
        self.inner
            .default_behavior
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the bus-wide default chain.
    pub fn set_default_behavior(&self, chain: BehaviorChain) {
        *self
            .inner
            .default_behavior
            .write()
            .unwrap_or_else(PoisonError::into_inner) = chain;
    }

    pub(crate) fn chain_for(&self, options: &CallOptions) -> BehaviorChain {
        options
            .behaviors
            .clone()
            .unwrap_or_else(|| self.default_behavior())
    }

    // -- publish -----------------------------------------------------------

    /// Deliver `message` to every matching handler.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Validation`] for an empty topic,
    /// [`BusError::Cancelled`] when the caller's token fires between two
    /// handlers and [`BusError::Closed`] after [`shutdown`](Self::shutdown).
    /// Handler faults are never returned; they are counted in the report.
    #[tracing::instrument(skip_all, fields(kind = %T::KIND, topic = message.topic()))]
    pub async fn publish<T: BusMessage>(
        &self,
        message: Message<T>,
        options: CallOptions,
    ) -> Result<DeliveryReport, BusError> {
        let message = self.admit(message)?;
        self.dispatch(&message, CorrelationId::new(), &options).await
    }

    pub(crate) fn admit<T: BusMessage>(&self, message: Message<T>) -> Result<AnyMessage, BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        if message.topic().is_empty() {
            return Err(ValidationError::EmptyTopic.into());
        }
        Ok(AnyMessage::new(message))
    }

    pub(crate) fn check_live(&self, options: &CallOptions) -> Result<(), BusError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        if options
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
        {
            return Err(BusError::Cancelled);
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        message: &AnyMessage,
        correlation_id: CorrelationId,
        options: &CallOptions,
    ) -> Result<DeliveryReport, BusError> {
        let chain = self.chain_for(options);
        let mut handlers = self.inner.registry.resolve(message, options.filter.as_ref());
        chain.order(&mut handlers);

        let mut report = DeliveryReport::default();
        for handler in &handlers {
            self.check_live(options)?;
            let token = handler.token();
            let ctx = InvocationContext::dispatch(token, message, correlation_id);
            let terminal: &Terminal<'_> = &|| {
                let delivery = Delivery {
                    correlation_id,
                    timestamp: now(),
                    token,
                };
                handler
                    .invoke(message, delivery)
                    .map(|outcome| outcome.map(|_| ()))
                    .boxed()
            };
            match chain.run(&ctx, terminal).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.faulted += 1;
                    tracing::warn!(error = ?err, %token, "handler faulted, continuing delivery");
                }
            }
        }
        tracing::trace!(
            delivered = report.delivered,
            faulted = report.faulted,
            "publish dispatched"
        );
        Ok(report)
    }

    // -- lifecycle ---------------------------------------------------------

    /// Cancel every in-flight query with [`BusError::Closed`] and refuse new
    /// publishes and queries.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!(pending = self.pending_queries(), "bus shutting down");
            self.inner.shutdown.cancel();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Completes when `token` fires; never when there is no token.
pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Stream of envelopes returned by [`EventAggregator::observe`].
pub struct MessageStream<T> {
    inner: UnboundedReceiverStream<MessageEnvelope<T>>,
    bus: Weak<Inner>,
    token: SubscriptionToken,
}

impl<T> MessageStream<T> {
    /// Token of the underlying subscription.
    #[must_use]
    pub fn token(&self) -> SubscriptionToken {
        self.token
    }
}

impl<T> Stream for MessageStream<T> {
    type Item = MessageEnvelope<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<T> Drop for MessageStream<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.registry.revoke(self.token);
        }
    }
}
