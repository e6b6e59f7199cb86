//! Device message broker — bridges the wire protocol and the bus.
//!
//! ## Lifecycle
//! `Created → Initializing → Running → Closing → Closed`.
//!
//! [`initialize`](DeviceMessageBroker::initialize) starts the embedded
//! broker, injects the loopback session, connects the outbound-facing client
//! and subscribes it to `#`. While running:
//! - every message the client receives is handed to the matching topic
//!   subscriptions, then published on the bus as `Message<DeviceMessage>`
//!   on its own task, so a slow bus handler never holds up later messages;
//! - [`publish`](DeviceMessageBroker::publish) and bus publishes of
//!   [`OutboundDeviceMessage`] are queued for the client and sent by a
//!   background task; send failures are logged.
//!
//! Every operation other than `initialize` fails with
//! [`BridgeError::NotRunning`] outside the `Running` state.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use switchyard_domain::device_message::{DeviceMessage, OutboundDeviceMessage};
use switchyard_domain::error::{BusError, HandlerError, HandlerPanic, ValidationError};
use switchyard_domain::filter::TopicPattern;
use switchyard_domain::id::{PatternSubscriptionId, SubscriptionToken};
use switchyard_domain::message::Message;
use switchyard_domain::packet::SubscriptionRequest;
use switchyard_domain::qos::QualityOfService;
use switchyard_domain::topic::MULTI_LEVEL_WILDCARD;

use crate::config::BridgeConfig;
use crate::event_aggregator::{CallOptions, EventAggregator};
use crate::ports::{
    BrokerError, ConnectedClient, EmbeddedBroker, LoopbackChannel, WireClient, WireClientFactory,
};

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Constructed, nothing started.
    Created,
    /// `initialize` in progress.
    Initializing,
    /// Relaying traffic.
    Running,
    /// `close` in progress.
    Closing,
    /// Stopped for good.
    Closed,
}

/// Errors returned by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The operation needs a running bridge.
    #[error("device message broker is not running (state: {0:?})")]
    NotRunning(BridgeState),

    /// The lifecycle does not allow this step.
    #[error("cannot move device message broker from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: BridgeState,
        /// Requested state.
        to: BridgeState,
    },

    /// Broker or client failure during start-up.
    #[error("broker error")]
    Broker(#[from] BrokerError),

    /// Invalid topic, pattern or API parameter.
    #[error("validation error")]
    Validation(#[from] ValidationError),
}

impl BridgeError {
    /// Convert into the bus error type.
    #[must_use]
    pub fn into_domain(self) -> BusError {
        match self {
            Self::Validation(err) => BusError::Validation(err),
            Self::Broker(err) => err.into_domain(),
            other => BusError::Transport(Box::new(other)),
        }
    }
}

type DeviceCallback = dyn Fn(&DeviceMessage) -> Result<(), HandlerError> + Send + Sync;

struct PatternSubscription {
    id: PatternSubscriptionId,
    pattern: TopicPattern,
    callback: Box<DeviceCallback>,
}

struct RunningParts<C> {
    client: Arc<C>,
    outbound: mpsc::UnboundedSender<DeviceMessage>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    bus_token: SubscriptionToken,
}

struct BridgeInner<B, F: WireClientFactory> {
    broker: B,
    clients: F,
    bus: EventAggregator,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
    subscriptions: RwLock<Arc<Vec<Arc<PatternSubscription>>>>,
    running: Mutex<Option<RunningParts<F::Client>>>,
}

/// Bridge between the embedded broker and the bus. Cheap to clone.
pub struct DeviceMessageBroker<B, F: WireClientFactory> {
    inner: Arc<BridgeInner<B, F>>,
}

impl<B, F: WireClientFactory> Clone for DeviceMessageBroker<B, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: EmbeddedBroker, F: WireClientFactory> DeviceMessageBroker<B, F> {
    /// Create a bridge in the `Created` state.
    pub fn new(broker: B, clients: F, bus: EventAggregator, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                broker,
                clients,
                bus,
                config,
                state: Mutex::new(BridgeState::Created),
                subscriptions: RwLock::new(Arc::default()),
                running: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the broker and the loopback client, then begin relaying.
    ///
    /// On failure the bridge returns to `Created` and may be initialized again.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidTransition`] unless the bridge is `Created`;
    /// [`BridgeError::Broker`] when the broker or the client fails to start.
    #[tracing::instrument(skip(self), fields(client_id = %self.inner.config.loopback_client_id))]
    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.transition(BridgeState::Created, BridgeState::Initializing)?;
        match self.bring_up().await {
            Ok(parts) => {
                *self.inner.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(parts);
                self.set_state(BridgeState::Running);
                tracing::info!("device message broker running");
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, "device message broker failed to start");
                if let Err(stop_err) = self.inner.broker.stop().await {
                    tracing::warn!(err = %stop_err, "failed to stop broker after start-up failure");
                }
                self.set_state(BridgeState::Created);
                Err(err)
            }
        }
    }

    async fn bring_up(&self) -> Result<RunningParts<F::Client>, BridgeError> {
        let inner = &self.inner;
        let client_id = inner.config.loopback_client_id.as_str();

        inner.broker.start().await?;
        let (broker_end, client_end) = LoopbackChannel::pair();
        inner.broker.inject_client(client_id, broker_end)?;

        let client = Arc::new(inner.clients.create(client_id, client_end));
        client.connect().await?;
        client
            .subscribe(SubscriptionRequest::new(
                MULTI_LEVEL_WILDCARD,
                QualityOfService::AtMostOnce,
            ))
            .await?;
        let incoming = client
            .take_incoming()
            .ok_or(BrokerError::Protocol("incoming messages already taken"))?;

        let cancel = CancellationToken::new();
        let (outbound, queue) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(relay_inbound(Arc::clone(inner), incoming, cancel.clone())),
            tokio::spawn(drain_outbound(Arc::clone(&client), queue, cancel.clone())),
        ];

        let forward = outbound.clone();
        let bus_token = inner.bus.subscribe::<OutboundDeviceMessage, _>(
            move |envelope| {
                forward
                    .send(envelope.payload().0.clone())
                    .map_err(|_| HandlerError::from("outbound queue closed"))
            },
            None,
        );

        Ok(RunningParts {
            client,
            outbound,
            cancel,
            tasks,
            bus_token,
        })
    }

    /// Queue a message for the wire.
    ///
    /// Transport failures happen later on the sender task and are logged.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`] outside `Running`;
    /// [`BridgeError::Validation`] for an empty topic or one with wildcards.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QualityOfService,
    ) -> Result<(), BridgeError> {
        self.publish_message(DeviceMessage::new(topic, payload, qos))
    }

    pub(crate) fn publish_message(&self, message: DeviceMessage) -> Result<(), BridgeError> {
        self.ensure_running()?;
        message.validate()?;
        let running = self.inner.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parts) = running.as_ref()
            && let Err(err) = parts.outbound.send(message)
        {
            tracing::warn!(topic = %err.0.topic, "outbound queue closed, message dropped");
        }
        Ok(())
    }

    /// Call `callback` for every wire message whose topic matches
    /// `topic_pattern` (case-insensitive regex, or an MQTT filter).
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`] outside `Running`;
    /// [`BridgeError::Validation`] for a malformed pattern.
    pub fn subscribe<C>(
        &self,
        topic_pattern: &str,
        callback: C,
    ) -> Result<PatternSubscriptionId, BridgeError>
    where
        C: Fn(&DeviceMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let subscription = Arc::new(PatternSubscription {
            id: PatternSubscriptionId::new(),
            pattern: TopicPattern::new(topic_pattern)?,
            callback: Box::new(callback),
        });
        let id = subscription.id;
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(subscriptions.len() + 1);
        next.extend(subscriptions.iter().cloned());
        next.push(subscription);
        *subscriptions = Arc::new(next);
        tracing::debug!(%id, pattern = topic_pattern, "topic subscription added");
        Ok(id)
    }

    /// Remove a topic subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: PatternSubscriptionId) -> bool {
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.iter().any(|subscription| subscription.id == id) {
            return false;
        }
        let next = subscriptions
            .iter()
            .filter(|subscription| subscription.id != id)
            .cloned()
            .collect();
        *subscriptions = Arc::new(next);
        true
    }

    /// Sessions currently attached to the broker.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotRunning`] outside `Running`.
    pub fn connected_clients(&self) -> Result<Vec<ConnectedClient>, BridgeError> {
        self.ensure_running()?;
        Ok(self.inner.broker.connected_clients())
    }

    /// Stop relaying, disconnect the loopback client and stop the broker.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidTransition`] unless the bridge is `Running`.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.transition(BridgeState::Running, BridgeState::Closing)?;

        let parts = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(parts) = parts {
            self.inner.bus.unsubscribe(parts.bus_token);
            parts.cancel.cancel();
            for task in parts.tasks {
                if let Err(err) = task.await {
                    tracing::warn!(%err, "bridge task ended abnormally");
                }
            }
            if let Err(err) = parts.client.disconnect().await {
                tracing::warn!(%err, "failed to disconnect loopback client");
            }
        }
        if let Err(err) = self.inner.broker.stop().await {
            tracing::warn!(%err, "failed to stop embedded broker");
        }
        *self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::default();

        self.set_state(BridgeState::Closed);
        tracing::info!("device message broker closed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), BridgeError> {
        match self.state() {
            BridgeState::Running => Ok(()),
            other => Err(BridgeError::NotRunning(other)),
        }
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> Result<(), BridgeError> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(BridgeError::InvalidTransition { from: *state, to });
        }
        *state = to;
        tracing::debug!(?from, ?to, "bridge state changed");
        Ok(())
    }

    fn set_state(&self, to: BridgeState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl<B, F: WireClientFactory> BridgeInner<B, F> {
    fn notify_subscribers(&self, message: &DeviceMessage) {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscription in subscriptions
            .iter()
            .filter(|subscription| subscription.pattern.is_match(&message.topic))
        {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (subscription.callback)(message)
            }));
            let failure: HandlerError = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(payload) => Box::new(HandlerPanic::from_payload(payload.as_ref())),
            };
            tracing::warn!(
                error = %failure,
                id = %subscription.id,
                pattern = subscription.pattern.as_str(),
                topic = %message.topic,
                "topic subscriber faulted"
            );
        }
    }
}

async fn relay_inbound<B, F>(
    inner: Arc<BridgeInner<B, F>>,
    mut incoming: mpsc::UnboundedReceiver<DeviceMessage>,
    cancel: CancellationToken,
) where
    B: EmbeddedBroker,
    F: WireClientFactory,
{
    let mut dispatches = JoinSet::new();
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            Some(joined) = dispatches.join_next() => {
                log_dispatch_outcome(joined);
                continue;
            }
            message = incoming.recv() => match message {
                Some(message) => message,
                None => {
                    tracing::debug!("loopback client stream ended");
                    break;
                }
            },
        };
        tracing::trace!(
            topic = %message.topic,
            payload = %message.payload_text(),
            "broker received message"
        );
        inner.notify_subscribers(&message);

        let bus = inner.bus.clone();
        let qos = message.qos;
        let bus_message = Message::new(message.topic.clone(), message).with_qos(qos);
        dispatches.spawn(async move {
            if let Err(err) = bus.publish(bus_message, CallOptions::default()).await {
                tracing::warn!(%err, "failed to relay device message onto the bus");
            }
        });
    }
    settle_dispatches(dispatches, inner.config.drain_timeout()).await;
}

async fn settle_dispatches(mut dispatches: JoinSet<()>, grace: Duration) {
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = dispatches.join_next().await {
            log_dispatch_outcome(joined);
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            pending = dispatches.len(),
            "aborting bus dispatches still running at close"
        );
        dispatches.abort_all();
    }
}

fn log_dispatch_outcome(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        tracing::warn!(%err, "bus dispatch task ended abnormally");
    }
}

async fn drain_outbound<C: WireClient>(
    client: Arc<C>,
    mut queue: mpsc::UnboundedReceiver<DeviceMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let topic = message.topic.clone();
        match client.publish(message).await {
            Ok(()) => tracing::trace!(%topic, "published message"),
            Err(err) => tracing::error!(%err, %topic, "failed to publish message"),
        }
    }
}
