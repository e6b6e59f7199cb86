//! Broker ports — the embedded broker and the wire clients attached to it.
//!
//! A client reaches the broker through a [`LoopbackChannel`] pair: one end is
//! injected into the broker as an already-connected session, the other end
//! is handed to a [`WireClient`] built by a [`WireClientFactory`].

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use switchyard_domain::device_message::DeviceMessage;
use switchyard_domain::error::{BusError, ValidationError};
use switchyard_domain::packet::{Packet, SubscriptionRequest};
use switchyard_domain::qos::QualityOfService;
use switchyard_domain::time::Timestamp;

/// Errors raised by brokers and wire clients.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker has not been started, or was stopped.
    #[error("broker is not running")]
    NotRunning,

    /// `start` was called twice.
    #[error("broker is already running")]
    AlreadyRunning,

    /// A session with this client id already exists.
    #[error("client {0:?} is already connected")]
    DuplicateClient(String),

    /// The broker refuses more sessions.
    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    /// The peer end of a loopback channel is gone.
    #[error("loopback channel closed")]
    ChannelClosed,

    /// No acknowledgement arrived in time.
    #[error("no {packet} received in time")]
    AckTimeout {
        /// Name of the awaited acknowledgement packet.
        packet: &'static str,
    },

    /// The broker refused a subscription.
    #[error("subscription to {0:?} refused")]
    Refused(String),

    /// The client was used out of order (e.g. publish before connect).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A topic or filter was rejected.
    #[error("validation error")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    /// Convert into the bus error type.
    #[must_use]
    pub fn into_domain(self) -> BusError {
        match self {
            Self::Validation(err) => BusError::Validation(err),
            other => BusError::Transport(Box::new(other)),
        }
    }
}

/// One end of an in-process packet pipe.
#[derive(Debug)]
pub struct LoopbackChannel {
    tx: mpsc::UnboundedSender<Packet>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl LoopbackChannel {
    /// Two connected ends: what one sends, the other receives.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }

    /// Send a packet to the other end.
    ///
    /// # Errors
    ///
    /// [`BrokerError::ChannelClosed`] when the other end was dropped.
    pub fn send(&self, packet: Packet) -> Result<(), BrokerError> {
        self.tx.send(packet).map_err(|_| BrokerError::ChannelClosed)
    }

    /// Next packet from the other end; `None` once it is dropped.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Split into sender and receiver halves.
    #[must_use]
    pub fn into_parts(self) -> (mpsc::UnboundedSender<Packet>, mpsc::UnboundedReceiver<Packet>) {
        (self.tx, self.rx)
    }
}

/// A session as listed by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedClient {
    /// Client identifier.
    pub client_id: String,
    /// When the session was created.
    pub connected_at: Timestamp,
    /// Number of active topic filters.
    pub subscriptions: usize,
}

/// In-process broker accepting injected loopback sessions.
pub trait EmbeddedBroker: Send + Sync + 'static {
    /// Start accepting sessions.
    fn start(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Attach `channel` as an already-connected session named `client_id`.
    ///
    /// # Errors
    ///
    /// Fails when the broker is not running or the id is taken.
    fn inject_client(&self, client_id: &str, channel: LoopbackChannel) -> Result<(), BrokerError>;

    /// Snapshot of the current sessions.
    fn connected_clients(&self) -> Vec<ConnectedClient>;

    /// Close every session and stop accepting new ones.
    fn stop(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

impl<T: EmbeddedBroker> EmbeddedBroker for Arc<T> {
    fn start(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        (**self).start()
    }

    fn inject_client(&self, client_id: &str, channel: LoopbackChannel) -> Result<(), BrokerError> {
        (**self).inject_client(client_id, channel)
    }

    fn connected_clients(&self) -> Vec<ConnectedClient> {
        (**self).connected_clients()
    }

    fn stop(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        (**self).stop()
    }
}

/// A client speaking to the broker over a loopback channel.
pub trait WireClient: Send + Sync + 'static {
    /// Open the session and wait for the broker's acknowledgement.
    fn connect(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Add a subscription and return the granted QoS.
    fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> impl Future<Output = Result<QualityOfService, BrokerError>> + Send;

    /// Publish a message; waits for the acknowledgement when its QoS requires one.
    fn publish(
        &self,
        message: DeviceMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Messages delivered by the broker. Can be taken once.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<DeviceMessage>>;

    /// Close the session.
    fn disconnect(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Builds wire clients on top of loopback channels.
pub trait WireClientFactory: Send + Sync + 'static {
    /// Client type produced.
    type Client: WireClient;

    /// Build a client named `client_id` talking over `channel`.
    fn create(&self, client_id: &str, channel: LoopbackChannel) -> Self::Client;
}

impl<T: WireClientFactory> WireClientFactory for Arc<T> {
    type Client = T::Client;

    fn create(&self, client_id: &str, channel: LoopbackChannel) -> Self::Client {
        (**self).create(client_id, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_cross_packets_between_paired_ends() {
        let (mut left, mut right) = LoopbackChannel::pair();

        left.send(Packet::PingReq).unwrap();
        right.send(Packet::PingResp).unwrap();

        assert_eq!(right.recv().await, Some(Packet::PingReq));
        assert_eq!(left.recv().await, Some(Packet::PingResp));
    }

    #[test]
    fn should_report_closed_peer() {
        let (left, right) = LoopbackChannel::pair();
        drop(right);
        assert!(matches!(left.send(Packet::Disconnect), Err(BrokerError::ChannelClosed)));
    }

    #[test]
    fn should_map_validation_into_domain_validation() {
        let err = BrokerError::Validation(ValidationError::EmptyTopic).into_domain();
        assert!(matches!(err, BusError::Validation(ValidationError::EmptyTopic)));
    }

    #[test]
    fn should_map_transport_failures_into_transport() {
        let err = BrokerError::ChannelClosed.into_domain();
        assert!(matches!(err, BusError::Transport(_)));
    }
}
