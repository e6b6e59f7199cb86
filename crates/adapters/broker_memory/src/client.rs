//! Loopback wire client — request/acknowledgement pairing over a channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use switchyard_app::ports::{BrokerError, LoopbackChannel, WireClient, WireClientFactory};
use switchyard_domain::device_message::DeviceMessage;
use switchyard_domain::packet::{Packet, PacketId, SubscriptionRequest};
use switchyard_domain::qos::QualityOfService;

use crate::config::BrokerConfig;

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKey {
    Connect,
    /// `PingResp` carries no id; the oldest outstanding ping is answered first.
    Ping(u64),
    Packet(PacketId),
}

struct Pending {
    outgoing: mpsc::UnboundedSender<Packet>,
    waiters: Mutex<HashMap<AckKey, oneshot::Sender<Packet>>>,
}

impl Pending {
    fn complete(&self, key: AckKey, packet: Packet) {
        let waiter = self.lock().remove(&key);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(packet);
            }
            None => {
                tracing::debug!(?key, packet = packet.name(), "acknowledgement without request");
            }
        }
    }

    fn complete_oldest_ping(&self, packet: Packet) {
        let oldest = self
            .lock()
            .keys()
            .filter_map(|key| match key {
                AckKey::Ping(sequence) => Some(*sequence),
                _ => None,
            })
            .min();
        match oldest {
            Some(sequence) => self.complete(AckKey::Ping(sequence), packet),
            None => tracing::debug!("PINGRESP without outstanding ping"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AckKey, oneshot::Sender<Packet>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ClientInner {
    client_id: String,
    ack_timeout: Duration,
    keep_alive: Duration,
    pending: Arc<Pending>,
    channel: Mutex<Option<mpsc::UnboundedReceiver<Packet>>>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<DeviceMessage>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceMessage>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_packet_id: AtomicU16,
    next_ping: AtomicU64,
}

/// Removes a request's waiter however the request ends.
struct WaiterGuard<'a> {
    pending: &'a Pending,
    key: AckKey,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// A [`WireClient`] speaking to the embedded broker over a [`LoopbackChannel`].
pub struct LoopbackClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for LoopbackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackClient")
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}

impl LoopbackClient {
    /// Build a client over `channel`. Nothing is sent until [`connect`](WireClient::connect).
    #[must_use]
    pub fn new(
        client_id: &str,
        channel: LoopbackChannel,
        ack_timeout: Duration,
        keep_alive: Duration,
    ) -> Self {
        let (outgoing, receiver) = channel.into_parts();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                client_id: client_id.to_string(),
                ack_timeout,
                keep_alive,
                pending: Arc::new(Pending {
                    outgoing,
                    waiters: Mutex::new(HashMap::new()),
                }),
                channel: Mutex::new(Some(receiver)),
                incoming_tx: Mutex::new(Some(incoming_tx)),
                incoming_rx: Mutex::new(Some(incoming_rx)),
                driver: Mutex::new(None),
                next_packet_id: AtomicU16::new(1),
                next_ping: AtomicU64::new(0),
            }),
        }
    }

    /// Client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Remove topic filters.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AckTimeout`] when the broker does not answer in time,
    /// [`BrokerError::ChannelClosed`] when the session is gone.
    pub async fn unsubscribe(&self, filters: Vec<String>) -> Result<(), BrokerError> {
        let packet_id = self.inner.next_packet_id();
        self.inner
            .request(AckKey::Packet(packet_id), Packet::Unsubscribe { packet_id, filters })
            .await
            .map(|_| ())
    }

    /// Round-trip a `PingReq`.
    ///
    /// # Errors
    ///
    /// Same as [`unsubscribe`](Self::unsubscribe).
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let sequence = self.inner.next_ping.fetch_add(1, Ordering::Relaxed);
        self.inner
            .request(AckKey::Ping(sequence), Packet::PingReq)
            .await
            .map(|_| ())
    }
}

impl ClientInner {
    fn next_packet_id(&self) -> PacketId {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    async fn request(&self, key: AckKey, packet: Packet) -> Result<Packet, BrokerError> {
        let name = packet.name();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        let _waiter = WaiterGuard {
            pending: &self.pending,
            key,
        };
        if self.pending.outgoing.send(packet).is_err() {
            return Err(BrokerError::ChannelClosed);
        }
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(BrokerError::ChannelClosed),
            Err(_) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    packet = name,
                    "acknowledgement timed out"
                );
                Err(BrokerError::AckTimeout { packet: name })
            }
        }
    }
}

impl WireClient for LoopbackClient {
    fn connect(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let receiver = inner.channel.lock().unwrap_or_else(PoisonError::into_inner).take();
            let incoming = inner.incoming_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
            let (Some(receiver), Some(incoming)) = (receiver, incoming) else {
                return Err(BrokerError::Protocol("client already connected"));
            };
            let driver = tokio::spawn(drive(Arc::clone(&inner.pending), receiver, incoming));
            *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

            let packet = Packet::Connect {
                client_id: inner.client_id.clone(),
                keep_alive: inner.keep_alive,
            };
            match inner.request(AckKey::Connect, packet).await? {
                Packet::ConnAck { .. } => {
                    tracing::debug!(client_id = %inner.client_id, "loopback client connected");
                    Ok(())
                }
                _ => Err(BrokerError::Protocol("expected CONNACK")),
            }
        }
    }

    fn subscribe(
        &self,
        request: SubscriptionRequest,
    ) -> impl Future<Output = Result<QualityOfService, BrokerError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let packet_id = inner.next_packet_id();
            let filter = request.filter.clone();
            let packet = Packet::Subscribe {
                packet_id,
                requests: vec![request],
            };
            match inner.request(AckKey::Packet(packet_id), packet).await? {
                Packet::SubAck { granted, .. } => match granted.first() {
                    Some(Some(qos)) => Ok(*qos),
                    Some(None) => Err(BrokerError::Refused(filter)),
                    None => Err(BrokerError::Protocol("empty SUBACK")),
                },
                _ => Err(BrokerError::Protocol("expected SUBACK")),
            }
        }
    }

    fn publish(
        &self,
        message: DeviceMessage,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            message.validate()?;
            if !message.qos.requires_ack() {
                return inner
                    .pending
                    .outgoing
                    .send(Packet::Publish {
                        packet_id: None,
                        message,
                    })
                    .map_err(|_| BrokerError::ChannelClosed);
            }
            let packet_id = inner.next_packet_id();
            let packet = Packet::Publish {
                packet_id: Some(packet_id),
                message,
            };
            match inner.request(AckKey::Packet(packet_id), packet).await? {
                Packet::PubAck { .. } => Ok(()),
                _ => Err(BrokerError::Protocol("expected PUBACK")),
            }
        }
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<DeviceMessage>> {
        self.inner
            .incoming_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn disconnect(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        let inner = Arc::clone(&self.inner);
        async move {
            let sent = inner
                .pending
                .outgoing
                .send(Packet::Disconnect)
                .map_err(|_| BrokerError::ChannelClosed);
            let driver = inner.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut driver) = driver
                && tokio::time::timeout(inner.ack_timeout, &mut driver).await.is_err()
            {
                driver.abort();
            }
            tracing::debug!(client_id = %inner.client_id, "loopback client disconnected");
            sent
        }
    }
}

async fn drive(
    pending: Arc<Pending>,
    mut receiver: mpsc::UnboundedReceiver<Packet>,
    incoming: mpsc::UnboundedSender<DeviceMessage>,
) {
    while let Some(packet) = receiver.recv().await {
        match packet {
            Packet::ConnAck { .. } => pending.complete(AckKey::Connect, packet),
            Packet::PingResp => pending.complete_oldest_ping(packet),
            Packet::SubAck { packet_id, .. }
            | Packet::UnsubAck { packet_id }
            | Packet::PubAck { packet_id } => pending.complete(AckKey::Packet(packet_id), packet),
            Packet::Publish { packet_id, message } => {
                if let Some(packet_id) = packet_id
                    && message.qos.requires_ack()
                {
                    let _ = pending.outgoing.send(Packet::PubAck { packet_id });
                }
                if incoming.send(message).is_err() {
                    tracing::trace!("incoming receiver dropped, message discarded");
                }
            }
            Packet::Disconnect => break,
            other => tracing::warn!(packet = other.name(), "unexpected packet from broker"),
        }
    }
    // Dropping the waiters fails every outstanding request with ChannelClosed.
    pending.lock().clear();
}

/// Builds [`LoopbackClient`]s with shared timeouts.
#[derive(Debug, Clone)]
pub struct LoopbackClientFactory {
    ack_timeout: Duration,
    keep_alive: Duration,
}

impl Default for LoopbackClientFactory {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

impl LoopbackClientFactory {
    /// Clients acknowledge within the broker's configured timeout.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            ack_timeout: config.ack_timeout(),
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }

    /// Keep-alive announced in `Connect`.
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl WireClientFactory for LoopbackClientFactory {
    type Client = LoopbackClient;

    fn create(&self, client_id: &str, channel: LoopbackChannel) -> LoopbackClient {
        LoopbackClient::new(client_id, channel, self.ack_timeout, self.keep_alive)
    }
}
