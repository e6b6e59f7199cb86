//! Session bookkeeping and topic routing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchyard_app::ports::{BrokerError, ConnectedClient, EmbeddedBroker, LoopbackChannel};
use switchyard_domain::device_message::DeviceMessage;
use switchyard_domain::packet::{Packet, PacketId, SubscriptionRequest};
use switchyard_domain::qos::QualityOfService;
use switchyard_domain::time::{Timestamp, now};
use switchyard_domain::topic::{filter_matches, validate_topic_filter};

use crate::config::BrokerConfig;

struct Session {
    id: u64,
    sender: mpsc::UnboundedSender<Packet>,
    subscriptions: Vec<SubscriptionRequest>,
    connected_at: Timestamp,
}

struct BrokerState {
    config: BrokerConfig,
    running: AtomicBool,
    sessions: RwLock<HashMap<String, Session>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU64,
    next_packet_id: AtomicU16,
}

enum Flow {
    Continue,
    Disconnect,
}

/// In-process broker routing [`Packet`]s between injected sessions.
///
/// Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("running", &self.state.running.load(Ordering::Acquire))
            .field("sessions", &self.state.read_sessions().len())
            .finish()
    }
}

impl MemoryBroker {
    /// Create a stopped broker.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Arc::new(BrokerState {
                config,
                running: AtomicBool::new(false),
                sessions: RwLock::new(HashMap::new()),
                cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
                next_session: AtomicU64::new(0),
                next_packet_id: AtomicU16::new(1),
            }),
        }
    }

    /// Whether the broker accepts sessions.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl EmbeddedBroker for MemoryBroker {
    fn start(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            if state.running.swap(true, Ordering::AcqRel) {
                return Err(BrokerError::AlreadyRunning);
            }
            *state.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
            tracing::info!(max_sessions = ?state.config.max_sessions, "embedded broker started");
            Ok(())
        }
    }

    fn inject_client(&self, client_id: &str, channel: LoopbackChannel) -> Result<(), BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let (sender, receiver) = channel.into_parts();
        let session_id = self.state.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.state.write_sessions();
            if sessions.contains_key(client_id) {
                return Err(BrokerError::DuplicateClient(client_id.to_string()));
            }
            if let Some(limit) = self.state.config.max_sessions
                && sessions.len() >= limit
            {
                return Err(BrokerError::SessionLimit(limit));
            }
            sessions.insert(
                client_id.to_string(),
                Session {
                    id: session_id,
                    sender: sender.clone(),
                    subscriptions: Vec::new(),
                    connected_at: now(),
                },
            );
        }

        let cancel = self.state.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let task = tokio::spawn(serve(
            Arc::clone(&self.state),
            client_id.to_string(),
            session_id,
            sender,
            receiver,
            cancel,
        ));
        let mut tasks = self.state.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
        tracing::debug!(client_id, "session injected");
        Ok(())
    }

    fn connected_clients(&self) -> Vec<ConnectedClient> {
        let mut clients: Vec<ConnectedClient> = self
            .state
            .read_sessions()
            .iter()
            .map(|(client_id, session)| ConnectedClient {
                client_id: client_id.clone(),
                connected_at: session.connected_at,
                subscriptions: session.subscriptions.len(),
            })
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    fn stop(&self) -> impl Future<Output = Result<(), BrokerError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            if !state.running.swap(false, Ordering::AcqRel) {
                return Err(BrokerError::NotRunning);
            }
            state.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
            let tasks = std::mem::take(
                &mut *state.tasks.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for task in tasks {
                if let Err(err) = task.await {
                    tracing::warn!(%err, "session task ended abnormally");
                }
            }
            state.write_sessions().clear();
            tracing::info!("embedded broker stopped");
            Ok(())
        }
    }
}

#[tracing::instrument(name = "session", skip_all, fields(client_id = %client_id))]
async fn serve(
    state: Arc<BrokerState>,
    client_id: String,
    session_id: u64,
    reply: mpsc::UnboundedSender<Packet>,
    mut receiver: mpsc::UnboundedReceiver<Packet>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            packet = receiver.recv() => match packet {
                Some(packet) => packet,
                None => {
                    tracing::debug!("client channel closed");
                    break;
                }
            },
        };
        tracing::trace!(packet = packet.name(), "packet received");
        if let Flow::Disconnect = state.handle(&client_id, &reply, packet) {
            break;
        }
    }
    state.remove_session(&client_id, session_id);
    tracing::info!("client disconnected");
}

impl BrokerState {
    fn handle(
        &self,
        client_id: &str,
        reply: &mpsc::UnboundedSender<Packet>,
        packet: Packet,
    ) -> Flow {
        let response = match packet {
            Packet::Connect { keep_alive, .. } => {
                tracing::info!(keep_alive_secs = keep_alive.as_secs(), "client connected");
                Some(Packet::ConnAck {
                    session_present: false,
                })
            }
            Packet::Subscribe { packet_id, requests } => Some(Packet::SubAck {
                packet_id,
                granted: self.subscribe(client_id, requests),
            }),
            Packet::Unsubscribe { packet_id, filters } => {
                self.unsubscribe(client_id, &filters);
                Some(Packet::UnsubAck { packet_id })
            }
            Packet::Publish { packet_id, message } => {
                if let Err(err) = message.validate() {
                    tracing::warn!(%err, topic = %message.topic, "publish rejected");
                    return Flow::Continue;
                }
                let acknowledge = message.qos.requires_ack();
                self.route(client_id, message);
                packet_id
                    .filter(|_| acknowledge)
                    .map(|packet_id| Packet::PubAck { packet_id })
            }
            Packet::PubAck { packet_id } => {
                tracing::trace!(packet_id, "delivery acknowledged");
                None
            }
            Packet::PingReq => Some(Packet::PingResp),
            Packet::Disconnect => return Flow::Disconnect,
            other => {
                tracing::warn!(packet = other.name(), "unexpected packet from client");
                None
            }
        };
        if let Some(response) = response
            && reply.send(response).is_err()
        {
            return Flow::Disconnect;
        }
        Flow::Continue
    }

    fn subscribe(
        &self,
        client_id: &str,
        requests: Vec<SubscriptionRequest>,
    ) -> Vec<Option<QualityOfService>> {
        let mut sessions = self.write_sessions();
        let Some(session) = sessions.get_mut(client_id) else {
            return vec![None; requests.len()];
        };
        requests
            .into_iter()
            .map(|request| match validate_topic_filter(&request.filter) {
                Ok(()) => {
                    let granted = request.qos;
                    tracing::debug!(
                        filter = %request.filter,
                        qos = granted.level(),
                        "subscription granted"
                    );
                    session
                        .subscriptions
                        .retain(|existing| existing.filter != request.filter);
                    session.subscriptions.push(request);
                    Some(granted)
                }
                Err(err) => {
                    tracing::warn!(%err, filter = %request.filter, "subscription refused");
                    None
                }
            })
            .collect()
    }

    fn unsubscribe(&self, client_id: &str, filters: &[String]) {
        if let Some(session) = self.write_sessions().get_mut(client_id) {
            session
                .subscriptions
                .retain(|existing| !filters.contains(&existing.filter));
        }
    }

    /// Deliver `message` once to every session with a matching filter, at the
    /// highest QoS its matching filters grant, capped by the publish QoS.
    fn route(&self, publisher: &str, message: DeviceMessage) {
        let targets: Vec<(mpsc::UnboundedSender<Packet>, QualityOfService)> = self
            .read_sessions()
            .iter()
            .filter_map(|(client_id, session)| {
                let own = client_id == publisher;
                session
                    .subscriptions
                    .iter()
                    .filter(|subscription| !(own && subscription.no_local))
                    .filter(|subscription| filter_matches(&subscription.filter, &message.topic))
                    .map(|subscription| subscription.qos)
                    .max()
                    .map(|granted| (session.sender.clone(), granted.min(message.qos)))
            })
            .collect();

        tracing::trace!(topic = %message.topic, targets = targets.len(), "routing publish");
        for (sender, qos) in targets {
            let packet_id = qos.requires_ack().then(|| self.next_packet_id());
            let delivery = DeviceMessage {
                qos,
                ..message.clone()
            };
            // A closed sender belongs to a session that is being torn down.
            let _ = sender.send(Packet::Publish {
                packet_id,
                message: delivery,
            });
        }
    }

    fn next_packet_id(&self) -> PacketId {
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn remove_session(&self, client_id: &str, session_id: u64) {
        let mut sessions = self.write_sessions();
        if sessions.get(client_id).is_some_and(|session| session.id == session_id) {
            sessions.remove(client_id);
        }
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
