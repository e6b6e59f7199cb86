//! Table of in-flight query waiters keyed by correlation id.
//!
//! A waiter is registered together with a [`WaiterGuard`]; dropping the
//! guard removes the entry, whatever way the query ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use switchyard_domain::id::CorrelationId;

use crate::registry::Response;

enum WaiterSender {
    Unbounded(mpsc::UnboundedSender<Response>),
    Bounded(mpsc::Sender<Response>),
}

/// Receiving side of one waiter.
pub(crate) enum WaiterReceiver {
    Unbounded(mpsc::UnboundedReceiver<Response>),
    Bounded(mpsc::Receiver<Response>),
}

impl WaiterReceiver {
    /// Next response. Pending while the waiter is registered.
    pub(crate) async fn recv(&mut self) -> Option<Response> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

/// Shared waiter table.
pub(crate) struct PendingQueries {
    waiters: Mutex<HashMap<CorrelationId, WaiterSender>>,
    capacity: Option<usize>,
    dropped: AtomicU64,
}

impl PendingQueries {
    /// `capacity` bounds each waiter's channel; `None` leaves it unbounded.
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            capacity: capacity.map(|capacity| capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a waiter for `correlation_id`.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
    ) -> (WaiterGuard, WaiterReceiver) {
        let (sender, receiver) = match self.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (WaiterSender::Bounded(tx), WaiterReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (WaiterSender::Unbounded(tx), WaiterReceiver::Unbounded(rx))
            }
        };
        self.lock().insert(correlation_id, sender);
        let guard = WaiterGuard {
            table: Arc::clone(self),
            correlation_id,
        };
        (guard, receiver)
    }

    /// Hand `response` to the waiter for `correlation_id`.
    ///
    /// Returns `false` when no waiter exists or its buffer is full.
    pub(crate) fn offer(&self, correlation_id: CorrelationId, response: Response) -> bool {
        let waiters = self.lock();
        let Some(sender) = waiters.get(&correlation_id) else {
            tracing::trace!(%correlation_id, "response without waiter discarded");
            return false;
        };
        match sender {
            WaiterSender::Unbounded(tx) => tx.send(response).is_ok(),
            WaiterSender::Bounded(tx) => match tx.try_send(response) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        %correlation_id,
                        dropped,
                        "query response buffer full, response dropped"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        }
    }

    /// Number of registered waiters.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Responses dropped because a bounded buffer was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn remove(&self, correlation_id: CorrelationId) {
        self.lock().remove(&correlation_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, WaiterSender>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its waiter from the table when dropped.
pub(crate) struct WaiterGuard {
    table: Arc<PendingQueries>,
    correlation_id: CorrelationId,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.table.remove(self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_route_response_to_registered_waiter() {
        let table = Arc::new(PendingQueries::new(None));
        let id = CorrelationId::new();
        let (_guard, mut rx) = table.register(id);

        assert!(table.offer(id, Arc::new(7_u32)));
        let response = rx.recv().await.unwrap();
        assert_eq!(response.downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn should_remove_waiter_when_guard_drops() {
        let table = Arc::new(PendingQueries::new(None));
        let id = CorrelationId::new();
        let (guard, _rx) = table.register(id);
        assert_eq!(table.len(), 1);

        drop(guard);

        assert_eq!(table.len(), 0);
        assert!(!table.offer(id, Arc::new(())));
    }

    #[test]
    fn should_drop_and_count_overflowing_responses() {
        let table = Arc::new(PendingQueries::new(Some(1)));
        let id = CorrelationId::new();
        let (_guard, _rx) = table.register(id);

        assert!(table.offer(id, Arc::new(1_u8)));
        assert!(!table.offer(id, Arc::new(2_u8)));
        assert_eq!(table.dropped(), 1);
    }
}
