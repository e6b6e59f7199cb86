//! Spaces invocations by a minimum interval.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use switchyard_domain::error::BusError;

use super::{Behavior, InvocationContext, Next};

/// Delays each invocation so that consecutive starts are at least
/// `min_interval` apart. Slots are handed out in call order.
#[derive(Debug)]
pub struct ThrottleBehavior {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl ThrottleBehavior {
    /// Throttle to one start per `min_interval`.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    fn reserve(&self) -> Instant {
        let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let start = next_slot.map_or(now, |slot| slot.max(now));
        *next_slot = Some(start + self.min_interval);
        start
    }
}

impl Behavior for ThrottleBehavior {
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let start = self.reserve();
            if start > Instant::now() {
                tracing::trace!(key = %ctx.key(), "throttling invocation");
                tokio::time::sleep_until(start).await;
            }
            next.run().await
        }
        .boxed()
    }
}
