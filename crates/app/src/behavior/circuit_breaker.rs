//! Stops invoking a target after repeated failures.
//!
//! State is kept per [`InvocationContext::key`]: each handler token (or each
//! query kind) has its own breaker. After `failure_threshold` consecutive
//! failures the breaker opens and rejects invocations with
//! [`BusError::CircuitOpen`] for `cooldown`. The first invocation after the
//! cooldown is a trial: success closes the breaker, failure reopens it.
//!
//! Failures older than `cooldown` are forgotten, so targets that stop being
//! invoked (an unsubscribed handler) do not stay in the table.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use switchyard_domain::error::BusError;

use super::{Behavior, InvocationContext, Next};

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    last_seen: Instant,
}

impl BreakerState {
    fn is_stale(&self, now: Instant, cooldown: Duration) -> bool {
        self.open_until.is_none_or(|until| until <= now) && self.last_seen + cooldown <= now
    }
}

/// Per-target circuit breaker.
#[derive(Debug)]
pub struct CircuitBreakerBehavior {
    failure_threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerBehavior {
    /// Open after `failure_threshold` consecutive failures, for `cooldown`.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the breaker for `key` currently rejects invocations.
    #[must_use]
    pub fn is_open(&self, key: &str) -> bool {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .get(key)
            .and_then(|state| state.open_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Forget the state kept for `key`. Returns whether any was kept.
    pub fn reset(&self, key: &str) -> bool {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Number of targets with recorded failures.
    #[must_use]
    pub fn tracked_targets(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn admit(&self, key: &str) -> Result<(), BusError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = states.get_mut(key) else {
            return Ok(());
        };
        match state.open_until {
            Some(until) if until > Instant::now() => Err(BusError::CircuitOpen {
                key: key.to_string(),
                remaining: until - Instant::now(),
            }),
            Some(_) => {
                tracing::debug!(key, "circuit half-open, allowing trial invocation");
                state.open_until = None;
                state.last_seen = Instant::now();
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record(&self, key: &str, result: &Result<(), BusError>) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                states.remove(key);
            }
            Err(BusError::Cancelled | BusError::CircuitOpen { .. }) => {}
            Err(err) => {
                let now = Instant::now();
                states.retain(|tracked, state| {
                    tracked == key || !state.is_stale(now, self.cooldown)
                });
                let state = states.entry(key.to_string()).or_insert(BreakerState {
                    consecutive_failures: 0,
                    open_until: None,
                    last_seen: now,
                });
                if state.is_stale(now, self.cooldown) {
                    state.consecutive_failures = 0;
                }
                state.last_seen = now;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.failure_threshold {
                    state.open_until = Some(now + self.cooldown);
                    tracing::warn!(
                        error = %err,
                        key,
                        failures = state.consecutive_failures,
                        cooldown_ms = u64::try_from(self.cooldown.as_millis()).unwrap_or(u64::MAX),
                        "circuit opened"
                    );
                }
            }
        }
    }
}

impl Behavior for CircuitBreakerBehavior {
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let key = ctx.key();
            self.admit(&key)?;
            let result = next.run().await;
            self.record(&key, &result);
            result
        }
        .boxed()
    }
}
