//! Re-runs failed invocations a bounded number of times.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use switchyard_domain::error::BusError;

use super::{Behavior, InvocationContext, Next};

/// Retries handler faults and transport errors.
///
/// Coordinator outcomes (timeout, cancellation, shutdown, open circuit,
/// validation) are returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryBehavior {
    max_attempts: u32,
    delay: Duration,
}

impl RetryBehavior {
    /// Run at most `max_attempts` times (at least once), pausing `delay`
    /// between attempts.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    fn is_retryable(err: &BusError) -> bool {
        matches!(err, BusError::HandlerFault { .. } | BusError::Transport(_))
    }
}

impl Behavior for RetryBehavior {
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let mut attempt = 1;
            loop {
                match next.run().await {
                    Err(err) if attempt < self.max_attempts && Self::is_retryable(&err) => {
                        tracing::debug!(
                            error = %err,
                            key = %ctx.key(),
                            attempt,
                            max_attempts = self.max_attempts,
                            "retrying invocation"
                        );
                        attempt += 1;
                        if !self.delay.is_zero() {
                            tokio::time::sleep(self.delay).await;
                        }
                    }
                    result => return result,
                }
            }
        }
        .boxed()
    }
}
