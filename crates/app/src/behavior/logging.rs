//! Logs every wrapped invocation with its outcome and duration.

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use switchyard_domain::error::BusError;

use super::{Behavior, InvocationContext, Next};

/// Emits a `debug!` event on success and a `warn!` event on failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingBehavior;

impl Behavior for LoggingBehavior {
    fn handle<'a>(
        &'a self,
        ctx: &'a InvocationContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let started = Instant::now();
            let result = next.run().await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            match &result {
                Ok(()) => tracing::debug!(
                    kind = %ctx.message_kind,
                    topic = %ctx.topic,
                    correlation_id = %ctx.correlation_id,
                    scope = ?ctx.scope,
                    elapsed_ms,
                    "invocation completed"
                ),
                Err(err) => tracing::warn!(
                    error = ?err,
                    kind = %ctx.message_kind,
                    topic = %ctx.topic,
                    correlation_id = %ctx.correlation_id,
                    scope = ?ctx.scope,
                    elapsed_ms,
                    "invocation failed"
                ),
            }
            result
        }
        .boxed()
    }
}
