//! Query coordinator — request/response on top of publish/subscribe.
//!
//! A query registers a waiter under a fresh correlation id, invokes every
//! matching handler and waits for a response that downcasts to the expected
//! type. Responses come from result handlers or later from
//! [`EventAggregator::respond`]. The behavior chain wraps the whole span of
//! the query.
//!
//! The waiter is owned by a guard: whatever ends the query (response,
//! deadline, cancellation, shutdown, caller dropping the future) removes it
//! from the pending table.

use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, OptionFuture};
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use switchyard_domain::error::BusError;
use switchyard_domain::id::CorrelationId;
use switchyard_domain::message::{AnyMessage, BusMessage, Delivery, Message};
use switchyard_domain::time::now;

use crate::behavior::{InvocationContext, QueryPattern, Terminal};
use crate::event_aggregator::{CallOptions, EventAggregator, cancelled};
use crate::pending::{WaiterGuard, WaiterReceiver};
use crate::registry::Response;

type Inflight = FuturesUnordered<BoxFuture<'static, Result<Option<Response>, BusError>>>;

impl EventAggregator {
    /// Publish `message` and return the first response of type `R`.
    ///
    /// # Errors
    ///
    /// [`BusError::Timeout`] when no response arrives before the deadline,
    /// [`BusError::Cancelled`] when the caller's token fires first,
    /// [`BusError::Closed`] on shutdown, [`BusError::Validation`] for an
    /// invalid message. A faulting responder is logged; when every responder
    /// faults the last fault is returned as [`BusError::HandlerFault`], so
    /// retrying behaviors around the query can act on it.
    #[tracing::instrument(skip_all, fields(kind = %T::KIND, topic = message.topic()))]
    pub async fn query<T, R>(
        &self,
        message: Message<T>,
        options: CallOptions,
    ) -> Result<R, BusError>
    where
        T: BusMessage,
        R: Clone + Send + Sync + 'static,
    {
        self.run_query(message, &options, QueryPattern::First, &|_: &R| true, false)
            .await
    }

    /// Repeat the query until a response equals `expected`.
    ///
    /// Rounds are spaced by the configured result-check interval. Responses
    /// that differ from `expected` are ignored.
    ///
    /// # Errors
    ///
    /// Same as [`query`](Self::query).
    #[tracing::instrument(skip_all, fields(kind = %T::KIND, topic = message.topic()))]
    pub async fn query_with_result_check<T, R>(
        &self,
        message: Message<T>,
        expected: R,
        options: CallOptions,
    ) -> Result<R, BusError>
    where
        T: BusMessage,
        R: PartialEq + Clone + Send + Sync + 'static,
    {
        let accept = move |response: &R| *response == expected;
        self.run_query(message, &options, QueryPattern::ResultCheck, &accept, true)
            .await
    }

    /// Stream every response of type `R`.
    ///
    /// Nothing happens until the stream is first polled. The stream ends when
    /// the caller's token fires, the bus shuts down, or the optional timeout
    /// in `options` elapses; dropping it releases the waiter.
    ///
    /// # Errors
    ///
    /// [`BusError::Validation`] or [`BusError::Closed`] immediately.
    #[tracing::instrument(skip_all, fields(kind = %T::KIND, topic = message.topic()))]
    pub fn query_with_results<T, R>(
        &self,
        message: Message<T>,
        options: CallOptions,
    ) -> Result<ResultStream<R>, BusError>
    where
        T: BusMessage,
        R: Clone + Send + Sync + 'static,
    {
        let message = self.admit(message)?;
        let start = ResultsState::Idle(Box::new(IdleQuery {
            bus: self.clone(),
            message,
            options,
        }));
        Ok(ResultStream {
            inner: futures::stream::unfold(start, next_result::<R>).fuse().boxed(),
        })
    }

    /// Query, then publish the response as a new message on the original
    /// topic. Returns the response.
    ///
    /// # Errors
    ///
    /// Same as [`query`](Self::query); a republish after shutdown returns
    /// [`BusError::Closed`].
    #[tracing::instrument(skip_all, fields(kind = %T::KIND, topic = message.topic()))]
    pub async fn query_with_republish_result<T, R>(
        &self,
        message: Message<T>,
        options: CallOptions,
    ) -> Result<R, BusError>
    where
        T: BusMessage,
        R: BusMessage + Clone,
    {
        let topic = message.topic().to_string();
        let response: R = self
            .run_query(message, &options, QueryPattern::Republish, &|_: &R| true, false)
            .await?;
        let republish = CallOptions {
            cancellation: options.cancellation.clone(),
            behaviors: options.behaviors.clone(),
            ..CallOptions::default()
        };
        self.publish(Message::new(topic, response.clone()), republish).await?;
        Ok(response)
    }

    /// Answer the query waiting under `correlation_id`.
    ///
    /// Returns `false` when no such query is pending (it already completed,
    /// timed out or was cancelled) or its response buffer is full.
    pub fn respond<R: Send + Sync + 'static>(
        &self,
        correlation_id: CorrelationId,
        response: R,
    ) -> bool {
        self.inner
            .pending
            .offer(correlation_id, std::sync::Arc::new(response))
    }

    /// Number of queries currently waiting for a response.
    #[must_use]
    pub fn pending_queries(&self) -> usize {
        self.inner.pending.len()
    }

    /// Responses dropped because a bounded response buffer was full.
    #[must_use]
    pub fn dropped_responses(&self) -> u64 {
        self.inner.pending.dropped()
    }

    async fn run_query<T, R>(
        &self,
        message: Message<T>,
        options: &CallOptions,
        pattern: QueryPattern,
        accept: &(dyn Fn(&R) -> bool + Send + Sync),
        repeat: bool,
    ) -> Result<R, BusError>
    where
        T: BusMessage,
        R: Clone + Send + Sync + 'static,
    {
        let message = self.admit(message)?;
        let correlation_id = CorrelationId::new();
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.query_timeout());
        let (_waiter, receiver) = self.inner.pending.register(correlation_id);
        let receiver = tokio::sync::Mutex::new(receiver);
        let answer = Mutex::new(None);
        let round = QueryRound {
            bus: self,
            message: &message,
            correlation_id,
            options,
            deadline: Instant::now() + timeout,
            timeout,
            accept,
            repeat,
        };

        let chain = self.chain_for(options);
        let ctx = InvocationContext::query(pattern, &message, correlation_id);
        let terminal: &Terminal<'_> = &|| round.run(&receiver, &answer).boxed();
        chain.run(&ctx, terminal).await?;

        answer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .ok_or(BusError::Unanswered)
    }

    fn start_responders(
        &self,
        message: &AnyMessage,
        correlation_id: CorrelationId,
        options: &CallOptions,
    ) -> Inflight {
        let mut handlers = self.inner.registry.resolve(message, options.filter.as_ref());
        self.chain_for(options).order(&mut handlers);
        handlers
            .iter()
            .map(|handler| {
                let delivery = Delivery {
                    correlation_id,
                    timestamp: now(),
                    token: handler.token(),
                };
                handler.invoke(message, delivery)
            })
            .collect()
    }

    async fn collect_responses(
        &self,
        message: &AnyMessage,
        correlation_id: CorrelationId,
        options: &CallOptions,
    ) -> Result<(), BusError> {
        let mut inflight = self.start_responders(message, correlation_id, options);
        while let Some(outcome) = inflight.next().await {
            match outcome {
                Ok(Some(response)) => {
                    self.inner.pending.offer(correlation_id, response);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = ?err, %correlation_id, "responder faulted");
                }
            }
        }
        Ok(())
    }
}

/// One execution of a query's response loop. Re-run by retrying behaviors.
struct QueryRound<'q, R> {
    bus: &'q EventAggregator,
    message: &'q AnyMessage,
    correlation_id: CorrelationId,
    options: &'q CallOptions,
    deadline: Instant,
    timeout: Duration,
    accept: &'q (dyn Fn(&R) -> bool + Send + Sync),
    repeat: bool,
}

impl<R: Clone + Send + Sync + 'static> QueryRound<'_, R> {
    async fn run(
        &self,
        receiver: &tokio::sync::Mutex<WaiterReceiver>,
        answer: &Mutex<Option<R>>,
    ) -> Result<(), BusError> {
        let mut receiver = receiver.lock().await;
        let interval = self.bus.config().result_check_interval();
        let mut inflight = self
            .bus
            .start_responders(self.message, self.correlation_id, self.options);
        let responders = inflight.len();
        let mut faulted = 0;
        let mut next_round: Option<Instant> = None;

        loop {
            if self.repeat && inflight.is_empty() && next_round.is_none() {
                next_round = Some(Instant::now() + interval);
            }
            let response = tokio::select! {
                biased;
                () = cancelled(self.options.cancellation.as_ref()) => {
                    return Err(BusError::Cancelled);
                }
                () = self.bus.inner.shutdown.cancelled() => return Err(BusError::Closed),
                () = tokio::time::sleep_until(self.deadline) => {
                    return Err(BusError::Timeout(self.timeout));
                }
                Some(response) = receiver.recv() => response,
                Some(outcome) = inflight.next(), if !inflight.is_empty() => match outcome {
                    Ok(Some(response)) => response,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(
                            error = ?err,
                            correlation_id = %self.correlation_id,
                            "responder faulted"
                        );
                        faulted += 1;
                        if !self.repeat && inflight.is_empty() && faulted == responders {
                            return Err(err);
                        }
                        continue;
                    }
                },
                () = tokio::time::sleep_until(next_round.unwrap_or(self.deadline)),
                    if next_round.is_some() =>
                {
                    tracing::trace!(
                        correlation_id = %self.correlation_id,
                        "starting next result-check round"
                    );
                    next_round = None;
                    inflight = self
                        .bus
                        .start_responders(self.message, self.correlation_id, self.options);
                    continue;
                }
            };

            if let Some(value) = response.downcast_ref::<R>().filter(|value| (self.accept)(value)) {
                *answer.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
                return Ok(());
            }
        }
    }
}

/// Responses of a [`query_with_results`](EventAggregator::query_with_results) call.
pub struct ResultStream<R> {
    inner: BoxStream<'static, R>,
}

impl<R> Stream for ResultStream<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<R> std::fmt::Debug for ResultStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

enum ResultsState {
    Idle(Box<IdleQuery>),
    Active(Box<ActiveQuery>),
}

struct IdleQuery {
    bus: EventAggregator,
    message: AnyMessage,
    options: CallOptions,
}

impl IdleQuery {
    fn activate(self) -> Box<ActiveQuery> {
        let correlation_id = CorrelationId::new();
        let (waiter, receiver) = self.bus.inner.pending.register(correlation_id);
        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        let cancellation = self.options.cancellation.clone();
        let shutdown = self.bus.inner.shutdown.clone();
        let driver = fan_out(self.bus, self.message, correlation_id, self.options);
        Box::new(ActiveQuery {
            _waiter: waiter,
            receiver,
            driver: Some(driver),
            cancellation,
            shutdown,
            deadline,
        })
    }
}

struct ActiveQuery {
    _waiter: WaiterGuard,
    receiver: WaiterReceiver,
    driver: Option<BoxFuture<'static, Result<(), BusError>>>,
    cancellation: Option<CancellationToken>,
    shutdown: CancellationToken,
    deadline: Option<Instant>,
}

fn fan_out(
    bus: EventAggregator,
    message: AnyMessage,
    correlation_id: CorrelationId,
    options: CallOptions,
) -> BoxFuture<'static, Result<(), BusError>> {
    async move {
        let chain = bus.chain_for(&options);
        let ctx = InvocationContext::query(QueryPattern::Results, &message, correlation_id);
        let terminal: &Terminal<'_> =
            &|| bus.collect_responses(&message, correlation_id, &options).boxed();
        chain.run(&ctx, terminal).await
    }
    .boxed()
}

async fn next_result<R: Clone + Send + Sync + 'static>(
    state: ResultsState,
) -> Option<(R, ResultsState)> {
    let mut active = match state {
        ResultsState::Idle(idle) => idle.activate(),
        ResultsState::Active(active) => active,
    };
    loop {
        let response = tokio::select! {
            biased;
            () = cancelled(active.cancellation.as_ref()) => return None,
            () = active.shutdown.cancelled() => return None,
            () = tokio::time::sleep_until(active.deadline.unwrap_or_else(Instant::now)),
                if active.deadline.is_some() =>
            {
                return None;
            }
            Some(response) = active.receiver.recv() => response,
            Some(result) = OptionFuture::from(active.driver.as_mut()),
                if active.driver.is_some() =>
            {
                active.driver = None;
                if let Err(err) = result {
                    tracing::warn!(error = ?err, "query fan-out failed");
                }
                continue;
            }
        };
        if let Some(value) = response.downcast_ref::<R>() {
            return Some((value.clone(), ResultsState::Active(active)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use switchyard_domain::message::MessageEnvelope;

    use super::*;
    use crate::behavior::{BehaviorChain, RetryBehavior};

    #[derive(Debug, Clone, PartialEq)]
    struct Ping {
        id: u32,
    }
    switchyard_domain::bus_message!(Ping, "test.ping");

    #[derive(Debug, Clone, PartialEq)]
    struct Pong {
        id: u32,
    }
    switchyard_domain::bus_message!(Pong, "test.pong");

    fn ping(id: u32) -> Message<Ping> {
        Message::from(Ping { id })
    }

    fn within(ms: u64) -> CallOptions {
        CallOptions::default().with_timeout(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn should_return_first_response() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, u32, _, _>(
            |env| async move { Ok(env.payload().id + 1) },
            None,
        );

        let response: u32 = bus.query(ping(41), within(1_000)).await.unwrap();

        assert_eq!(response, 42);
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_time_out_at_deadline_without_responder() {
        let bus = EventAggregator::default();
        let started = Instant::now();

        let result = bus.query::<Ping, u32>(ping(1), within(200)).await;

        assert!(matches!(
            result,
            Err(BusError::Timeout(timeout)) if timeout == Duration::from_millis(200)
        ));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_ignore_responses_of_other_types() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, String, _, _>(
            |_| async { Ok("not a number".to_string()) },
            None,
        );

        let result = bus.query::<Ping, u32>(ping(1), within(50)).await;

        assert!(matches!(result, Err(BusError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_return_cancelled_when_caller_cancels() {
        let bus = EventAggregator::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = bus
            .query::<Ping, u32>(ping(1), within(1_000).with_cancellation(cancel))
            .await;

        assert!(matches!(result, Err(BusError::Cancelled)));
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_release_waiter_when_query_future_is_dropped() {
        let bus = EventAggregator::default();

        let outcome = tokio::time::timeout(
            Duration::from_millis(10),
            bus.query::<Ping, u32>(ping(1), within(1_000)),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test]
    async fn should_accept_out_of_band_response() {
        let bus = EventAggregator::default();
        let responder = bus.clone();
        bus.subscribe::<Ping, _>(
            move |env: MessageEnvelope<Ping>| {
                let bus = responder.clone();
                let correlation_id = env.correlation_id();
                let id = env.payload().id;
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    bus.respond(correlation_id, Pong { id });
                });
                Ok(())
            },
            None,
        );

        let pong: Pong = bus.query(ping(9), within(1_000)).await.unwrap();

        assert_eq!(pong, Pong { id: 9 });
    }

    #[tokio::test]
    async fn should_answer_despite_faulting_responder() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, u32, _, _>(
            |_| async { Err("sensor offline".into()) },
            None,
        );
        bus.subscribe_for_result::<Ping, u32, _, _>(|_| async { Ok(7) }, None);

        let response: u32 = bus.query(ping(1), within(1_000)).await.unwrap();

        assert_eq!(response, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn should_repeat_until_expected_result() {
        let bus = EventAggregator::default();
        let rounds = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&rounds);
        bus.subscribe_for_result::<Ping, bool, _, _>(
            move |_| {
                let round = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(round >= 3) }
            },
            None,
        );

        let result = bus
            .query_with_result_check(ping(1), true, within(5_000))
            .await
            .unwrap();

        assert!(result);
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_respect_deadline_when_result_never_matches() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, bool, _, _>(|_| async { Ok(false) }, None);
        let started = Instant::now();

        let result = bus.query_with_result_check(ping(1), true, within(1_000)).await;

        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test]
    async fn should_stream_responses_from_many_respondents() {
        let bus = EventAggregator::default();
        for answer in [1_u32, 2, 3] {
            bus.subscribe_for_result::<Ping, u32, _, _>(move |_| async move { Ok(answer) }, None);
        }
        let cancel = CancellationToken::new();

        let stream = bus
            .query_with_results::<Ping, u32>(
                ping(1),
                CallOptions::default().with_cancellation(cancel.clone()),
            )
            .unwrap();
        assert_eq!(bus.pending_queries(), 0);

        let mut responses: Vec<u32> = stream.take(3).collect().await;
        responses.sort_unstable();

        assert_eq!(responses, vec![1, 2, 3]);
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test]
    async fn should_end_result_stream_on_cancel() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, u32, _, _>(|_| async { Ok(1) }, None);
        let cancel = CancellationToken::new();
        let mut stream = bus
            .query_with_results::<Ping, u32>(
                ping(1),
                CallOptions::default().with_cancellation(cancel.clone()),
            )
            .unwrap();

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(bus.pending_queries(), 1);

        cancel.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
        drop(stream);
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test]
    async fn should_republish_response_on_original_topic() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, Pong, _, _>(
            |env| async move { Ok(Pong { id: env.payload().id }) },
            None,
        );
        let mut pongs = bus.observe::<Pong>();

        let pong: Pong = bus
            .query_with_republish_result(
                Message::new("kitchen/ping", Ping { id: 4 }),
                within(1_000),
            )
            .await
            .unwrap();

        let republished = pongs.next().await.unwrap();
        assert_eq!(pong, Pong { id: 4 });
        assert_eq!(republished.payload(), &pong);
        assert_eq!(republished.topic(), "kitchen/ping");
    }

    #[tokio::test(start_paused = true)]
    async fn should_fail_pending_query_on_shutdown() {
        let bus = EventAggregator::default();
        let closer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.shutdown();
        });

        let result = bus.query::<Ping, u32>(ping(1), within(1_000)).await;

        assert!(matches!(result, Err(BusError::Closed)));
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_retry_whole_query_span() {
        let bus = EventAggregator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe_for_result::<Ping, u32, _, _>(
            move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err("warming up".into())
                    } else {
                        Ok(5)
                    }
                }
            },
            None,
        );
        let options = within(1_000)
            .with_behaviors(BehaviorChain::new().with(RetryBehavior::new(3, Duration::ZERO)));

        let response: u32 = bus.query(ping(1), options).await.unwrap();

        assert_eq!(response, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test]
    async fn should_return_fault_when_every_responder_faults() {
        let bus = EventAggregator::default();
        bus.subscribe_for_result::<Ping, u32, _, _>(
            |_| async { Err("sensor offline".into()) },
            None,
        );
        bus.subscribe_for_result::<Ping, u32, _, _>(|_| async { Err("relay stuck".into()) }, None);

        let result = bus.query::<Ping, u32>(ping(1), within(1_000)).await;

        assert!(matches!(result, Err(BusError::HandlerFault { .. })));
        assert_eq!(bus.pending_queries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_retry_query_timeouts() {
        let bus = EventAggregator::default();
        let options = within(100)
            .with_behaviors(BehaviorChain::new().with(RetryBehavior::new(3, Duration::ZERO)));

        let result = bus.query::<Ping, u32>(ping(1), options).await;

        assert!(matches!(result, Err(BusError::Timeout(_))));
        assert_eq!(bus.pending_queries(), 0);
    }
}
