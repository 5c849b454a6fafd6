// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! This module provides the prefetch-limited view a single worker has onto a queue,
//! and the core per-delivery consumption logic: run the handler inside a trace span,
//! then ack or nack according to its outcome.
//!
//! A [`PendingDelivery`] holds one unit of its consumer's prefetch budget until it is
//! resolved. If it is dropped unresolved (handler task aborted, worker crashed) it is
//! nacked with requeue, so no delivery is left orphaned in flight.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, FailurePolicy, Outcome},
    message::Delivery,
    otel,
    queue::Queue,
};
use futures_util::FutureExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

/// A worker's prefetch-limited channel onto one queue.
#[derive(Debug)]
pub struct Consumer {
    consumer_tag: String,
    queue: Arc<Queue>,
    budget: Arc<Semaphore>,
    held: Arc<AtomicUsize>,
    prefetch: usize,
}

impl Consumer {
    /// Creates a consumer allowed to hold at most `prefetch` unresolved deliveries.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `prefetch` - Maximum number of unresolved deliveries, must be positive
    /// * `consumer_tag` - Name of this consumer, used in logs
    ///
    /// # Returns
    /// The consumer, or [`AmqpError::QoSDeclarationError`] when `prefetch` is zero
    pub fn new(queue: Arc<Queue>, prefetch: usize, consumer_tag: &str) -> Result<Self, AmqpError> {
        if prefetch == 0 {
            return Err(AmqpError::QoSDeclarationError(format!(
                "prefetch must be positive for `{consumer_tag}`"
            )));
        }

        Ok(Consumer {
            consumer_tag: consumer_tag.to_owned(),
            queue,
            budget: Arc::new(Semaphore::new(prefetch)),
            held: Arc::new(AtomicUsize::new(0)),
            prefetch,
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    /// Number of deliveries this consumer holds that are not yet acked or nacked.
    ///
    /// A pending [`Consumer::next`] that already reserved budget but has no message
    /// yet is not counted.
    pub fn in_flight(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Dequeues without waiting.
    ///
    /// Returns `None` when the prefetch budget is exhausted or the queue has nothing
    /// pending.
    pub fn try_next(&self) -> Option<PendingDelivery> {
        let permit = self.budget.clone().try_acquire_owned().ok()?;
        let delivery = self.queue.dequeue()?;
        Some(self.hold(delivery, permit))
    }

    /// Waits for prefetch budget, then for a message.
    ///
    /// Suspends while the budget is exhausted (woken when one of this consumer's
    /// deliveries is resolved) and while the queue is empty (woken on enqueue).
    ///
    /// # Returns
    /// The next delivery, or [`AmqpError::QueueClosed`] once the queue is closed
    pub async fn next(&self) -> Result<PendingDelivery, AmqpError> {
        let permit = self
            .budget
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AmqpError::InternalError)?;

        let delivery = self.queue.next_delivery().await?;
        Ok(self.hold(delivery, permit))
    }

    fn hold(&self, delivery: Delivery, permit: OwnedSemaphorePermit) -> PendingDelivery {
        PendingDelivery::new(delivery, self.queue.clone(), self.held.clone(), permit)
    }
}

/// A delivery handed to a consumer and not yet resolved.
#[derive(Debug)]
pub struct PendingDelivery {
    delivery: Delivery,
    queue: Arc<Queue>,
    resolved: bool,
    held: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl PendingDelivery {
    fn new(
        delivery: Delivery,
        queue: Arc<Queue>,
        held: Arc<AtomicUsize>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        held.fetch_add(1, Ordering::AcqRel);
        PendingDelivery {
            delivery,
            queue,
            resolved: false,
            held,
            _permit: permit,
        }
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Delivery tag on the source queue.
    pub fn tag(&self) -> u64 {
        self.delivery.tag
    }

    /// Acknowledges the delivery, removing the message from its queue.
    ///
    /// # Returns
    /// [`AmqpError::UnknownDeliveryTag`] if the queue no longer has the tag in flight
    pub fn ack(self) -> Result<(), AmqpError> {
        self.resolve(Outcome::Ack)
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `requeue` - Puts the message back at the tail of its queue when `true`,
    ///   discards it otherwise
    ///
    /// # Returns
    /// [`AmqpError::UnknownDeliveryTag`] if the queue no longer has the tag in flight
    pub fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.resolve(Outcome::Nack { requeue })
    }

    /// Acks or nacks the delivery and releases its prefetch slot.
    pub fn resolve(mut self, outcome: Outcome) -> Result<(), AmqpError> {
        self.resolved = true;
        match outcome {
            Outcome::Ack => self.queue.ack(self.delivery.tag),
            Outcome::Nack { requeue } => self.queue.nack(self.delivery.tag, requeue),
        }
    }
}

impl Drop for PendingDelivery {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::AcqRel);
        if self.resolved {
            return;
        }

        warn!(
            queue = self.delivery.queue.as_str(),
            tag = self.delivery.tag,
            "unresolved delivery dropped, requeuing"
        );
        if let Err(err) = self.queue.nack(self.delivery.tag, true) {
            error!(error = err.to_string(), "failure to requeue dropped delivery");
        }
    }
}

/// Consumes one delivery: invokes the handler and resolves the delivery.
///
/// A handler error or panic is never propagated; it is recorded on the span and
/// turned into the outcome prescribed by `policy`. The only errors returned are
/// failures to resolve the delivery against its queue.
pub(crate) async fn consume(
    pending: PendingDelivery,
    handler: Arc<dyn ConsumerHandler>,
    policy: FailurePolicy,
) -> Result<Outcome, AmqpError> {
    let tracer = global::tracer("topic consumer");
    let msg = ConsumerMessage::from_delivery(pending.delivery());
    let span_name = msg.msg_type.clone().unwrap_or_else(|| msg.routing_key.clone());

    let (ctx, mut span) = otel::new_span(&msg.headers, &tracer, &span_name);

    debug!(
        "received: {} - queue: {} - tag: {}",
        msg.routing_key,
        msg.queue,
        pending.tag()
    );

    let outcome = match AssertUnwindSafe(async { handler.exec(&ctx, &msg).await })
        .catch_unwind()
        .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            warn!(
                error = err.to_string(),
                queue = msg.queue.as_str(),
                "error whiling handling msg"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            policy.outcome()
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());

            error!(panic = %reason, queue = msg.queue.as_str(), "handler panicked");
            let err = AmqpError::HandlerFailure(reason);
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler panicked"),
            });
            policy.outcome()
        }
    };

    match pending.resolve(outcome) {
        Err(err) => {
            error!(error = err.to_string(), "error whiling resolving msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to resolve msg"),
            });
            Err(err)
        }
        Ok(()) => {
            if outcome == Outcome::Ack {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
            }
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::MockConsumerHandler,
        message::Message,
        queue::QueueDefinition,
        routing::RoutingKey,
    };
    use std::time::Duration;

    fn queue_with(payloads: &[&str]) -> Arc<Queue> {
        let queue = Arc::new(Queue::new(QueueDefinition::new("order.queue")));
        for payload in payloads {
            queue.enqueue(Arc::new(Message::new(
                RoutingKey::parse("order.created").unwrap(),
                payload.as_bytes(),
            )));
        }
        queue
    }

    #[test]
    fn rejects_zero_prefetch() {
        assert_eq!(
            Consumer::new(queue_with(&[]), 0, "w0").unwrap_err(),
            AmqpError::QoSDeclarationError("prefetch must be positive for `w0`".into())
        );
    }

    #[test]
    fn prefetch_limits_unresolved_deliveries() {
        let queue = queue_with(&["1", "2", "3"]);
        let consumer = Consumer::new(queue.clone(), 2, "w0").unwrap();

        let first = consumer.try_next().unwrap();
        let second = consumer.try_next().unwrap();
        assert_eq!(consumer.in_flight(), 2);
        assert!(consumer.try_next().is_none());
        assert_eq!(queue.pending_len(), 1);

        first.ack().unwrap();
        assert_eq!(consumer.in_flight(), 1);
        let third = consumer.try_next().unwrap();
        assert_eq!(third.delivery().message.payload, b"3");

        second.ack().unwrap();
        third.nack(false).unwrap();
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn dropped_delivery_is_requeued() {
        let queue = queue_with(&["1"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        drop(consumer.try_next().unwrap());
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(consumer.in_flight(), 0);
        assert!(consumer.try_next().unwrap().delivery().redelivered);
    }

    #[tokio::test]
    async fn next_waits_for_budget() {
        let queue = queue_with(&["1", "2"]);
        let consumer = Arc::new(Consumer::new(queue.clone(), 1, "w0").unwrap());
        let held = consumer.next().await.unwrap();

        let waiter = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.next().await.map(|p| p.tag()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(queue.pending_len(), 1);

        held.ack().unwrap();
        let tag = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(tag > 0);
    }

    #[tokio::test]
    async fn waiting_next_is_not_counted_in_flight() {
        let queue = queue_with(&["1"]);
        let consumer = Arc::new(Consumer::new(queue.clone(), 2, "w0").unwrap());
        let held = consumer.next().await.unwrap();

        let waiter = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.next().await.and_then(PendingDelivery::ack) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(consumer.in_flight(), 1);
        assert_eq!(queue.in_flight_len(), 1);

        held.ack().unwrap();
        assert_eq!(consumer.in_flight(), 0);

        queue.enqueue(Arc::new(Message::new(
            RoutingKey::parse("order.created").unwrap(),
            b"2",
        )));
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let queue = queue_with(&["X"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .withf(|_, msg| msg.data == b"X" && msg.queue == "order.queue")
            .times(1)
            .returning(|_, _| Ok(Outcome::Ack));

        let pending = consumer.try_next().unwrap();
        let outcome = consume(pending, Arc::new(handler), FailurePolicy::Requeue)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn failing_handler_requeues_by_default() {
        let queue = queue_with(&["X"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(AmqpError::HandlerFailure("boom".into())));

        let outcome = consume(
            consumer.try_next().unwrap(),
            Arc::new(handler),
            FailurePolicy::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Nack { requeue: true });
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn failing_handler_discards_with_discard_policy() {
        let queue = queue_with(&["X"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Err(AmqpError::HandlerFailure("boom".into())));

        consume(
            consumer.try_next().unwrap(),
            Arc::new(handler),
            FailurePolicy::Discard,
        )
        .await
        .unwrap();

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }

    struct CrashingHandler;

    #[async_trait::async_trait]
    impl ConsumerHandler for CrashingHandler {
        async fn exec(
            &self,
            _ctx: &opentelemetry::Context,
            _msg: &ConsumerMessage,
        ) -> Result<Outcome, AmqpError> {
            panic!("handler crashed")
        }
    }

    #[tokio::test]
    async fn panicking_handler_requeues() {
        let queue = queue_with(&["X"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        let outcome = consume(
            consumer.try_next().unwrap(),
            Arc::new(CrashingHandler),
            FailurePolicy::Requeue,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Nack { requeue: true });
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn handler_outcome_nack_is_honoured() {
        let queue = queue_with(&["X"]);
        let consumer = Consumer::new(queue.clone(), 1, "w0").unwrap();

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .returning(|_, _| Ok(Outcome::Nack { requeue: false }));

        consume(
            consumer.try_next().unwrap(),
            Arc::new(handler),
            FailurePolicy::Requeue,
        )
        .await
        .unwrap();

        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 0);
    }
}
