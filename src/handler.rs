// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The consumer-facing side of the broker: the message view handed to user code, the
//! outcome it reports, and the policy applied when it fails.

use crate::{
    errors::AmqpError,
    message::{Delivery, Headers, MessageId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::Context;
use std::{future::Future, sync::Arc};

/// A delivered message as seen by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub id: MessageId,
    pub queue: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Headers,
    pub published_at: DateTime<Utc>,
    pub redelivered: bool,
}

impl ConsumerMessage {
    /// Copies the message and delivery details handed to a handler.
    pub fn from_delivery(delivery: &Delivery) -> ConsumerMessage {
        let message = &delivery.message;
        ConsumerMessage {
            id: message.id,
            queue: delivery.queue.clone(),
            routing_key: message.routing_key.to_string(),
            msg_type: message.msg_type.clone(),
            data: message.payload.clone(),
            headers: message.headers.clone(),
            published_at: message.published_at,
            redelivered: delivery.redelivered,
        }
    }
}

/// How a handler resolved a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Nack { requeue: bool },
}

/// What a worker does with a delivery whose handler failed or panicked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the message to the tail of the queue. Redeliveries are not capped.
    #[default]
    Requeue,
    /// Drop the message.
    Discard,
}

impl FailurePolicy {
    pub fn outcome(&self) -> Outcome {
        match self {
            FailurePolicy::Requeue => Outcome::Nack { requeue: true },
            FailurePolicy::Discard => Outcome::Nack { requeue: false },
        }
    }
}

/// User code invoked once per delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the message headers
    /// * `msg` - The delivered message
    ///
    /// # Returns
    /// The outcome to apply to the delivery. An error is handled like a panic: the
    /// worker applies its [`FailurePolicy`]
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Outcome, AmqpError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, AmqpError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<Outcome, AmqpError> {
        (self.f)(msg.clone()).await
    }
}

/// Wraps an async closure into a [`ConsumerHandler`].
///
/// # Parameters
/// * `f` - Closure called with an owned copy of every delivered message
///
/// # Returns
/// A handler that can be shared between the workers of a consumer group
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, AmqpError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::Message, routing::RoutingKey};

    #[test]
    fn failure_policy_outcomes() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Requeue);
        assert_eq!(
            FailurePolicy::Requeue.outcome(),
            Outcome::Nack { requeue: true }
        );
        assert_eq!(
            FailurePolicy::Discard.outcome(),
            Outcome::Nack { requeue: false }
        );
    }

    #[test]
    fn consumer_message_mirrors_delivery() {
        let message = Message::new(RoutingKey::parse("order.created").unwrap(), b"X")
            .with_type("OrderCreated");
        let delivery = Delivery {
            message: Arc::new(message.clone()),
            queue: "order.queue".into(),
            tag: 3,
            redelivered: true,
        };

        let msg = ConsumerMessage::from_delivery(&delivery);
        assert_eq!(msg.id, message.id);
        assert_eq!(msg.queue, "order.queue");
        assert_eq!(msg.routing_key, "order.created");
        assert_eq!(msg.msg_type.as_deref(), Some("OrderCreated"));
        assert_eq!(msg.data, b"X");
        assert!(msg.redelivered);
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn(|msg: ConsumerMessage| async move {
            if msg.data.is_empty() {
                Err(AmqpError::HandlerFailure("empty".into()))
            } else {
                Ok(Outcome::Ack)
            }
        });

        let delivery = Delivery {
            message: Arc::new(Message::new(RoutingKey::parse("a").unwrap(), b"")),
            queue: "q".into(),
            tag: 1,
            redelivered: false,
        };
        let msg = ConsumerMessage::from_delivery(&delivery);

        assert_eq!(
            handler.exec(&Context::new(), &msg).await,
            Err(AmqpError::HandlerFailure("empty".into()))
        );
    }
}
