// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module provides the [`Publisher`] abstraction used by producers, its broker
//! implementation, and a [`Producer`] that emits routing-key tagged messages at a fixed
//! cadence. Publishing propagates the caller's OpenTelemetry context in the message
//! headers.

use crate::{
    broker::Broker,
    errors::AmqpError,
    message::{Headers, Message, MessageId},
    otel,
    routing::RoutingKey,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error};

/// Routing keys cycled by a [`Producer`] when none are configured.
pub const DEFAULT_ROUTING_KEYS: [&str; 4] = [
    "order.created",
    "order.updated",
    "payment.success",
    "payment.failed",
];

/// Default interval between two messages of a [`Producer`].
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    /// Exchange name.
    pub to: String,
    pub key: String,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<Headers>,
}

impl PublishMessage {
    pub fn new(to: &str, key: &str, data: &[u8]) -> Self {
        PublishMessage {
            to: to.to_owned(),
            key: key.to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }
}

/// Sends [`PublishMessage`]s to an exchange.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<MessageId, AmqpError>;
}

/// Publishes into the exchanges of a [`Broker`] session.
///
/// The trace context of the caller is injected into the message headers so
/// consumers continue the same trace.
pub struct BrokerPublisher {
    broker: Arc<Broker>,
}

impl BrokerPublisher {
    /// Creates a new publisher over a broker session.
    ///
    /// # Parameters
    /// * `broker` - The session owning the target exchanges
    ///
    /// # Returns
    /// An Arc-wrapped BrokerPublisher instance for thread-safe sharing
    pub fn new(broker: Arc<Broker>) -> Arc<BrokerPublisher> {
        Arc::new(BrokerPublisher { broker })
    }
}

#[async_trait]
impl Publisher for BrokerPublisher {
    /// Publishes a message to the exchange named in `infos.to`.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `infos` - Message details including payload, exchange, routing key, etc.
    ///
    /// # Returns
    /// The id of the published message or an AmqpError on failure
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<MessageId, AmqpError> {
        let key = RoutingKey::parse(&infos.key)?;

        let mut headers = infos.headers.clone().unwrap_or_default();
        otel::inject(ctx, &mut headers);

        let mut message = Message::new(key, &infos.data).with_headers(headers);
        if let Some(msg_type) = &infos.msg_type {
            message = message.with_type(msg_type);
        }

        self.broker
            .publish_message(&infos.to, message)
            .inspect_err(|err| error!(error = err.to_string(), "error publishing message"))
    }
}

/// Emits `Message-{n} from Producer-{id}` to an exchange at a fixed interval,
/// cycling through its routing keys.
#[derive(Debug, Clone)]
pub struct Producer {
    id: usize,
    exchange: String,
    routing_keys: Vec<String>,
    interval: Duration,
}

impl Producer {
    /// Creates a producer cycling through [`DEFAULT_ROUTING_KEYS`] every
    /// [`DEFAULT_PUBLISH_INTERVAL`].
    ///
    /// # Parameters
    /// * `id` - Producer number, shown in message bodies
    /// * `exchange` - Name of the target exchange
    ///
    /// # Returns
    /// A producer that is not running yet
    pub fn new(id: usize, exchange: &str) -> Self {
        Producer {
            id,
            exchange: exchange.to_owned(),
            routing_keys: DEFAULT_ROUTING_KEYS.iter().map(|k| k.to_string()).collect(),
            interval: DEFAULT_PUBLISH_INTERVAL,
        }
    }

    /// Replaces the routing keys the producer cycles through.
    pub fn routing_keys(mut self, keys: &[&str]) -> Self {
        self.routing_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Builds the `count`-th message of this producer.
    pub fn message(&self, count: usize) -> Option<PublishMessage> {
        if self.routing_keys.is_empty() {
            return None;
        }

        let key = &self.routing_keys[count % self.routing_keys.len()];
        let body = format!("Message-{} from Producer-{}", count, self.id);
        Some(PublishMessage::new(&self.exchange, key, body.as_bytes()))
    }

    /// Starts publishing on a background task until the handle is stopped.
    ///
    /// Routing keys are validated up front. A failed publish is logged and the
    /// producer moves on to the next tick.
    pub fn spawn(self, publisher: Arc<dyn Publisher>) -> Result<ProducerHandle, AmqpError> {
        for key in &self.routing_keys {
            RoutingKey::parse(key)?;
        }

        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent = 0;

            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }

                let Some(infos) = self.message(sent) else {
                    break;
                };

                match publisher.publish(&Context::current(), &infos).await {
                    Ok(_) => {
                        debug!(
                            "Producer-{} sent [{}]: {}",
                            self.id,
                            infos.key,
                            String::from_utf8_lossy(&infos.data)
                        );
                        sent += 1;
                    }
                    Err(err) => {
                        error!(error = err.to_string(), producer = self.id, "publish failed");
                        if err == AmqpError::ChannelError {
                            break;
                        }
                    }
                }
            }

            sent
        });

        Ok(ProducerHandle { shutdown, task })
    }
}

/// Handle to a running [`Producer`].
#[derive(Debug)]
pub struct ProducerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<usize>,
}

impl ProducerHandle {
    /// Stops the producer and returns how many messages it published.
    pub async fn stop(self) -> Result<usize, AmqpError> {
        self.shutdown.send_replace(true);
        self.task.await.map_err(|_| AmqpError::InternalError)
    }
}
