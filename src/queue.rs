// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! This module provides the queue definition builder, the queue-to-exchange binding
//! builder, and the runtime [`Queue`]: an ordered FIFO of pending messages plus the
//! map of deliveries that were handed out and not yet acknowledged.
//!
//! A message held by a queue is either pending or in exactly one in-flight delivery,
//! never both, and never twice. All state changes go through `enqueue`, `dequeue`,
//! `ack` and `nack`, each performed under the queue lock.

use crate::{
    errors::AmqpError,
    message::{Delivery, Message, MessageId},
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new, non-durable queue definition
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durability itself is provided by the storage collaborator; the flag is kept
    /// on the queue so it can be handed to it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define which routing keys published to the exchange reach the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding<'qeb> {
    pub(crate) queue_name: &'qeb str,
    pub(crate) exchange_name: &'qeb str,
    pub(crate) routing_key: &'qeb str,
}

impl<'qeb> QueueBinding<'qeb> {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new queue binding configuration
    pub fn new(queue: &'qeb str) -> QueueBinding<'qeb> {
        QueueBinding {
            queue_name: queue,
            exchange_name: "",
            routing_key: "",
        }
    }

    /// Sets the exchange to bind the queue to.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &'qeb str) -> Self {
        self.exchange_name = exchange;
        self
    }

    /// Sets the binding pattern, which may contain `*` and `#` wildcards.
    ///
    /// # Parameters
    /// * `key` - The binding pattern, e.g. `payment.*`
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &'qeb str) -> Self {
        self.routing_key = key;
        self
    }
}

#[derive(Debug)]
struct Entry {
    message: Arc<Message>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    in_flight: HashMap<u64, Entry>,
    held: HashSet<MessageId>,
    last_tag: u64,
    closed: bool,
}

/// A FIFO queue of pending messages with ack-gated removal.
#[derive(Debug)]
pub struct Queue {
    def: QueueDefinition,
    state: Mutex<QueueState>,
    activity: Notify,
}

impl Queue {
    /// Creates an empty, open queue.
    ///
    /// # Parameters
    /// * `def` - The queue definition (name and durability)
    ///
    /// # Returns
    /// A queue with nothing pending or in flight
    pub fn new(def: QueueDefinition) -> Queue {
        Queue {
            def,
            state: Mutex::new(QueueState::default()),
            activity: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_durable(&self) -> bool {
        self.def.durable
    }

    /// Appends a message to the tail of the pending list and wakes waiting consumers.
    ///
    /// # Parameters
    /// * `message` - The message to hold until it is acked or discarded
    ///
    /// # Returns
    /// `false`, leaving the queue unchanged, when the queue is closed or already holds
    /// this message
    pub fn enqueue(&self, message: Arc<Message>) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || !state.held.insert(message.id) {
                return false;
            }
            state.pending.push_back(Entry {
                message,
                redelivered: false,
            });
        }

        self.activity.notify_waiters();
        true
    }

    /// Pops the head of the pending list and records it as in flight under a fresh tag.
    pub fn dequeue(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let entry = state.pending.pop_front()?;
        state.last_tag += 1;
        let tag = state.last_tag;

        let delivery = Delivery {
            message: entry.message.clone(),
            queue: self.def.name.clone(),
            tag,
            redelivered: entry.redelivered,
        };
        state.in_flight.insert(tag, entry);

        Some(delivery)
    }

    /// Waits until a message can be dequeued.
    ///
    /// Suspends on enqueue activity instead of polling. Fails with
    /// [`AmqpError::QueueClosed`] once the queue is closed. Dropping the returned
    /// future before it resolves takes nothing from the queue.
    pub async fn next_delivery(&self) -> Result<Delivery, AmqpError> {
        loop {
            let notified = self.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.dequeue() {
                return Ok(delivery);
            }
            if self.is_closed() {
                return Err(AmqpError::QueueClosed(self.def.name.clone()));
            }

            notified.await;
        }
    }

    /// Permanently removes an in-flight delivery.
    ///
    /// # Parameters
    /// * `tag` - The delivery tag handed out by [`Queue::dequeue`]
    ///
    /// # Returns
    /// [`AmqpError::UnknownDeliveryTag`] when `tag` is not in flight
    pub fn ack(&self, tag: u64) -> Result<(), AmqpError> {
        let mut state = self.state.lock();
        let Some(entry) = state.in_flight.remove(&tag) else {
            warn!(queue = self.name(), tag, "ack of unknown delivery tag");
            return Err(AmqpError::UnknownDeliveryTag(tag));
        };
        state.held.remove(&entry.message.id);

        debug!(queue = self.name(), tag, "message acked");
        Ok(())
    }

    /// Resolves an in-flight delivery negatively.
    ///
    /// With `requeue` the message goes back to the tail of the pending list and will be
    /// delivered again under a new tag; otherwise it is discarded.
    ///
    /// # Parameters
    /// * `tag` - The delivery tag handed out by [`Queue::dequeue`]
    /// * `requeue` - Whether the message goes back to the pending list
    ///
    /// # Returns
    /// [`AmqpError::UnknownDeliveryTag`] when `tag` is not in flight
    pub fn nack(&self, tag: u64, requeue: bool) -> Result<(), AmqpError> {
        {
            let mut state = self.state.lock();
            let Some(mut entry) = state.in_flight.remove(&tag) else {
                warn!(queue = self.name(), tag, "nack of unknown delivery tag");
                return Err(AmqpError::UnknownDeliveryTag(tag));
            };

            if !requeue {
                state.held.remove(&entry.message.id);
                debug!(queue = self.name(), tag, "message discarded");
                return Ok(());
            }

            entry.redelivered = true;
            state.pending.push_back(entry);
            debug!(queue = self.name(), tag, "message requeued");
        }

        self.activity.notify_waiters();
        Ok(())
    }

    /// Closes the queue and wakes every waiting consumer.
    ///
    /// Pending and in-flight messages are left in place; in-flight deliveries can
    /// still be acked or nacked.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.activity.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of messages waiting to be delivered.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of delivered messages not yet acked or nacked.
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
