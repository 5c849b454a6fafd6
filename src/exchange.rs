// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Exchange
//!
//! This module provides the exchange definition builder and the runtime topic
//! [`Exchange`]. The exchange owns the set of (queue, pattern) bindings and, on
//! publish, enqueues the message exactly once into every queue that has at least one
//! matching binding. Messages matching no binding are counted and dropped.

use crate::{
    errors::AmqpError,
    message::{Message, MessageId},
    queue::Queue,
    routing::{BindingPattern, RoutingKey},
};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Definition of a topic exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition<'ex> {
    pub(crate) name: &'ex str,
    pub(crate) durable: bool,
}

impl<'ex> ExchangeDefinition<'ex> {
    /// Creates a new, non-durable topic exchange definition with the given name.
    pub fn new(name: &'ex str) -> ExchangeDefinition<'ex> {
        ExchangeDefinition {
            name,
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

#[derive(Debug)]
struct BoundQueue {
    queue: Arc<Queue>,
    patterns: Vec<BindingPattern>,
}

/// Counters kept by an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub published: u64,
    /// Messages matching no binding.
    pub unroutable: u64,
    /// Messages that matched bindings but that every matched queue refused, because it
    /// was closed or already held the message.
    pub dropped: u64,
}

/// A topic exchange routing messages to bound queues.
#[derive(Debug)]
pub struct Exchange {
    name: String,
    durable: bool,
    bindings: RwLock<BTreeMap<String, BoundQueue>>,
    published: AtomicU64,
    unroutable: AtomicU64,
    dropped: AtomicU64,
}

impl Exchange {
    /// Creates an exchange with no bindings from its definition.
    ///
    /// # Parameters
    /// * `def` - The exchange definition (name and durability)
    ///
    /// # Returns
    /// A new exchange with zeroed counters
    pub fn new(def: &ExchangeDefinition) -> Exchange {
        Exchange {
            name: def.name.to_owned(),
            durable: def.durable,
            bindings: RwLock::new(BTreeMap::new()),
            published: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Binds `queue` to this exchange with `pattern`.
    ///
    /// Binding an existing (queue, pattern) pair again has no effect.
    ///
    /// # Parameters
    /// * `queue` - The queue receiving matching messages
    /// * `pattern` - The binding pattern, e.g. `order.*`
    ///
    /// # Returns
    /// `true` when a new binding was registered, `false` when it already existed, or
    /// [`AmqpError::MalformedPattern`]
    pub fn bind(&self, queue: Arc<Queue>, pattern: &str) -> Result<bool, AmqpError> {
        let pattern = BindingPattern::parse(pattern)?;

        let mut bindings = self.bindings.write();
        let bound = bindings
            .entry(queue.name().to_owned())
            .or_insert_with(|| BoundQueue {
                queue,
                patterns: vec![],
            });

        if bound.patterns.contains(&pattern) {
            return Ok(false);
        }

        debug!(
            exchange = self.name(),
            queue = bound.queue.name(),
            pattern = pattern.as_str(),
            "queue bound"
        );
        bound.patterns.push(pattern);
        Ok(true)
    }

    /// Removes the (queue, pattern) binding.
    ///
    /// # Parameters
    /// * `queue` - Name of the bound queue
    /// * `pattern` - The pattern the queue was bound with
    ///
    /// # Returns
    /// `false` when the pair was not bound, or [`AmqpError::MalformedPattern`]
    pub fn unbind(&self, queue: &str, pattern: &str) -> Result<bool, AmqpError> {
        let pattern = BindingPattern::parse(pattern)?;

        let mut bindings = self.bindings.write();
        let Some(bound) = bindings.get_mut(queue) else {
            return Ok(false);
        };

        let before = bound.patterns.len();
        bound.patterns.retain(|p| *p != pattern);
        let removed = bound.patterns.len() != before;

        if bound.patterns.is_empty() {
            bindings.remove(queue);
        }

        if removed {
            debug!(
                exchange = self.name(),
                queue,
                pattern = pattern.as_str(),
                "queue unbound"
            );
        }
        Ok(removed)
    }

    /// Returns the distinct queues with at least one binding matching `key`.
    pub fn route(&self, key: &RoutingKey) -> Vec<Arc<Queue>> {
        self.bindings
            .read()
            .values()
            .filter(|bound| bound.patterns.iter().any(|p| p.matches(key)))
            .map(|bound| bound.queue.clone())
            .collect()
    }

    /// Publishes an opaque payload under `routing_key`.
    ///
    /// # Parameters
    /// * `routing_key` - Dot-separated routing key of the message
    /// * `payload` - The message body
    ///
    /// # Returns
    /// The id of the new message, or [`AmqpError::MalformedRoutingKey`]. An unroutable
    /// message still yields its id
    pub fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<MessageId, AmqpError> {
        let key = RoutingKey::parse(routing_key)?;
        let message = Message::new(key, payload);
        let id = message.id;

        self.publish_message(message);
        Ok(id)
    }

    /// Enqueues a prepared message into every matching queue and returns how many
    /// queues received it.
    ///
    /// A message matching no binding is dropped and counted as unroutable; this is not
    /// an error. A message refused by every matched queue is counted as dropped. Once
    /// this returns, every matched queue that accepted the message holds it.
    pub fn publish_message(&self, message: Message) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let queues = self.route(&message.routing_key);
        if queues.is_empty() {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            warn!(
                exchange = self.name(),
                routing_key = %message.routing_key,
                message_id = %message.id,
                "unroutable message discarded"
            );
            return 0;
        }

        let message = Arc::new(message);
        let mut routed = 0;
        for queue in queues {
            if queue.enqueue(message.clone()) {
                routed += 1;
            }
        }

        if routed == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                exchange = self.name(),
                routing_key = %message.routing_key,
                message_id = %message.id,
                "every matched queue refused the message, dropped"
            );
            return 0;
        }

        debug!(
            exchange = self.name(),
            routing_key = %message.routing_key,
            routed,
            "message published"
        );
        routed
    }

    /// Snapshot of the exchange counters.
    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            published: self.published.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of (queue, pattern) bindings.
    pub fn binding_count(&self) -> usize {
        self.bindings.read().values().map(|b| b.patterns.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDefinition;

    fn queue(name: &str) -> Arc<Queue> {
        Arc::new(Queue::new(QueueDefinition::new(name).durable()))
    }

    fn exchange() -> Exchange {
        Exchange::new(&ExchangeDefinition::new("topic.exchange").durable())
    }

    #[test]
    fn routes_to_matching_queue_only() {
        let exchange = exchange();
        let orders = queue("order.queue");
        let payments = queue("payment.queue");
        exchange.bind(orders.clone(), "order.*").unwrap();
        exchange.bind(payments.clone(), "payment.*").unwrap();

        exchange.publish("order.created", b"X").unwrap();

        assert_eq!(orders.pending_len(), 1);
        assert_eq!(payments.pending_len(), 0);
        assert_eq!(orders.dequeue().unwrap().message.payload, b"X");
    }

    #[test]
    fn duplicate_binding_is_idempotent() {
        let exchange = exchange();
        let orders = queue("order.queue");
        assert!(exchange.bind(orders.clone(), "order.*").unwrap());
        assert!(!exchange.bind(orders.clone(), "order.*").unwrap());
        assert_eq!(exchange.binding_count(), 1);

        exchange.publish("order.created", b"X").unwrap();
        assert_eq!(orders.pending_len(), 1);
    }

    #[test]
    fn overlapping_patterns_enqueue_once() {
        let exchange = exchange();
        let audit = queue("audit.queue");
        exchange.bind(audit.clone(), "order.*").unwrap();
        exchange.bind(audit.clone(), "#").unwrap();
        exchange.bind(audit.clone(), "*.created").unwrap();

        let message = Message::new(RoutingKey::parse("order.created").unwrap(), b"X");
        assert_eq!(exchange.publish_message(message), 1);
        assert_eq!(audit.pending_len(), 1);
    }

    #[test]
    fn unroutable_messages_are_counted_not_raised() {
        let exchange = exchange();
        let orders = queue("order.queue");
        exchange.bind(orders.clone(), "order.*").unwrap();

        assert!(exchange.publish("shipment.delayed", b"late").is_ok());
        assert_eq!(orders.pending_len(), 0);
        assert_eq!(
            exchange.stats(),
            ExchangeStats {
                published: 1,
                unroutable: 1,
                dropped: 0
            }
        );
    }

    #[test]
    fn refused_messages_are_counted_as_dropped() {
        let exchange = exchange();
        let orders = queue("order.queue");
        exchange.bind(orders.clone(), "order.*").unwrap();
        orders.close();

        assert!(exchange.publish("order.created", b"X").is_ok());
        assert_eq!(orders.pending_len(), 0);
        assert_eq!(
            exchange.stats(),
            ExchangeStats {
                published: 1,
                unroutable: 0,
                dropped: 1
            }
        );

        let audit = queue("audit.queue");
        exchange.bind(audit.clone(), "#").unwrap();
        let message = Message::new(RoutingKey::parse("order.updated").unwrap(), b"Y");
        assert_eq!(exchange.publish_message(message), 1);
        assert_eq!(exchange.stats().dropped, 1);
    }

    #[test]
    fn unbind_stops_routing() {
        let exchange = exchange();
        let orders = queue("order.queue");
        exchange.bind(orders.clone(), "order.*").unwrap();

        assert!(exchange.unbind("order.queue", "order.*").unwrap());
        assert!(!exchange.unbind("order.queue", "order.*").unwrap());
        assert!(!exchange.unbind("missing.queue", "#").unwrap());
        assert_eq!(exchange.binding_count(), 0);

        exchange.publish("order.created", b"X").unwrap();
        assert_eq!(orders.pending_len(), 0);
        assert_eq!(exchange.stats().unroutable, 1);
    }

    #[test]
    fn malformed_input_is_surfaced() {
        let exchange = exchange();
        assert_eq!(
            exchange.bind(queue("q"), "order..*"),
            Err(AmqpError::MalformedPattern("order..*".into()))
        );
        assert_eq!(
            exchange.publish("order.", b"X"),
            Err(AmqpError::MalformedRoutingKey("order.".into()))
        );
        assert_eq!(exchange.stats().published, 0);
    }

    #[test]
    fn four_queue_topology_fan_out() {
        let exchange = exchange();
        let orders = queue("order.queue");
        let payments = queue("payment.queue");
        let audit = queue("audit.queue");
        let all = queue("all.queue");
        exchange.bind(orders.clone(), "order.*").unwrap();
        exchange.bind(payments.clone(), "payment.*").unwrap();
        exchange.bind(audit.clone(), "*.*").unwrap();
        exchange.bind(all.clone(), "#").unwrap();

        for key in ["order.created", "order.updated", "payment.success", "payment.failed"] {
            exchange.publish(key, key.as_bytes()).unwrap();
        }
        exchange.publish("heartbeat", b"").unwrap();

        assert_eq!(orders.pending_len(), 2);
        assert_eq!(payments.pending_len(), 2);
        assert_eq!(audit.pending_len(), 4);
        assert_eq!(all.pending_len(), 5);
    }
}
