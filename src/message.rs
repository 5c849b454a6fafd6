// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! A [`Message`] is created once at publish time and shared, never mutated, by every
//! queue it was routed to. A [`Delivery`] is one in-flight instance of a message handed
//! out by a queue and correlated with its ack/nack through the delivery tag.

use crate::routing::RoutingKey;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use uuid::Uuid;

pub type MessageId = Uuid;

/// Text headers carried next to the payload (message type, trace context, ...).
pub type Headers = BTreeMap<String, String>;

/// An immutable published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub routing_key: RoutingKey,
    pub msg_type: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message with a fresh v4 id, stamped with the current time.
    pub fn new(routing_key: RoutingKey, payload: &[u8]) -> Message {
        Message {
            id: Uuid::new_v4(),
            routing_key,
            msg_type: None,
            payload: payload.to_vec(),
            headers: Headers::default(),
            published_at: Utc::now(),
        }
    }

    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// One in-flight instance of a message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Arc<Message>,
    pub queue: String,
    pub tag: u64,
    /// Set when the message was returned to the queue by a nack and handed out again.
    pub redelivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_messages_get_distinct_ids_and_timestamps() {
        let key = RoutingKey::parse("order.created").unwrap();
        let before = Utc::now();
        let first = Message::new(key.clone(), b"X");
        let second = Message::new(key, b"X").with_type("order_created");

        assert_ne!(first.id, second.id);
        assert_eq!(first.id.get_version_num(), 4);
        assert!(first.published_at >= before);
        assert_eq!(second.msg_type.as_deref(), Some("order_created"));
        assert!(second.headers.is_empty());
    }
}
