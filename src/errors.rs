// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topic Broker
//!
//! This module provides the error taxonomy shared by routing, topology, queue and
//! consumer operations. Parse errors are surfaced synchronously to the caller of
//! `bind`/`publish`; delivery-tag errors are non-fatal and usually logged and ignored.

use thiserror::Error;

/// Represents errors that can occur while routing, queueing or consuming messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Operation attempted on a broker session that was already closed
    #[error("broker session is closed")]
    ChannelError,

    /// The routing key violates the token rules
    #[error("malformed routing key `{0}`")]
    MalformedRoutingKey(String),

    /// The binding pattern violates the token rules
    #[error("malformed binding pattern `{0}`")]
    MalformedPattern(String),

    /// No exchange was declared with the given name
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// No queue was declared with the given name
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The delivery tag is not in flight: already resolved, or never issued
    #[error("unknown delivery tag `{0}`")]
    UnknownDeliveryTag(u64),

    /// The queue was closed while a consumer was waiting on it
    #[error("queue `{0}` was closed")]
    QueueClosed(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The user handler failed to process a message
    #[error("handler failure `{0}`")]
    HandlerFailure(String),

    /// One or more consumer workers terminated with a fault
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
