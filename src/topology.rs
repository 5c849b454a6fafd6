// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides functionality for declaring a broker topology up front:
//! exchanges, queues, and the bindings between them, installed in that order.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `BrokerTopology`: Implementation of the Topology trait on a [`Broker`] session

use crate::{
    broker::Broker,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Trait defining the interface for topology management.
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares every exchange and queue, then sets up all the bindings.
    fn install(&self) -> Result<(), AmqpError>;
}

/// Topology installed onto a [`Broker`] session.
pub struct BrokerTopology<'tp> {
    broker: Arc<Broker>,
    pub(crate) queues: BTreeMap<&'tp str, &'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
}

impl<'tp> BrokerTopology<'tp> {
    /// Creates a new BrokerTopology instance.
    ///
    /// # Parameters
    /// * `broker` - The session the topology is declared on
    ///
    /// # Returns
    /// An empty topology
    pub fn new(broker: Arc<Broker>) -> BrokerTopology<'tp> {
        BrokerTopology {
            broker,
            queues: BTreeMap::default(),
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

impl<'tp> Topology<'tp> for BrokerTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.insert(&def.name, def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology onto the broker session.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on failure
    fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange()?;
        self.install_queue()?;
        self.binding_queues()
    }
}

impl BrokerTopology<'_> {
    fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.broker.declare_exchange(exch).inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                )
            })?;
        }

        Ok(())
    }

    fn install_queue(&self) -> Result<(), AmqpError> {
        for (name, def) in &self.queues {
            debug!("creating queue: {}", name);
            self.broker.declare_queue(def).inspect_err(|err| {
                error!(error = err.to_string(), name = *name, "error to declare the queue")
            })?;
        }

        Ok(())
    }

    fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.broker
                .bind(
                    binding.exchange_name,
                    binding.queue_name,
                    binding.routing_key,
                )
                .inspect_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange")
                })?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}
