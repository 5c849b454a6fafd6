// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Groups
//!
//! A [`ConsumerGroup`] drives a fixed pool of worker tasks against one queue. Each
//! worker owns a [`Consumer`] limited to `prefetch` unresolved deliveries and runs the
//! handler for each of them on its own task, so up to `prefetch` handlers per worker
//! may be in progress at once.
//!
//! Workers stop cooperatively: once signalled they take no new deliveries, wait for
//! the handlers already running to resolve, then exit. A worker whose queue is closed
//! terminates the same way and reports the failure through [`ConsumerGroup::stop`].

use crate::{
    consumer::{consume, Consumer},
    errors::AmqpError,
    handler::{ConsumerHandler, FailurePolicy, Outcome},
    queue::Queue,
};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
};
use tracing::{debug, error};

/// Worker pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerGroupDefinition {
    pub(crate) workers: usize,
    pub(crate) prefetch: usize,
    pub(crate) policy: FailurePolicy,
}

impl Default for ConsumerGroupDefinition {
    fn default() -> Self {
        ConsumerGroupDefinition {
            workers: 1,
            prefetch: 1,
            policy: FailurePolicy::default(),
        }
    }
}

impl ConsumerGroupDefinition {
    /// Creates the settings of a worker pool.
    ///
    /// # Parameters
    /// * `workers` - Number of workers, must be positive
    /// * `prefetch` - Unresolved deliveries allowed per worker, must be positive
    ///
    /// # Returns
    /// A definition with the requeue failure policy
    pub fn new(workers: usize, prefetch: usize) -> Self {
        ConsumerGroupDefinition {
            workers,
            prefetch,
            ..Default::default()
        }
    }

    /// Sets what happens to a delivery whose handler fails.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A running pool of workers bound to one queue.
#[derive(Debug)]
pub struct ConsumerGroup {
    queue: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<(), AmqpError>>>,
}

impl ConsumerGroup {
    /// Launches `worker_count` workers, each holding at most `prefetch` deliveries.
    ///
    /// Failed handlers are requeued. Must be called within a tokio runtime.
    ///
    /// # Parameters
    /// * `queue` - The queue to drain
    /// * `worker_count` - Number of workers
    /// * `prefetch` - Unresolved deliveries allowed per worker
    /// * `handler` - Handler shared by every worker
    ///
    /// # Returns
    /// The running group, or [`AmqpError::QoSDeclarationError`] when a count is zero
    pub fn start(
        queue: Arc<Queue>,
        worker_count: usize,
        prefetch: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerGroup, AmqpError> {
        Self::start_with(
            queue,
            ConsumerGroupDefinition::new(worker_count, prefetch),
            handler,
        )
    }

    /// Launches the workers described by `def`. See [`ConsumerGroup::start`].
    pub fn start_with(
        queue: Arc<Queue>,
        def: ConsumerGroupDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<ConsumerGroup, AmqpError> {
        if def.workers == 0 {
            return Err(AmqpError::QoSDeclarationError(format!(
                "worker count must be positive for `{}`",
                queue.name()
            )));
        }

        let consumers = (0..def.workers)
            .map(|id| {
                Consumer::new(
                    queue.clone(),
                    def.prefetch,
                    &format!("{}-worker-{}", queue.name(), id),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (shutdown, _) = watch::channel(false);

        let workers = consumers
            .into_iter()
            .map(|consumer| {
                tokio::spawn(run_worker(
                    consumer,
                    handler.clone(),
                    def.policy,
                    shutdown.subscribe(),
                ))
            })
            .collect();

        debug!(
            queue = queue.name(),
            workers = def.workers,
            prefetch = def.prefetch,
            "consumer group started"
        );

        Ok(ConsumerGroup {
            queue: queue.name().to_owned(),
            shutdown,
            workers,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signals every worker to stop and waits until all of them have exited.
    ///
    /// Handlers already running complete and resolve their deliveries first. Returns
    /// [`AmqpError::ConsumerError`] when any worker terminated because of a fault.
    pub async fn stop(self) -> Result<(), AmqpError> {
        debug!(queue = self.queue.as_str(), "stopping consumer group");
        self.shutdown.send_replace(true);
        self.join().await
    }

    /// Waits for the workers to exit on their own, e.g. after their queue was closed.
    pub async fn join(self) -> Result<(), AmqpError> {
        let results = join_all(self.workers).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|res| match res {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(err) => Some(err.to_string()),
            })
            .collect();

        if failures.is_empty() {
            debug!(queue = self.queue.as_str(), "consumer group stopped");
            return Ok(());
        }

        error!(
            queue = self.queue.as_str(),
            failures = failures.len(),
            "consumer workers terminated with failure"
        );
        Err(AmqpError::ConsumerError(failures.join("; ")))
    }
}

/// Worker loop: IDLE while waiting for budget and a message, PROCESSING while any of
/// its handler tasks run, STOPPING once signalled or once the queue fails.
async fn run_worker(
    consumer: Consumer,
    handler: Arc<dyn ConsumerHandler>,
    policy: FailurePolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AmqpError> {
    let mut in_progress = JoinSet::new();

    let result = loop {
        if *shutdown.borrow_and_update() {
            break Ok(());
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                // group handle dropped without stop()
                if changed.is_err() {
                    break Ok(());
                }
            }

            Some(done) = in_progress.join_next(), if !in_progress.is_empty() => {
                log_consumed(consumer.consumer_tag(), done);
            }

            next = consumer.next() => match next {
                Ok(pending) => {
                    in_progress.spawn(consume(pending, handler.clone(), policy));
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        consumer = consumer.consumer_tag(),
                        "worker lost its queue"
                    );
                    break Err(err);
                }
            },
        }
    };

    while let Some(done) = in_progress.join_next().await {
        log_consumed(consumer.consumer_tag(), done);
    }

    debug!(consumer = consumer.consumer_tag(), "worker terminated");
    result
}

fn log_consumed(consumer: &str, done: Result<Result<Outcome, AmqpError>, JoinError>) {
    match done {
        Ok(Ok(outcome)) => debug!(consumer, ?outcome, "delivery resolved"),
        Ok(Err(err)) => error!(error = err.to_string(), consumer, "error consume msg"),
        Err(err) => error!(error = err.to_string(), consumer, "handler task failure"),
    }
}
