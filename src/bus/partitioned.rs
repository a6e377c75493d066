//! Partitioned in-process bus
//!
//! One unbounded queue and one worker task per partition. The partition is
//! derived from a SHA-256 of the aggregate id, so all events of one aggregate
//! are handled sequentially in publish order while partitions run in parallel.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::domain::EconomicEvent;
use crate::reconciler::RetryPolicy;

use super::{BusError, DeadLetter, DeadLetterSink, EventBus, EventHandler, EventPublisher, HandlerError};

type Handlers = Arc<RwLock<Vec<Arc<dyn EventHandler>>>>;

pub struct PartitionedBus {
    senders: RwLock<Option<Vec<mpsc::UnboundedSender<EconomicEvent>>>>,
    handlers: Handlers,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Events published but not yet handled
    pending: Arc<watch::Sender<usize>>,
    partitions: usize,
}

struct Dispatcher {
    handlers: Handlers,
    retry: RetryPolicy,
    handler_timeout: Duration,
    dead_letters: Arc<dyn DeadLetterSink>,
    pending: Arc<watch::Sender<usize>>,
}

/// Map an aggregate id onto `[0, partitions)`.
pub fn partition_for(aggregate_id: &str, partitions: usize) -> usize {
    let digest = Sha256::digest(aggregate_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % partitions.max(1) as u64) as usize
}

impl PartitionedBus {
    /// Spawn the partition workers. Must be called inside a tokio runtime.
    pub fn new(
        partitions: usize,
        retry: RetryPolicy,
        handler_timeout: Duration,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let partitions = partitions.max(1);
        let handlers: Handlers = Arc::new(RwLock::new(Vec::new()));
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);

        let dispatcher = Arc::new(Dispatcher {
            handlers: handlers.clone(),
            retry,
            handler_timeout,
            dead_letters,
            pending: pending.clone(),
        });

        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            workers.push(tokio::spawn(run_partition(partition, rx, dispatcher.clone())));
        }

        tracing::info!(partitions, "Event bus started");

        Self {
            senders: RwLock::new(Some(senders)),
            handlers,
            workers: Mutex::new(workers),
            pending,
            partitions,
        }
    }

    pub fn from_config(config: &Config, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self::new(
            config.bus_partitions,
            RetryPolicy::transient(config),
            config.operation_timeout,
            dead_letters,
        )
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Number of events published and not yet handled.
    pub fn in_flight(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every published event, including follow-ons published
    /// while handling, has been handled.
    pub async fn flush(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting events, drain the queues and join the workers.
    pub async fn shutdown(&self) {
        let senders = self.senders.write().await.take();
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Partition worker panicked");
            }
        }
        tracing::info!("Event bus stopped");
    }
}

#[async_trait]
impl EventPublisher for PartitionedBus {
    async fn publish(&self, event: EconomicEvent) -> Result<(), BusError> {
        let senders = self.senders.read().await;
        let senders = senders.as_ref().ok_or(BusError::Closed)?;
        let partition = partition_for(&event.aggregate_id, senders.len());

        tracing::debug!(
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            correlation_id = %event.correlation_id,
            partition,
            "Publishing event"
        );

        self.pending.send_modify(|n| *n += 1);
        if senders[partition].send(event).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for PartitionedBus {
    async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        tracing::info!(handler = handler.name(), "Handler subscribed");
        self.handlers.write().await.push(handler);
    }
}

async fn run_partition(
    partition: usize,
    mut rx: mpsc::UnboundedReceiver<EconomicEvent>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Some(event) = rx.recv().await {
        dispatcher.dispatch(&event).await;
        dispatcher.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
    tracing::debug!(partition, "Partition worker drained");
}

impl Dispatcher {
    async fn dispatch(&self, event: &EconomicEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|h| h.handles(event.event_type))
            .cloned()
            .collect();

        if handlers.is_empty() {
            tracing::debug!(event_type = %event.event_type, "No handler for event");
            return;
        }

        for handler in handlers {
            self.deliver(handler.as_ref(), event).await;
        }
    }

    async fn deliver(&self, handler: &dyn EventHandler, event: &EconomicEvent) {
        let timeout = self.handler_timeout;
        let result = self
            .retry
            .run(handler.name(), HandlerError::is_retryable, |_| async move {
                match tokio::time::timeout(timeout, handler.handle(event)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Transient(format!(
                        "handler timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    handler = handler.name(),
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "Retries exhausted, dead-lettering event"
                );
                let letter = DeadLetter::new(handler.name(), event.clone(), &e, self.retry.max_attempts());
                if let Err(sink_error) = self.dead_letters.record(letter).await {
                    tracing::error!(error = %sink_error, "Failed to record dead letter");
                }
            }
            Err(e) => {
                tracing::warn!(
                    handler = handler.name(),
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    error = %e,
                    "Event rejected by handler"
                );
            }
        }
    }
}
