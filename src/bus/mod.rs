//! Economic event bus
//!
//! At-least-once pub/sub between the reconciler, the protocol state machines
//! and downstream services. Delivery order is preserved only among events
//! that share an aggregate id; the bus does not deduplicate, so every handler
//! must be idempotent.

mod dead_letter;
mod partitioned;
mod recording;

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{EconomicEvent, EventType};

pub use dead_letter::{DeadLetter, DeadLetterSink, MemoryDeadLetters, PgDeadLetters};
pub use partitioned::PartitionedBus;
pub use recording::RecordingPublisher;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Event bus unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Unavailable(_) | BusError::Database(_))
    }
}

/// Failure reported by an event handler. The variant decides redelivery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Storage or bus unavailable; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Referenced entity does not exist yet; retried to absorb reordering
    #[error("not found: {0}")]
    NotFound(String),

    /// The event can never succeed; acknowledged and logged
    #[error("rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::NotFound(_))
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Serialization(_) => HandlerError::Rejected(e.to_string()),
            _ => HandlerError::Transient(e.to_string()),
        }
    }
}

/// Consumer of economic events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used as part of the dead-letter key.
    fn name(&self) -> &'static str;

    fn handles(&self, event_type: EventType) -> bool;

    async fn handle(&self, event: &EconomicEvent) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EconomicEvent) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventBus: EventPublisher {
    async fn subscribe(&self, handler: Arc<dyn EventHandler>);
}
