//! Domain module
//!
//! Core domain types: money primitives, the event taxonomy and the economic
//! event envelope.

pub mod amount;
pub mod context;
pub mod error;
pub mod events;
pub mod taxonomy;

pub use amount::{AmountDelta, AmountError, CurrencyCode, MAX_ABS_DELTA};
pub use context::OperationContext;
pub use error::DomainError;
pub use events::{
    AppTermsPayload, AttributionPayload, EconomicEvent, EventPayload, LifecyclePayload,
    MonetaryPayload, PerformancePayload, RawEconomicEvent,
};
pub use taxonomy::{AggregateKind, EventFamily, EventType, PayloadKind};
