//! wallet_ledger Library
//!
//! Re-exports modules for integration testing and external use.

pub mod aggregate;
pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod reconciler;
pub mod telemetry;
pub mod wallet;

pub use config::Config;
pub use domain::{AmountDelta, CurrencyCode, DomainError, EconomicEvent, EventType, OperationContext};
pub use error::{AppError, AppResult};
