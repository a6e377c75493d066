//! API module
//!
//! HTTP ingress: payment webhooks, event intake and read access to wallets,
//! ledger entries and aggregate state. Handlers only translate between HTTP
//! and the services held in [`AppState`].

pub mod middleware;
pub mod routes;

use axum::{middleware as axum_middleware, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::aggregate::ProtocolEngine;
use crate::bus::EventPublisher;
use crate::domain::CurrencyCode;
use crate::ledger::LedgerStore;
use crate::reconciler::Reconciler;
use crate::wallet::WalletService;

pub use routes::create_router;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub wallets: WalletService,
    pub ledger: Arc<dyn LedgerStore>,
    pub reconciler: Arc<Reconciler>,
    pub publisher: Arc<dyn EventPublisher>,
    pub engine: Arc<ProtocolEngine>,
    pub default_currency: CurrencyCode,
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Layers run last-added first: context, then logging, then the handler
    create_router()
        .layer(axum_middleware::from_fn(middleware::logging_middleware))
        .layer(axum_middleware::from_fn(middleware::context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
