//! Tracing setup
//!
//! Installs the global subscriber once per process. Later calls are no-ops,
//! so tests can call `init` freely.

use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "wallet_ledger=debug,tower_http=debug";

static INIT: Once = Once::new();

/// Initialize tracing/logging
pub fn init(json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
        let registry = tracing_subscriber::registry().with(filter);

        // A subscriber installed elsewhere (test harness) wins.
        let installed = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
                .try_init()
        } else {
            registry.with(tracing_subscriber::fmt::layer()).try_init()
        };

        if installed.is_ok() {
            tracing::debug!(json, "Tracing initialized");
        }
    });
}
