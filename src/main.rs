//! wallet_ledger - wallet ledger and economic event protocol service
//!
//! Reconciles payment webhooks into wallet balances and an append-only
//! ledger, and drives the campaign/round/commitment/allocation/settlement
//! lifecycles from the economic event bus.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use wallet_ledger::aggregate::{PgStateStore, ProtocolEngine};
use wallet_ledger::api::{self, AppState};
use wallet_ledger::bus::{EventBus, PartitionedBus, PgDeadLetters};
use wallet_ledger::jobs::{JobScheduler, JobSchedulerConfig};
use wallet_ledger::ledger::PgLedgerStore;
use wallet_ledger::reconciler::{Reconciler, RetryPolicy};
use wallet_ledger::wallet::{PgWalletStore, WalletService};
use wallet_ledger::{db, telemetry, Config, CurrencyCode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    telemetry::init(config.json_logs());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let default_currency = CurrencyCode::new(&config.default_currency)?;

    tracing::info!(environment = %config.environment, "Starting wallet_ledger");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(config.operation_timeout)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;
    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    // Stores
    let wallets = Arc::new(PgWalletStore::new(pool.clone()));
    let ledger = Arc::new(PgLedgerStore::new(pool.clone()));
    let states = Arc::new(PgStateStore::new(pool.clone()));
    let dead_letters = Arc::new(PgDeadLetters::new(pool.clone()));

    // Bus and its subscribers
    let bus = Arc::new(PartitionedBus::from_config(&config, dead_letters.clone()));
    let reconciler = Arc::new(Reconciler::from_config(
        &config,
        wallets.clone(),
        ledger.clone(),
        bus.clone(),
        dead_letters.clone(),
    ));
    let engine = Arc::new(
        ProtocolEngine::new(states, bus.clone(), dead_letters.clone())
            .with_retry(RetryPolicy::transient(&config)),
    );
    bus.subscribe(reconciler.clone()).await;
    bus.subscribe(engine.clone()).await;

    let scheduler = JobScheduler::new(wallets.clone(), reconciler.clone(), dead_letters)
        .with_config(JobSchedulerConfig::from(&config))
        .start();

    let app = api::build_router(AppState {
        wallets: WalletService::new(wallets),
        ledger,
        reconciler,
        publisher: bus.clone(),
        engine,
        default_currency,
    });

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    scheduler.abort();
    bus.shutdown().await;
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
