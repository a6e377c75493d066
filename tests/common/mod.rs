//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use wallet_ledger::aggregate::{MemoryStateStore, ProtocolEngine};
use wallet_ledger::api::{self, AppState};
use wallet_ledger::bus::{EventBus, MemoryDeadLetters, PartitionedBus};
use wallet_ledger::domain::{AmountDelta, CurrencyCode};
use wallet_ledger::ledger::MemoryLedgerStore;
use wallet_ledger::reconciler::{Reconciler, RetryPolicy};
use wallet_ledger::wallet::{MemoryWalletStore, WalletService, WalletStore, WalletTransaction};

/// Fully wired service on in-memory stores
pub struct Harness {
    pub wallets: Arc<MemoryWalletStore>,
    pub ledger: Arc<MemoryLedgerStore>,
    pub states: Arc<MemoryStateStore>,
    pub dead_letters: Arc<MemoryDeadLetters>,
    pub bus: Arc<PartitionedBus>,
    pub reconciler: Arc<Reconciler>,
    pub engine: Arc<ProtocolEngine>,
}

/// Short real delays so retries across partitions can observe progress
pub fn test_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(5), Duration::from_millis(40))
}

pub async fn harness() -> Harness {
    wallet_ledger::telemetry::init(false);

    let wallets = Arc::new(MemoryWalletStore::new());
    let ledger = Arc::new(MemoryLedgerStore::new());
    let states = Arc::new(MemoryStateStore::new());
    let dead_letters = Arc::new(MemoryDeadLetters::new());

    let bus = Arc::new(PartitionedBus::new(
        4,
        test_retry(),
        Duration::from_secs(2),
        dead_letters.clone(),
    ));
    let reconciler = Arc::new(
        Reconciler::new(
            wallets.clone(),
            ledger.clone(),
            bus.clone(),
            dead_letters.clone(),
        )
        .with_policies(test_retry(), test_retry())
        .with_repair_grace(Duration::ZERO),
    );
    let engine = Arc::new(
        ProtocolEngine::new(states.clone(), bus.clone(), dead_letters.clone())
            .with_retry(test_retry()),
    );
    bus.subscribe(reconciler.clone()).await;
    bus.subscribe(engine.clone()).await;

    Harness {
        wallets,
        ledger,
        states,
        dead_letters,
        bus,
        reconciler,
        engine,
    }
}

impl Harness {
    pub fn router(&self) -> Router {
        api::build_router(AppState {
            wallets: WalletService::new(self.wallets.clone()),
            ledger: self.ledger.clone(),
            reconciler: self.reconciler.clone(),
            publisher: self.bus.clone(),
            engine: self.engine.clone(),
            default_currency: usd(),
        })
    }

    pub async fn open_wallet(&self, owner: &str) -> Uuid {
        self.wallets
            .create_wallet(owner, None, &usd())
            .await
            .expect("create wallet")
            .id
    }

    pub async fn pending(&self, wallet_id: Uuid, intent: &str, amount: i64) {
        self.wallets
            .append_transaction(
                wallet_id,
                WalletTransaction::pending(intent, AmountDelta::new(amount).expect("amount")),
            )
            .await
            .expect("append pending");
    }
}

pub fn usd() -> CurrencyCode {
    CurrencyCode::new("USD").expect("currency")
}

/// Connect to `DATABASE_URL` and empty every table
pub async fn setup_test_db() -> PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to DB");

    assert!(
        wallet_ledger::db::check_schema(&pool).await.expect("schema check"),
        "run migrations/001_wallet_ledger.sql first"
    );

    // The ledger trigger forbids DELETE but not TRUNCATE
    sqlx::query(
        "TRUNCATE TABLE ledger_entries, wallet_transactions, wallets, aggregate_states, dead_letters",
    )
    .execute(&pool)
    .await
    .expect("Failed to clean up DB");

    pool
}
