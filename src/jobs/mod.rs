//! Scheduled Jobs
//!
//! Background maintenance: re-record ledger entries lost after a balance
//! update, audit every wallet's balance against its ledger, and report the
//! dead-letter backlog.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::bus::{BusError, DeadLetterSink};
use crate::config::Config;
use crate::error::AppError;
use crate::reconciler::Reconciler;
use crate::wallet::{WalletError, WalletStore};

// =========================================================================
// Ledger repair
// =========================================================================

/// Record missing ledger entries for every wallet.
/// A failing wallet is logged and skipped; the rest are still repaired.
pub async fn repair_ledger(
    wallets: &dyn WalletStore,
    reconciler: &Reconciler,
) -> Result<u64, JobError> {
    let mut repaired = 0u64;
    for wallet_id in wallets.list_wallet_ids().await? {
        match reconciler.repair_wallet(wallet_id).await {
            Ok(count) => repaired += count as u64,
            Err(e) => tracing::error!(wallet_id = %wallet_id, error = %e, "Ledger repair failed"),
        }
    }

    if repaired > 0 {
        tracing::warn!(repaired, "Repaired missing ledger entries");
    }

    Ok(repaired)
}

// =========================================================================
// Balance audit
// =========================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditSummary {
    pub audited: u64,
    pub drifted: u64,
    /// Wallets whose audit could not run
    pub failed: u64,
}

/// Compare each wallet's balance with its ledger sum.
/// A wallet that cannot be audited is logged, counted and skipped.
pub async fn audit_balances(
    wallets: &dyn WalletStore,
    reconciler: &Reconciler,
) -> Result<AuditSummary, JobError> {
    let mut summary = AuditSummary::default();
    for wallet_id in wallets.list_wallet_ids().await? {
        let audit = match reconciler.audit_wallet(wallet_id).await {
            Ok(audit) => audit,
            Err(e) => {
                summary.failed += 1;
                tracing::error!(wallet_id = %wallet_id, error = %e, "Balance audit failed");
                continue;
            }
        };
        summary.audited += 1;
        if !audit.is_consistent() {
            summary.drifted += 1;
            tracing::error!(
                wallet_id = %wallet_id,
                balance = audit.balance,
                ledger_total = audit.ledger_total,
                succeeded_total = audit.succeeded_total,
                drift = audit.drift,
                "Balance does not match ledger"
            );
        }
    }

    tracing::debug!(
        audited = summary.audited,
        drifted = summary.drifted,
        failed = summary.failed,
        "Balance audit complete"
    );
    Ok(summary)
}

// =========================================================================
// Dead-letter backlog
// =========================================================================

pub async fn dead_letter_backlog(dead_letters: &dyn DeadLetterSink) -> Result<u64, JobError> {
    let backlog = dead_letters.list().await?.len() as u64;
    if backlog > 0 {
        tracing::warn!(backlog, "Dead letters awaiting resolution");
    }
    Ok(backlog)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for ledger repair (default: 1 minute)
    pub ledger_repair_interval: Duration,
    /// Interval for balance audit and dead-letter report (default: 5 minutes)
    pub balance_audit_interval: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            ledger_repair_interval: Duration::from_secs(60),
            balance_audit_interval: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for JobSchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            ledger_repair_interval: config.ledger_repair_interval,
            balance_audit_interval: config.balance_audit_interval,
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    wallets: Arc<dyn WalletStore>,
    reconciler: Arc<Reconciler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        reconciler: Arc<Reconciler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            wallets,
            reconciler,
            dead_letters,
            config: JobSchedulerConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(mut self, config: JobSchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop
    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut repair_interval = interval(self.config.ledger_repair_interval);
        let mut audit_interval = interval(self.config.balance_audit_interval);

        loop {
            tokio::select! {
                _ = repair_interval.tick() => {
                    if let Err(e) = repair_ledger(self.wallets.as_ref(), &self.reconciler).await {
                        tracing::error!(error = %e, "Ledger repair failed");
                    }
                }
                _ = audit_interval.tick() => {
                    if let Err(e) = audit_balances(self.wallets.as_ref(), &self.reconciler).await {
                        tracing::error!(error = %e, "Balance audit failed");
                    }
                    if let Err(e) = dead_letter_backlog(self.dead_letters.as_ref()).await {
                        tracing::error!(error = %e, "Dead-letter report failed");
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            completed_at: Utc::now(),
            ..MaintenanceReport::default()
        };

        match repair_ledger(self.wallets.as_ref(), &self.reconciler).await {
            Ok(count) => report.ledger_entries_repaired = count,
            Err(e) => report.errors.push(format!("Ledger repair: {}", e)),
        }

        match audit_balances(self.wallets.as_ref(), &self.reconciler).await {
            Ok(summary) => {
                report.wallets_audited = summary.audited;
                report.wallets_drifted = summary.drifted;
                report.wallets_failed = summary.failed;
            }
            Err(e) => report.errors.push(format!("Balance audit: {}", e)),
        }

        match dead_letter_backlog(self.dead_letters.as_ref()).await {
            Ok(count) => report.dead_letters = count,
            Err(e) => report.errors.push(format!("Dead-letter report: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub ledger_entries_repaired: u64,
    pub wallets_audited: u64,
    pub wallets_drifted: u64,
    pub wallets_failed: u64,
    pub dead_letters: u64,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryDeadLetters, RecordingPublisher};
    use crate::domain::{AmountDelta, CurrencyCode};
    use crate::ledger::{EntryDirection, LedgerEntry, LedgerStore, MemoryLedgerStore};
    use crate::reconciler::RetryPolicy;
    use crate::wallet::{MemoryWalletStore, TransactionStatus, WalletTransaction};

    struct Harness {
        wallets: Arc<MemoryWalletStore>,
        ledger: Arc<MemoryLedgerStore>,
        scheduler: JobScheduler,
    }

    fn harness() -> Harness {
        let wallets = Arc::new(MemoryWalletStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let reconciler = Reconciler::new(
            wallets.clone(),
            ledger.clone(),
            Arc::new(RecordingPublisher::new()),
            dead_letters.clone(),
        )
        .with_policies(RetryPolicy::immediate(1), RetryPolicy::immediate(1))
        .with_repair_grace(Duration::ZERO);
        let scheduler = JobScheduler::new(wallets.clone(), Arc::new(reconciler), dead_letters);
        Harness {
            wallets,
            ledger,
            scheduler,
        }
    }

    /// A settled transaction whose ledger entry was never written
    async fn settled_without_ledger(h: &Harness, amount: i64) -> uuid::Uuid {
        let wallet = h
            .wallets
            .create_wallet("owner", None, &CurrencyCode::new("USD").unwrap())
            .await
            .unwrap();
        let delta = AmountDelta::new(amount).unwrap();
        h.wallets
            .append_transaction(wallet.id, WalletTransaction::pending("pi_1", delta))
            .await
            .unwrap();
        h.wallets
            .apply_reconciliation(wallet.id, "pi_1", delta, TransactionStatus::Succeeded)
            .await
            .unwrap();
        wallet.id
    }

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.ledger_repair_interval, Duration::from_secs(60));
        assert_eq!(config.balance_audit_interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_audit_flags_drift_then_repair_clears_it() {
        let h = harness();
        let wallet_id = settled_without_ledger(&h, 700).await;

        let summary = audit_balances(h.wallets.as_ref(), &h.scheduler.reconciler).await.unwrap();
        assert_eq!(
            summary,
            AuditSummary {
                audited: 1,
                drifted: 1,
                failed: 0
            }
        );

        let report = h.scheduler.run_all_once().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.ledger_entries_repaired, 1);
        assert_eq!(report.wallets_audited, 1);
        assert_eq!(report.wallets_drifted, 0);
        assert_eq!(h.ledger.wallet_total(wallet_id).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn test_audit_skips_wallet_that_cannot_be_audited() {
        let h = harness();
        let broken = h
            .wallets
            .create_wallet("broken", None, &CurrencyCode::new("USD").unwrap())
            .await
            .unwrap();
        for amount in [i64::MAX, 1] {
            h.ledger
                .record_entry(LedgerEntry::new(
                    uuid::Uuid::new_v4(),
                    broken.id,
                    EntryDirection::Credit,
                    amount,
                ))
                .await
                .unwrap();
        }
        settled_without_ledger(&h, 700).await;

        let summary = audit_balances(h.wallets.as_ref(), &h.scheduler.reconciler).await.unwrap();
        assert_eq!(
            summary,
            AuditSummary {
                audited: 1,
                drifted: 1,
                failed: 1
            }
        );

        let report = h.scheduler.run_all_once().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.wallets_audited, 1);
        assert_eq!(report.wallets_failed, 1);
        assert_eq!(report.wallets_drifted, 0);
    }

    #[tokio::test]
    async fn test_repair_is_idempotent() {
        let h = harness();
        settled_without_ledger(&h, 300).await;

        h.scheduler.run_all_once().await;
        let second = h.scheduler.run_all_once().await;
        assert_eq!(second.ledger_entries_repaired, 0);
        assert_eq!(h.ledger.len().await, 1);
    }
}
