//! Payment/Event Reconciler
//!
//! Applies payment webhooks and money-moving economic events to the wallet
//! and ledger stores exactly once. Every store call runs under a timeout and
//! a bounded transient retry; lookups of a transaction that may not exist yet
//! get a separate not-found retry to absorb creation races.
//!
//! After a successful balance update the ledger write and the outbound event
//! are retried independently and dead-lettered when retries run out. Both are
//! keyed by the transaction id, so replaying the input is always safe.

mod commands;
mod retry;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::bus::{DeadLetter, DeadLetterSink, EventHandler, EventPublisher, HandlerError};
use crate::config::Config;
use crate::domain::{EconomicEvent, EventType, OperationContext};
use crate::error::{AppError, AppResult};
use crate::ledger::{LedgerEntry, LedgerStore};
use crate::wallet::{
    FailureOutcome, ReconciliationOutcome, TransactionStatus, WalletLookup, WalletStore,
    WalletTransaction,
};

pub use commands::{
    CommandAction, PaymentWebhook, ReconciliationCommand, ReconciliationReport, WebhookKind,
};
pub use retry::RetryPolicy;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REPAIR_GRACE: Duration = Duration::from_secs(60);

/// Balance versus ledger for one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceAudit {
    pub wallet_id: Uuid,
    pub balance: i64,
    pub ledger_total: i64,
    pub succeeded_total: i64,
    pub pending: usize,
    /// `balance - ledger_total`
    pub drift: i64,
}

impl BalanceAudit {
    pub fn is_consistent(&self) -> bool {
        self.drift == 0 && self.balance == self.succeeded_total
    }
}

pub struct Reconciler {
    wallets: Arc<dyn WalletStore>,
    ledger: Arc<dyn LedgerStore>,
    publisher: Arc<dyn EventPublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    transient: RetryPolicy,
    not_found: RetryPolicy,
    timeout: Duration,
    repair_grace: Duration,
}

impl Reconciler {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        ledger: Arc<dyn LedgerStore>,
        publisher: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            wallets,
            ledger,
            publisher,
            dead_letters,
            transient: RetryPolicy::default(),
            not_found: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            repair_grace: DEFAULT_REPAIR_GRACE,
        }
    }

    pub fn from_config(
        config: &Config,
        wallets: Arc<dyn WalletStore>,
        ledger: Arc<dyn LedgerStore>,
        publisher: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self::new(wallets, ledger, publisher, dead_letters)
            .with_policies(RetryPolicy::transient(config), RetryPolicy::not_found(config))
            .with_timeout(config.operation_timeout)
    }

    pub fn with_policies(mut self, transient: RetryPolicy, not_found: RetryPolicy) -> Self {
        self.transient = transient;
        self.not_found = not_found;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Minimum age of a succeeded transaction before repair touches it.
    pub fn with_repair_grace(mut self, grace: Duration) -> Self {
        self.repair_grace = grace;
        self
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    pub async fn handle_webhook(
        &self,
        webhook: &PaymentWebhook,
        context: &OperationContext,
    ) -> AppResult<ReconciliationReport> {
        let correlation_id = webhook
            .correlation_id
            .clone()
            .or_else(|| context.correlation_id.clone())
            .unwrap_or_else(|| webhook.payment_intent_id.clone());
        let command = ReconciliationCommand::from_webhook(webhook, correlation_id)?;

        tracing::info!(
            kind = ?webhook.kind,
            payment_intent_id = %webhook.payment_intent_id,
            correlation_id = %command.correlation_id,
            "Payment webhook received"
        );

        if webhook.kind.is_success() {
            self.execute(&command).await
        } else {
            self.fail_payment(&command).await
        }
    }

    pub async fn reconcile_event(&self, event: &EconomicEvent) -> AppResult<ReconciliationReport> {
        let command = ReconciliationCommand::from_event(event)?;
        self.execute(&command).await
    }

    pub async fn execute(&self, command: &ReconciliationCommand) -> AppResult<ReconciliationReport> {
        match command.action {
            CommandAction::EnsurePending => {
                let (wallet_id, transaction) = self.ensure_pending(command).await?;
                Ok(ReconciliationReport {
                    wallet_id,
                    transaction,
                    applied: false,
                    ledger_recorded: false,
                    published: false,
                })
            }
            CommandAction::Settle => {
                let (wallet_id, transaction) = self.locate(command).await?;
                self.settle(command, wallet_id, transaction).await
            }
            CommandAction::EnsureAndSettle => {
                let (wallet_id, transaction) = self.ensure_pending(command).await?;
                self.settle(command, wallet_id, transaction).await
            }
        }
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Run one store call under the timeout boundary and transient retry.
    async fn guarded<T, E, F, Fut>(&self, operation: &'static str, mut call: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        AppError: From<E>,
    {
        let timeout = self.timeout;
        self.transient
            .run(operation, AppError::is_retryable, |_| {
                let fut = call();
                async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result.map_err(AppError::from),
                        Err(_) => Err(AppError::Transient(format!(
                            "{} timed out after {}ms",
                            operation,
                            timeout.as_millis()
                        ))),
                    }
                }
            })
            .await
    }

    /// Step 1-2: resolve wallet and transaction, retrying not-found.
    async fn locate(&self, command: &ReconciliationCommand) -> AppResult<(Uuid, WalletTransaction)> {
        self.not_found
            .run("locate_transaction", AppError::is_not_found, |_| {
                self.locate_once(command)
            })
            .await
    }

    async fn locate_once(
        &self,
        command: &ReconciliationCommand,
    ) -> AppResult<(Uuid, WalletTransaction)> {
        let intent = command.payment_intent_id.as_str();
        match command.wallet_id {
            Some(wallet_id) => {
                let wallet = self
                    .guarded("get_wallet", || self.wallets.get_wallet(WalletLookup::ById(wallet_id)))
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("wallet {}", wallet_id)))?;
                let transaction = wallet.transaction(intent).cloned().ok_or_else(|| {
                    AppError::NotFound(format!("payment intent {} in wallet {}", intent, wallet_id))
                })?;
                Ok((wallet_id, transaction))
            }
            None => self
                .guarded("find_transaction", || self.wallets.find_transaction(intent))
                .await?
                .ok_or_else(|| AppError::NotFound(format!("payment intent {}", intent))),
        }
    }

    async fn ensure_pending(
        &self,
        command: &ReconciliationCommand,
    ) -> AppResult<(Uuid, WalletTransaction)> {
        let wallet_id = command
            .wallet_id
            .ok_or_else(|| AppError::Validation("wallet_id is required".into()))?;
        let reverses = match &command.reverses_intent {
            Some(original) => Some(self.locate_original(wallet_id, original).await?.id),
            None => None,
        };
        let pending = command
            .pending_transaction(reverses)
            .ok_or_else(|| AppError::Validation("amount_delta is required".into()))?;

        let appended = self
            .guarded("append_transaction", || {
                self.wallets.append_transaction(wallet_id, pending.clone())
            })
            .await;

        match appended {
            Ok(transaction) => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %transaction.payment_intent_id,
                    amount_delta = %transaction.amount_delta,
                    correlation_id = %command.correlation_id,
                    "Pending transaction registered"
                );
                Ok((wallet_id, transaction))
            }
            Err(AppError::Conflict(_)) => {
                tracing::debug!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %command.payment_intent_id,
                    "Transaction already registered"
                );
                self.locate_once(command).await
            }
            Err(e) => Err(e),
        }
    }

    /// The settled transaction a correction reverses.
    async fn locate_original(&self, wallet_id: Uuid, intent: &str) -> AppResult<WalletTransaction> {
        let original = self
            .not_found
            .run("locate_original", AppError::is_not_found, move |_| async move {
                let wallet = self
                    .guarded("get_wallet", || self.wallets.get_wallet(WalletLookup::ById(wallet_id)))
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("wallet {}", wallet_id)))?;
                wallet.transaction(intent).cloned().ok_or_else(|| {
                    AppError::NotFound(format!("corrected intent {} in wallet {}", intent, wallet_id))
                })
            })
            .await?;

        if original.status != TransactionStatus::Succeeded {
            return Err(AppError::Validation(format!(
                "cannot correct {} transaction {}",
                original.status, intent
            )));
        }
        Ok(original)
    }

    /// Step 3-4: conditional status update, then ledger and outbound event.
    async fn settle(
        &self,
        command: &ReconciliationCommand,
        wallet_id: Uuid,
        transaction: WalletTransaction,
    ) -> AppResult<ReconciliationReport> {
        let amount_delta = command.amount_delta.unwrap_or(transaction.amount_delta);
        let intent = command.payment_intent_id.as_str();

        let outcome = self
            .guarded("apply_reconciliation", || {
                self.wallets.apply_reconciliation(
                    wallet_id,
                    intent,
                    amount_delta,
                    TransactionStatus::Succeeded,
                )
            })
            .await?;

        let applied = outcome.was_applied();
        let transaction = match outcome {
            ReconciliationOutcome::Applied(tx) => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %intent,
                    amount_delta = %tx.amount_delta,
                    correlation_id = %command.correlation_id,
                    "Reconciliation applied"
                );
                tx
            }
            ReconciliationOutcome::AlreadyTerminal(tx) => {
                tracing::debug!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %intent,
                    status = %tx.status,
                    "Transaction already terminal, replay is a no-op"
                );
                if tx.status != TransactionStatus::Succeeded {
                    return Ok(ReconciliationReport {
                        wallet_id,
                        transaction: tx,
                        applied: false,
                        ledger_recorded: false,
                        published: false,
                    });
                }
                tx
            }
        };

        let (ledger_recorded, inserted) = self
            .record_ledger(command, wallet_id, &transaction)
            .await;

        // A replay publishes only when it also had to write the missing entry
        let published = if applied || inserted {
            self.publish_ledger_event(command, wallet_id, &transaction).await
        } else {
            false
        };

        Ok(ReconciliationReport {
            wallet_id,
            transaction,
            applied,
            ledger_recorded,
            published,
        })
    }

    /// Returns (entry present, inserted by this call).
    async fn record_ledger(
        &self,
        command: &ReconciliationCommand,
        wallet_id: Uuid,
        transaction: &WalletTransaction,
    ) -> (bool, bool) {
        let existing = self
            .guarded("entries_by_transaction", || {
                self.ledger.entries_by_transaction(transaction.id)
            })
            .await;
        if let Ok(entries) = &existing {
            if !entries.is_empty() {
                return (true, false);
            }
        }

        let entry = LedgerEntry::for_settled(wallet_id, transaction);
        match self
            .guarded("record_entry", || self.ledger.record_entry(entry.clone()))
            .await
        {
            Ok(outcome) => (true, outcome.was_inserted()),
            Err(e) => {
                tracing::error!(
                    wallet_id = %wallet_id,
                    transaction_id = %transaction.id,
                    error = %e,
                    "Ledger write failed after balance update"
                );
                self.dead_letter("reconciler.ledger", command, wallet_id, transaction, &e)
                    .await;
                (false, false)
            }
        }
    }

    async fn publish_ledger_event(
        &self,
        command: &ReconciliationCommand,
        wallet_id: Uuid,
        transaction: &WalletTransaction,
    ) -> bool {
        let event = match ledger_event(command, wallet_id, transaction) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build ledger event");
                return false;
            }
        };

        match self
            .guarded("publish", || self.publisher.publish(event.clone()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    wallet_id = %wallet_id,
                    transaction_id = %transaction.id,
                    error = %e,
                    "Ledger event publish failed"
                );
                self.dead_letter("reconciler.publish", command, wallet_id, transaction, &e)
                    .await;
                false
            }
        }
    }

    async fn dead_letter(
        &self,
        handler: &str,
        command: &ReconciliationCommand,
        wallet_id: Uuid,
        transaction: &WalletTransaction,
        error: &AppError,
    ) {
        let event = match ledger_event(command, wallet_id, transaction) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build dead letter");
                return;
            }
        };
        let letter = DeadLetter::new(handler, event, error, self.transient.max_attempts());
        if let Err(e) = self.dead_letters.record(letter).await {
            tracing::error!(error = %e, "Failed to record dead letter");
        }
    }

    async fn fail_payment(&self, command: &ReconciliationCommand) -> AppResult<ReconciliationReport> {
        let (wallet_id, _) = self.locate(command).await?;
        let intent = command.payment_intent_id.as_str();

        let outcome = self
            .guarded("mark_failed", || self.wallets.mark_failed(wallet_id, intent))
            .await?;

        let (applied, transaction) = match outcome {
            FailureOutcome::MarkedFailed(tx) => {
                tracing::info!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %intent,
                    correlation_id = %command.correlation_id,
                    "Payment marked failed"
                );
                (true, tx)
            }
            FailureOutcome::AlreadyTerminal(tx) => {
                tracing::debug!(
                    wallet_id = %wallet_id,
                    payment_intent_id = %intent,
                    status = %tx.status,
                    "Transaction already terminal, failure ignored"
                );
                (false, tx)
            }
        };

        Ok(ReconciliationReport {
            wallet_id,
            transaction,
            applied,
            ledger_recorded: false,
            published: false,
        })
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Record ledger entries missing for succeeded transactions.
    ///
    /// Transactions younger than the repair grace are skipped so an
    /// in-flight reconciliation keeps ownership of its entry.
    pub async fn repair_wallet(&self, wallet_id: Uuid) -> AppResult<usize> {
        let wallet = self
            .wallets
            .get_wallet(WalletLookup::ById(wallet_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet {}", wallet_id)))?;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.repair_grace).unwrap_or_else(|_| chrono::Duration::zero());

        let mut repaired = 0;
        for tx in wallet
            .transactions
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Succeeded && tx.updated_at <= cutoff)
        {
            if !self.ledger.entries_by_transaction(tx.id).await?.is_empty() {
                continue;
            }
            let entry = LedgerEntry::for_settled(wallet_id, tx);
            if self.ledger.record_entry(entry).await?.was_inserted() {
                tracing::warn!(
                    wallet_id = %wallet_id,
                    transaction_id = %tx.id,
                    payment_intent_id = %tx.payment_intent_id,
                    "Repaired missing ledger entry"
                );
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    pub async fn audit_wallet(&self, wallet_id: Uuid) -> AppResult<BalanceAudit> {
        let wallet = self
            .wallets
            .get_wallet(WalletLookup::ById(wallet_id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("wallet {}", wallet_id)))?;
        let ledger_total = self.ledger.wallet_total(wallet_id).await?;

        Ok(BalanceAudit {
            wallet_id,
            balance: wallet.balance,
            ledger_total,
            succeeded_total: wallet.succeeded_total(),
            pending: wallet.pending_count(),
            drift: wallet.balance - ledger_total,
        })
    }
}

fn ledger_event(
    command: &ReconciliationCommand,
    wallet_id: Uuid,
    transaction: &WalletTransaction,
) -> AppResult<EconomicEvent> {
    let event_type = if transaction.is_correction() {
        EventType::LedgerAdjusted
    } else {
        EventType::LedgerAccrued
    };
    let event = EconomicEvent::new(
        event_type,
        wallet_id.to_string(),
        command.correlation_id.clone(),
        json!({
            "wallet_id": wallet_id,
            "payment_intent_id": transaction.payment_intent_id,
            "amount_delta": transaction.amount_delta.value(),
            "transaction_id": transaction.id,
            "reverses_transaction_id": transaction.reverses,
            "source": command.source.as_str(),
        }),
    )?;
    Ok(event)
}

#[async_trait]
impl EventHandler for Reconciler {
    fn name(&self) -> &'static str {
        "reconciler"
    }

    fn handles(&self, event_type: EventType) -> bool {
        matches!(
            event_type,
            EventType::SpendAuthorized
                | EventType::SpendExecuted
                | EventType::InvoicePaid
                | EventType::SpendRefunded
                | EventType::RefundIssued
                | EventType::Chargeback
        )
    }

    async fn handle(&self, event: &EconomicEvent) -> Result<(), HandlerError> {
        match self.reconcile_event(event).await {
            Ok(_) => Ok(()),
            // Creation races were already absorbed by the not-found policy
            Err(AppError::NotFound(what)) => Err(HandlerError::Rejected(format!("not found: {}", what))),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryDeadLetters, RecordingPublisher};
    use crate::domain::{AmountDelta, CurrencyCode};
    use crate::ledger::{EntryDirection, MemoryLedgerStore};
    use crate::wallet::MemoryWalletStore;

    struct Harness {
        wallets: Arc<MemoryWalletStore>,
        ledger: Arc<MemoryLedgerStore>,
        publisher: Arc<RecordingPublisher>,
        dead_letters: Arc<MemoryDeadLetters>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let wallets = Arc::new(MemoryWalletStore::new());
        let ledger = Arc::new(MemoryLedgerStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let dead_letters = Arc::new(MemoryDeadLetters::new());
        let reconciler = Reconciler::new(
            wallets.clone(),
            ledger.clone(),
            publisher.clone(),
            dead_letters.clone(),
        )
        .with_policies(RetryPolicy::immediate(3), RetryPolicy::immediate(2))
        .with_repair_grace(Duration::ZERO);
        Harness {
            wallets,
            ledger,
            publisher,
            dead_letters,
            reconciler,
        }
    }

    async fn wallet_with_pending(h: &Harness, intent: &str, amount: i64) -> Uuid {
        let wallet = h
            .wallets
            .create_wallet("owner", None, &CurrencyCode::new("USD").unwrap())
            .await
            .unwrap();
        h.wallets
            .append_transaction(
                wallet.id,
                WalletTransaction::pending(intent, AmountDelta::new(amount).unwrap()),
            )
            .await
            .unwrap();
        wallet.id
    }

    fn succeeded(intent: &str) -> PaymentWebhook {
        PaymentWebhook {
            kind: WebhookKind::PaymentIntentSucceeded,
            payment_intent_id: intent.to_string(),
            amount_delta: None,
            wallet_id: None,
            correlation_id: Some("corr-1".into()),
        }
    }

    #[tokio::test]
    async fn test_webhook_settles_and_records() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;

        let report = h
            .reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();

        assert!(report.applied && report.ledger_recorded && report.published);
        let audit = h.reconciler.audit_wallet(wallet_id).await.unwrap();
        assert_eq!(audit.balance, 500);
        assert!(audit.is_consistent());

        let events = h.publisher.events_of(EventType::LedgerAccrued).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "corr-1");
    }

    #[tokio::test]
    async fn test_webhook_replay_is_noop() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        let ctx = OperationContext::new();

        h.reconciler.handle_webhook(&succeeded("pi_1"), &ctx).await.unwrap();
        let replay = h.reconciler.handle_webhook(&succeeded("pi_1"), &ctx).await.unwrap();

        assert!(!replay.applied);
        assert!(!replay.published);
        assert_eq!(h.ledger.len().await, 1);
        assert_eq!(h.reconciler.audit_wallet(wallet_id).await.unwrap().balance, 500);
        assert_eq!(h.publisher.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_intent_is_not_found() {
        let h = harness();
        wallet_with_pending(&h, "pi_1", 500).await;
        let result = h
            .reconciler
            .handle_webhook(&succeeded("pi_missing"), &OperationContext::new())
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_webhook_marks_matching_transaction() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        let webhook = PaymentWebhook {
            kind: WebhookKind::PaymentIntentFailed,
            ..succeeded("pi_1")
        };

        let report = h
            .reconciler
            .handle_webhook(&webhook, &OperationContext::new())
            .await
            .unwrap();

        assert!(report.applied);
        assert_eq!(report.transaction.status, TransactionStatus::Failed);
        assert!(h.ledger.is_empty().await);
        assert_eq!(h.reconciler.audit_wallet(wallet_id).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        h.wallets.fail_next(2);

        h.reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();
        assert_eq!(h.reconciler.audit_wallet(wallet_id).await.unwrap().balance, 500);
    }

    #[tokio::test]
    async fn test_ledger_failure_is_dead_lettered_then_repaired() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        h.ledger.fail_next(3);

        let report = h
            .reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();

        assert!(report.applied);
        assert!(!report.ledger_recorded);
        let letters = h.dead_letters.list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].handler, "reconciler.ledger");

        let audit = h.reconciler.audit_wallet(wallet_id).await.unwrap();
        assert_eq!(audit.drift, 500);

        assert_eq!(h.reconciler.repair_wallet(wallet_id).await.unwrap(), 1);
        assert!(h.reconciler.audit_wallet(wallet_id).await.unwrap().is_consistent());
        assert_eq!(h.reconciler.repair_wallet(wallet_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_after_lost_ledger_write_records_it() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        h.ledger.fail_next(3);
        let ctx = OperationContext::new();

        h.reconciler.handle_webhook(&succeeded("pi_1"), &ctx).await.unwrap();
        let replay = h.reconciler.handle_webhook(&succeeded("pi_1"), &ctx).await.unwrap();

        assert!(!replay.applied);
        assert!(replay.ledger_recorded);
        assert!(h.reconciler.audit_wallet(wallet_id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_chargeback_writes_reversal() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        h.reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();

        let chargeback = EconomicEvent::new(
            EventType::Chargeback,
            "invoice-1",
            "corr-cb",
            json!({ "wallet_id": wallet_id, "amount_delta": -500 }),
        )
        .unwrap();
        let report = h.reconciler.reconcile_event(&chargeback).await.unwrap();

        assert!(report.applied);
        let entries = h.ledger.entries_by_transaction(report.transaction.id).await.unwrap();
        assert_eq!(entries[0].direction, EntryDirection::Reversal);
        assert_eq!(h.publisher.events_of(EventType::LedgerAdjusted).await.len(), 1);

        let audit = h.reconciler.audit_wallet(wallet_id).await.unwrap();
        assert_eq!(audit.balance, 0);
        assert!(audit.is_consistent());
    }

    fn refund(wallet_id: Uuid, intent: &str, correlation_id: &str) -> EconomicEvent {
        EconomicEvent::new(
            EventType::RefundIssued,
            "invoice-1",
            correlation_id,
            json!({ "wallet_id": wallet_id, "payment_intent_id": intent, "amount_delta": -500 }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refund_of_settled_intent_reverses_it() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        let settled = h
            .reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();

        let event = refund(wallet_id, "pi_1", "corr-refund");
        let report = h.reconciler.reconcile_event(&event).await.unwrap();

        assert!(report.applied);
        assert_ne!(report.transaction.id, settled.transaction.id);
        assert_eq!(report.transaction.reverses, Some(settled.transaction.id));
        let entries = h.ledger.entries_by_transaction(report.transaction.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, EntryDirection::Reversal);
        assert_eq!(entries[0].reverses, Some(settled.transaction.id));

        let adjusted = h.publisher.events_of(EventType::LedgerAdjusted).await;
        assert_eq!(adjusted.len(), 1);
        assert_eq!(
            adjusted[0].payload.to_value()["reverses_transaction_id"],
            json!(settled.transaction.id)
        );

        let replay = h.reconciler.reconcile_event(&event).await.unwrap();
        assert!(!replay.applied);
        assert_eq!(replay.transaction.id, report.transaction.id);
        assert_eq!(h.ledger.len().await, 2);
        assert_eq!(h.publisher.events_of(EventType::LedgerAdjusted).await.len(), 1);

        let audit = h.reconciler.audit_wallet(wallet_id).await.unwrap();
        assert_eq!(audit.balance, 0);
        assert!(audit.is_consistent());
    }

    #[tokio::test]
    async fn test_refund_of_unknown_intent_is_not_found() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;

        let result = h
            .reconciler
            .reconcile_event(&refund(wallet_id, "pi_missing", "corr-refund"))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(h.reconciler.audit_wallet(wallet_id).await.unwrap().balance, 0);
        assert!(h.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_refund_of_pending_intent_is_rejected() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;

        let result = h
            .reconciler
            .reconcile_event(&refund(wallet_id, "pi_1", "corr-refund"))
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_repair_keeps_correction_a_reversal() {
        let h = harness();
        let wallet_id = wallet_with_pending(&h, "pi_1", 500).await;
        h.reconciler
            .handle_webhook(&succeeded("pi_1"), &OperationContext::new())
            .await
            .unwrap();

        let chargeback = EconomicEvent::new(
            EventType::Chargeback,
            "invoice-1",
            "corr-cb",
            json!({ "wallet_id": wallet_id, "payment_intent_id": "pi_1", "amount_delta": -500 }),
        )
        .unwrap();
        h.ledger.fail_next(3);
        let report = h.reconciler.reconcile_event(&chargeback).await.unwrap();
        assert!(report.applied);
        assert!(!report.ledger_recorded);

        assert_eq!(h.reconciler.repair_wallet(wallet_id).await.unwrap(), 1);
        let entries = h.ledger.entries_by_transaction(report.transaction.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, EntryDirection::Reversal);
        assert_eq!(entries[0].reverses, report.transaction.reverses);

        // A later replay finds the repaired entry under the same key
        let replay = h.reconciler.reconcile_event(&chargeback).await.unwrap();
        assert!(replay.ledger_recorded);
        assert_eq!(h.ledger.entries_by_transaction(report.transaction.id).await.unwrap().len(), 1);
        assert!(h.reconciler.audit_wallet(wallet_id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_spend_authorized_then_executed() {
        let h = harness();
        let wallet = h
            .wallets
            .create_wallet("owner", None, &CurrencyCode::new("USD").unwrap())
            .await
            .unwrap();

        let authorized = EconomicEvent::new(
            EventType::SpendAuthorized,
            "alloc-1",
            "corr-spend",
            json!({ "wallet_id": wallet.id, "payment_intent_id": "sp_1", "amount_delta": -120 }),
        )
        .unwrap();
        h.reconciler.handle(&authorized).await.unwrap();
        // Redelivery is harmless
        h.reconciler.handle(&authorized).await.unwrap();

        let executed = authorized.follow_on(EventType::SpendExecuted, "alloc-1").unwrap();
        h.reconciler.handle(&executed).await.unwrap();

        let audit = h.reconciler.audit_wallet(wallet.id).await.unwrap();
        assert_eq!(audit.balance, -120);
        assert_eq!(audit.pending, 0);
        assert!(audit.is_consistent());
    }

    #[tokio::test]
    async fn test_handler_rejects_unknown_transaction() {
        let h = harness();
        let executed = EconomicEvent::new(
            EventType::SpendExecuted,
            "alloc-1",
            "corr-x",
            json!({ "payment_intent_id": "sp_missing" }),
        )
        .unwrap();
        let result = h.reconciler.handle(&executed).await;
        assert!(matches!(result, Err(HandlerError::Rejected(_))));
    }
}
