//! In-process wallet store.
//!
//! Every mutation runs under the map's write lock, which makes the
//! check-and-set on transaction status atomic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{AmountDelta, CurrencyCode};

use super::store::{validate_owner, validate_target_status, WalletError, WalletStore};
use super::{
    FailureOutcome, HistoryPage, PageRequest, ReconciliationOutcome, TransactionStatus, Wallet,
    WalletLookup, WalletTransaction,
};

#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    wallets: RwLock<HashMap<Uuid, Wallet>>,
    unavailable_for: AtomicU32,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` mutating calls fail with `Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.unavailable_for.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), WalletError> {
        let remaining = self
            .unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(WalletError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

fn transaction_mut<'a>(
    wallet: &'a mut Wallet,
    payment_intent_id: &str,
) -> Result<&'a mut WalletTransaction, WalletError> {
    let wallet_id = wallet.id;
    wallet
        .transactions
        .iter_mut()
        .find(|tx| tx.payment_intent_id == payment_intent_id)
        .ok_or_else(|| WalletError::TransactionNotFound {
            wallet_id,
            payment_intent_id: payment_intent_id.to_string(),
        })
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn create_wallet(
        &self,
        owner_user_id: &str,
        app_id: Option<&str>,
        currency: &CurrencyCode,
    ) -> Result<Wallet, WalletError> {
        validate_owner(owner_user_id, app_id)?;
        self.check_available()?;

        let mut wallets = self.wallets.write().await;
        let exists = wallets
            .values()
            .any(|w| w.owner_user_id == owner_user_id && w.app_id.as_deref() == app_id);
        if exists {
            return Err(WalletError::DuplicateWallet {
                owner_user_id: owner_user_id.to_string(),
                app_id: app_id.map(str::to_string),
            });
        }

        let wallet = Wallet::new(
            owner_user_id.to_string(),
            app_id.map(str::to_string),
            currency.clone(),
        );
        wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn get_wallet(&self, lookup: WalletLookup) -> Result<Option<Wallet>, WalletError> {
        let wallets = self.wallets.read().await;
        let found = match lookup {
            WalletLookup::ById(id) => wallets.get(&id),
            WalletLookup::ByOwner(owner) => wallets
                .values()
                .find(|w| w.owner_user_id == owner && w.app_id.is_none()),
            WalletLookup::ByOwnerAndApp {
                owner_user_id,
                app_id,
            } => wallets.values().find(|w| {
                w.owner_user_id == owner_user_id && w.app_id.as_deref() == Some(app_id.as_str())
            }),
        };
        Ok(found.cloned())
    }

    async fn append_transaction(
        &self,
        wallet_id: Uuid,
        transaction: WalletTransaction,
    ) -> Result<WalletTransaction, WalletError> {
        if transaction.status != TransactionStatus::Pending {
            return Err(WalletError::Validation(
                "appended transactions must be pending".into(),
            ));
        }
        self.check_available()?;

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(&wallet_id)
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        if wallet.transaction(&transaction.payment_intent_id).is_some() {
            return Err(WalletError::DuplicateTransaction {
                wallet_id,
                payment_intent_id: transaction.payment_intent_id,
            });
        }

        wallet.transactions.push(transaction.clone());
        wallet.updated_at = Utc::now();
        Ok(transaction)
    }

    async fn apply_reconciliation(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
        amount_delta: AmountDelta,
        new_status: TransactionStatus,
    ) -> Result<ReconciliationOutcome, WalletError> {
        validate_target_status(new_status)?;
        self.check_available()?;

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(&wallet_id)
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        let balance = wallet.balance;
        let tx = transaction_mut(wallet, payment_intent_id)?;
        if tx.status.is_terminal() {
            return Ok(ReconciliationOutcome::AlreadyTerminal(tx.clone()));
        }

        let new_balance = match new_status {
            TransactionStatus::Succeeded => amount_delta.apply_to(balance)?,
            _ => balance,
        };

        let now = Utc::now();
        tx.amount_delta = amount_delta;
        tx.status = new_status;
        tx.updated_at = now;
        let applied = tx.clone();

        wallet.balance = new_balance;
        wallet.updated_at = now;
        Ok(ReconciliationOutcome::Applied(applied))
    }

    async fn mark_failed(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<FailureOutcome, WalletError> {
        self.check_available()?;

        let mut wallets = self.wallets.write().await;
        let wallet = wallets
            .get_mut(&wallet_id)
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        let tx = transaction_mut(wallet, payment_intent_id)?;
        if tx.status.is_terminal() {
            return Ok(FailureOutcome::AlreadyTerminal(tx.clone()));
        }

        let now = Utc::now();
        tx.status = TransactionStatus::Failed;
        tx.updated_at = now;
        let failed = tx.clone();
        wallet.updated_at = now;
        Ok(FailureOutcome::MarkedFailed(failed))
    }

    async fn get_history(
        &self,
        wallet_id: Uuid,
        page: PageRequest,
    ) -> Result<HistoryPage, WalletError> {
        let page = page.clamped();
        let wallets = self.wallets.read().await;
        let wallet = wallets
            .get(&wallet_id)
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        let items: Vec<WalletTransaction> = wallet
            .transactions
            .iter()
            .rev()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(HistoryPage::new(items, wallet.transactions.len(), page))
    }

    async fn find_transaction(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<(Uuid, WalletTransaction)>, WalletError> {
        let wallets = self.wallets.read().await;
        let mut matches = wallets
            .values()
            .filter_map(|w| w.transaction(payment_intent_id).map(|tx| (w.id, tx.clone())));

        let first = matches.next();
        if first.is_some() && matches.next().is_some() {
            return Err(WalletError::Validation(format!(
                "payment intent {} is present in more than one wallet",
                payment_intent_id
            )));
        }
        Ok(first)
    }

    async fn list_wallet_ids(&self) -> Result<Vec<Uuid>, WalletError> {
        Ok(self.wallets.read().await.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn usd() -> CurrencyCode {
        CurrencyCode::new("USD").unwrap()
    }

    fn delta(v: i64) -> AmountDelta {
        AmountDelta::new(v).unwrap()
    }

    async fn wallet_with_pending(store: &MemoryWalletStore, intent: &str, amount: i64) -> Uuid {
        let wallet = store.create_wallet("owner-1", None, &usd()).await.unwrap();
        store
            .append_transaction(wallet.id, WalletTransaction::pending(intent, delta(amount)))
            .await
            .unwrap();
        wallet.id
    }

    #[tokio::test]
    async fn test_create_wallet_validation_and_conflict() {
        let store = MemoryWalletStore::new();
        assert!(matches!(
            store.create_wallet("", None, &usd()).await,
            Err(WalletError::Validation(_))
        ));

        store.create_wallet("u1", Some("app-1"), &usd()).await.unwrap();
        assert!(matches!(
            store.create_wallet("u1", Some("app-1"), &usd()).await,
            Err(WalletError::DuplicateWallet { .. })
        ));
        // A different app is a different wallet
        store.create_wallet("u1", None, &usd()).await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_variants() {
        let store = MemoryWalletStore::new();
        let personal = store.create_wallet("u1", None, &usd()).await.unwrap();
        let app = store.create_wallet("u1", Some("app-1"), &usd()).await.unwrap();

        let by_owner = store
            .get_wallet(WalletLookup::ByOwner("u1".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_owner.id, personal.id);

        let by_app = store
            .get_wallet(WalletLookup::ByOwnerAndApp {
                owner_user_id: "u1".into(),
                app_id: "app-1".into(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_app.id, app.id);

        assert!(store
            .get_wallet(WalletLookup::ById(Uuid::new_v4()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_append_does_not_change_balance() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_1", 500).await;
        let wallet = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 0);
        assert_eq!(wallet.transactions.len(), 1);

        let duplicate = store
            .append_transaction(wallet_id, WalletTransaction::pending("pi_1", delta(1)))
            .await;
        assert!(matches!(duplicate, Err(WalletError::DuplicateTransaction { .. })));
    }

    #[tokio::test]
    async fn test_append_rejects_terminal_transaction() {
        let store = MemoryWalletStore::new();
        let wallet = store.create_wallet("u1", None, &usd()).await.unwrap();
        let mut tx = WalletTransaction::pending("pi_1", delta(5));
        tx.status = TransactionStatus::Succeeded;
        assert!(matches!(
            store.append_transaction(wallet.id, tx).await,
            Err(WalletError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_reconciliation_is_idempotent() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_1", 500).await;

        let first = store
            .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Succeeded)
            .await
            .unwrap();
        let second = store
            .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Succeeded)
            .await
            .unwrap();

        assert!(first.was_applied());
        assert!(!second.was_applied());
        let wallet = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 500);
    }

    #[tokio::test]
    async fn test_concurrent_reconciliations_apply_once() {
        let store = Arc::new(MemoryWalletStore::new());
        let wallet_id = wallet_with_pending(&store, "pi_1", 500).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Succeeded)
                    .await
                    .unwrap()
            }));
        }

        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().was_applied() {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        let wallet = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 500);
    }

    #[tokio::test]
    async fn test_failed_status_never_moves_balance() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_1", 500).await;

        store
            .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Failed)
            .await
            .unwrap();
        // Terminal states never revert
        let replay = store
            .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Succeeded)
            .await
            .unwrap();

        assert_eq!(replay.transaction().status, TransactionStatus::Failed);
        let wallet = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 0);
    }

    #[tokio::test]
    async fn test_pending_target_rejected() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_1", 500).await;
        let result = store
            .apply_reconciliation(wallet_id, "pi_1", delta(500), TransactionStatus::Pending)
            .await;
        assert!(matches!(result, Err(WalletError::Validation(_))));
    }

    #[tokio::test]
    async fn test_mark_failed_targets_matching_transaction() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_old", 100).await;
        store
            .append_transaction(wallet_id, WalletTransaction::pending("pi_new", delta(200)))
            .await
            .unwrap();

        let outcome = store.mark_failed(wallet_id, "pi_old").await.unwrap();
        assert!(matches!(outcome, FailureOutcome::MarkedFailed(_)));

        let wallet = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap().unwrap();
        assert_eq!(wallet.transaction("pi_old").unwrap().status, TransactionStatus::Failed);
        assert_eq!(wallet.transaction("pi_new").unwrap().status, TransactionStatus::Pending);
        assert_eq!(wallet.balance, 0);
    }

    #[tokio::test]
    async fn test_mark_failed_unknown_intent() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_1", 100).await;
        let before = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap();

        let result = store.mark_failed(wallet_id, "pi_unknown").await;
        assert!(matches!(result, Err(WalletError::TransactionNotFound { .. })));

        let after = store.get_wallet(WalletLookup::ById(wallet_id)).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_history_newest_first_with_pages() {
        let store = MemoryWalletStore::new();
        let wallet = store.create_wallet("u1", None, &usd()).await.unwrap();
        for i in 1..=5 {
            store
                .append_transaction(wallet.id, WalletTransaction::pending(format!("pi_{}", i), delta(i)))
                .await
                .unwrap();
        }

        let first = store.get_history(wallet.id, PageRequest::new(2, 0)).await.unwrap();
        let intents: Vec<_> = first.items.iter().map(|t| t.payment_intent_id.as_str()).collect();
        assert_eq!(intents, vec!["pi_5", "pi_4"]);
        assert_eq!(first.total, 5);
        assert_eq!(first.next_offset, Some(2));

        let last = store.get_history(wallet.id, PageRequest::new(2, 4)).await.unwrap();
        assert_eq!(last.items[0].payment_intent_id, "pi_1");
        assert_eq!(last.next_offset, None);
    }

    #[tokio::test]
    async fn test_find_transaction_across_wallets() {
        let store = MemoryWalletStore::new();
        let wallet_id = wallet_with_pending(&store, "pi_x", 10).await;
        let (found_wallet, tx) = store.find_transaction("pi_x").await.unwrap().unwrap();
        assert_eq!(found_wallet, wallet_id);
        assert_eq!(tx.payment_intent_id, "pi_x");
        assert!(store.find_transaction("pi_none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryWalletStore::new();
        store.fail_next(1);
        assert!(matches!(
            store.create_wallet("u1", None, &usd()).await,
            Err(WalletError::Unavailable(_))
        ));
        assert!(store.create_wallet("u1", None, &usd()).await.is_ok());
    }
}
