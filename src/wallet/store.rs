//! Wallet store boundary
//!
//! Implementations must provide an atomic conditional update on transaction
//! status: two concurrent reconciliations of the same intent resolve to one
//! `Applied` and one `AlreadyTerminal`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{AmountDelta, AmountError, CurrencyCode};

use super::{
    FailureOutcome, HistoryPage, PageRequest, ReconciliationOutcome, TransactionStatus, Wallet,
    WalletLookup, WalletTransaction,
};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Invalid wallet operation: {0}")]
    Validation(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(Uuid),

    #[error("Transaction not found in wallet {wallet_id}: {payment_intent_id}")]
    TransactionNotFound {
        wallet_id: Uuid,
        payment_intent_id: String,
    },

    #[error("No transaction for payment intent: {0}")]
    IntentNotFound(String),

    #[error("Wallet already exists for owner {owner_user_id} (app {app_id:?})")]
    DuplicateWallet {
        owner_user_id: String,
        app_id: Option<String>,
    },

    #[error("Transaction {payment_intent_id} already exists in wallet {wallet_id}")]
    DuplicateTransaction {
        wallet_id: Uuid,
        payment_intent_id: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Wallet store unavailable: {0}")]
    Unavailable(String),
}

impl WalletError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Database(_) | WalletError::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WalletError::WalletNotFound(_)
                | WalletError::TransactionNotFound { .. }
                | WalletError::IntentNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            WalletError::DuplicateWallet { .. } | WalletError::DuplicateTransaction { .. }
        )
    }
}

impl From<AmountError> for WalletError {
    fn from(e: AmountError) -> Self {
        WalletError::Validation(e.to_string())
    }
}

/// Persistence boundary for wallets.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Fails with `Validation` on an empty owner and `DuplicateWallet` when the
    /// (owner, app) pair already has a wallet.
    async fn create_wallet(
        &self,
        owner_user_id: &str,
        app_id: Option<&str>,
        currency: &CurrencyCode,
    ) -> Result<Wallet, WalletError>;

    async fn get_wallet(&self, lookup: WalletLookup) -> Result<Option<Wallet>, WalletError>;

    /// Append a pending transaction. Never touches the balance.
    async fn append_transaction(
        &self,
        wallet_id: Uuid,
        transaction: WalletTransaction,
    ) -> Result<WalletTransaction, WalletError>;

    /// Move the transaction keyed by `payment_intent_id` to `new_status`,
    /// crediting `amount_delta` only when it succeeds. A terminal transaction
    /// is returned unchanged.
    async fn apply_reconciliation(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
        amount_delta: AmountDelta,
        new_status: TransactionStatus,
    ) -> Result<ReconciliationOutcome, WalletError>;

    /// Fail the transaction keyed by `payment_intent_id`. Never touches the balance.
    async fn mark_failed(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<FailureOutcome, WalletError>;

    /// Transactions newest first.
    async fn get_history(
        &self,
        wallet_id: Uuid,
        page: PageRequest,
    ) -> Result<HistoryPage, WalletError>;

    /// Locate a transaction by intent across all wallets.
    async fn find_transaction(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<(Uuid, WalletTransaction)>, WalletError>;

    async fn list_wallet_ids(&self) -> Result<Vec<Uuid>, WalletError>;
}

pub(crate) fn validate_owner(owner_user_id: &str, app_id: Option<&str>) -> Result<(), WalletError> {
    if owner_user_id.trim().is_empty() {
        return Err(WalletError::Validation("owner_user_id is empty".into()));
    }
    if matches!(app_id, Some(app) if app.trim().is_empty()) {
        return Err(WalletError::Validation("app_id is empty".into()));
    }
    Ok(())
}

pub(crate) fn validate_target_status(status: TransactionStatus) -> Result<(), WalletError> {
    if !status.is_terminal() {
        return Err(WalletError::Validation(
            "reconciliation target status must be terminal".into(),
        ));
    }
    Ok(())
}
