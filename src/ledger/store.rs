use async_trait::async_trait;
use uuid::Uuid;

use super::{LedgerEntry, RecordOutcome};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid ledger entry: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger store unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Database(_) | LedgerError::Unavailable(_))
    }
}

/// Append-only ledger persistence. No update or delete.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert unless an entry with the same (transaction_id, direction) exists.
    async fn record_entry(&self, entry: LedgerEntry) -> Result<RecordOutcome, LedgerError>;

    async fn entries_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Oldest first.
    async fn entries_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn wallet_total(&self, wallet_id: Uuid) -> Result<i64, LedgerError>;
}

pub(crate) fn validate_entry(entry: &LedgerEntry) -> Result<(), LedgerError> {
    if entry.amount == 0 {
        return Err(LedgerError::Validation("amount must not be zero".into()));
    }
    Ok(())
}
