//! Ledger module
//!
//! Append-only record of monetary movements. Entries are keyed by
//! (transaction_id, direction); recording the same key twice is a no-op and
//! no code path updates or deletes an entry.

mod memory;
mod postgres;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::wallet::WalletTransaction;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::{LedgerError, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryDirection {
    Credit,
    Debit,
    /// Correction of earlier value (refund, chargeback)
    Reversal,
}

impl EntryDirection {
    /// Direction for a settled, non-correcting movement of `amount`.
    pub fn for_amount(amount: i64) -> Self {
        if amount >= 0 {
            EntryDirection::Credit
        } else {
            EntryDirection::Debit
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryDirection::Credit => "credit",
            EntryDirection::Debit => "debit",
            EntryDirection::Reversal => "reversal",
        }
    }
}

impl fmt::Display for EntryDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryDirection {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(EntryDirection::Credit),
            "debit" => Ok(EntryDirection::Debit),
            "reversal" => Ok(EntryDirection::Reversal),
            other => Err(LedgerError::Validation(format!(
                "unknown entry direction: {}",
                other
            ))),
        }
    }
}

/// Immutable ledger record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub wallet_id: Uuid,
    pub direction: EntryDirection,
    /// Signed minor units, equal to the balance effect
    pub amount: i64,
    /// For reversals: the transaction whose value is being corrected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(transaction_id: Uuid, wallet_id: Uuid, direction: EntryDirection, amount: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            wallet_id,
            direction,
            amount,
            reverses: None,
            created_at: Utc::now(),
        }
    }

    /// Entry for a transaction that reached `succeeded`. Corrections become
    /// reversals pointing at the transaction they correct.
    pub fn for_settled(wallet_id: Uuid, transaction: &WalletTransaction) -> Self {
        let amount = transaction.amount_delta.value();
        if transaction.is_correction() {
            let mut entry = Self::new(transaction.id, wallet_id, EntryDirection::Reversal, amount);
            entry.reverses = transaction.reverses;
            entry
        } else {
            Self::new(transaction.id, wallet_id, EntryDirection::for_amount(amount), amount)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(LedgerEntry),
    /// An entry with the same (transaction_id, direction) already exists
    AlreadyRecorded(LedgerEntry),
}

impl RecordOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            RecordOutcome::Inserted(e) | RecordOutcome::AlreadyRecorded(e) => e,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, RecordOutcome::Inserted(_))
    }
}
