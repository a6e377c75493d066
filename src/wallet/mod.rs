//! Wallet module
//!
//! Per-owner balances and their transaction log. The balance is a projection:
//! it always equals the sum of the deltas of succeeded transactions. The only
//! write paths are the conditional updates on [`WalletStore`].

mod memory;
mod postgres;
mod service;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{AmountDelta, CurrencyCode};

pub use memory::MemoryWalletStore;
pub use postgres::PgWalletStore;
pub use service::WalletService;
pub use store::{WalletError, WalletStore};

/// Transaction status. Moves only pending → succeeded | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "succeeded" => Ok(TransactionStatus::Succeeded),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(WalletError::Validation(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// What a transaction records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    #[default]
    Payment,
    /// Refund or chargeback; settles into a reversal ledger entry
    Correction,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Payment => "payment",
            TransactionKind::Correction => "correction",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment" => Ok(TransactionKind::Payment),
            "correction" => Ok(TransactionKind::Correction),
            other => Err(WalletError::Validation(format!(
                "unknown transaction kind: {}",
                other
            ))),
        }
    }
}

/// One entry in a wallet's transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    /// Idempotency key, unique within the wallet
    pub payment_intent_id: String,
    pub amount_delta: AmountDelta,
    pub status: TransactionStatus,
    #[serde(default)]
    pub kind: TransactionKind,
    /// Transaction a correction reverses, when it names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// A new pending transaction, ready for `append_transaction`.
    pub fn pending(payment_intent_id: impl Into<String>, amount_delta: AmountDelta) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payment_intent_id: payment_intent_id.into(),
            amount_delta,
            status: TransactionStatus::Pending,
            kind: TransactionKind::Payment,
            reverses: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A pending correction, optionally reversing an earlier transaction.
    pub fn correction(
        payment_intent_id: impl Into<String>,
        amount_delta: AmountDelta,
        reverses: Option<Uuid>,
    ) -> Self {
        Self {
            kind: TransactionKind::Correction,
            reverses,
            ..Self::pending(payment_intent_id, amount_delta)
        }
    }

    pub fn is_correction(&self) -> bool {
        self.kind == TransactionKind::Correction
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub owner_user_id: String,
    pub app_id: Option<String>,
    /// Minor units
    pub balance: i64,
    pub currency: CurrencyCode,
    /// Append order, oldest first
    pub transactions: Vec<WalletTransaction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(owner_user_id: String, app_id: Option<String>, currency: CurrencyCode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            app_id,
            balance: 0,
            currency,
            transactions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transaction(&self, payment_intent_id: &str) -> Option<&WalletTransaction> {
        self.transactions
            .iter()
            .find(|tx| tx.payment_intent_id == payment_intent_id)
    }

    pub fn pending_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .count()
    }

    /// Sum of succeeded deltas; equals `balance` for a consistent wallet.
    pub fn succeeded_total(&self) -> i64 {
        self.transactions
            .iter()
            .filter(|tx| tx.status == TransactionStatus::Succeeded)
            .map(|tx| tx.amount_delta.value())
            .sum()
    }
}

/// How to find a wallet.
///
/// `ByOwner` resolves the owner's wallet that is not bound to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletLookup {
    ById(Uuid),
    ByOwner(String),
    ByOwnerAndApp { owner_user_id: String, app_id: String },
}

/// Result of a reconciliation attempt that found its transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// This call moved the transaction out of pending
    Applied(WalletTransaction),
    /// The transaction was already terminal; nothing changed
    AlreadyTerminal(WalletTransaction),
}

impl ReconciliationOutcome {
    pub fn transaction(&self) -> &WalletTransaction {
        match self {
            ReconciliationOutcome::Applied(tx) | ReconciliationOutcome::AlreadyTerminal(tx) => tx,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, ReconciliationOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    MarkedFailed(WalletTransaction),
    AlreadyTerminal(WalletTransaction),
}

const DEFAULT_PAGE_LIMIT: usize = 50;
const MAX_PAGE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

impl PageRequest {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset,
        }
    }

    pub fn clamped(self) -> Self {
        Self::new(self.limit, self.offset)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPage {
    pub items: Vec<WalletTransaction>,
    pub total: usize,
    pub next_offset: Option<usize>,
}

impl HistoryPage {
    pub(crate) fn new(items: Vec<WalletTransaction>, total: usize, page: PageRequest) -> Self {
        let end = page.offset + items.len();
        Self {
            items,
            total,
            next_offset: (end < total).then_some(end),
        }
    }
}
