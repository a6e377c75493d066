use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::{validate_entry, LedgerError, LedgerStore};
use super::{EntryDirection, LedgerEntry, RecordOutcome};

#[derive(Debug, Default)]
struct Entries {
    ordered: Vec<LedgerEntry>,
    by_key: HashMap<(Uuid, EntryDirection), usize>,
}

/// In-process ledger. Entries live in an append-only vector.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: RwLock<Entries>,
    unavailable_for: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` calls to `record_entry` fail with `Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.unavailable_for.store(calls, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.ordered.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn record_entry(&self, entry: LedgerEntry) -> Result<RecordOutcome, LedgerError> {
        validate_entry(&entry)?;
        if self
            .unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Unavailable("injected failure".into()));
        }

        let mut entries = self.entries.write().await;
        let key = (entry.transaction_id, entry.direction);
        if let Some(&idx) = entries.by_key.get(&key) {
            return Ok(RecordOutcome::AlreadyRecorded(entries.ordered[idx].clone()));
        }

        let idx = entries.ordered.len();
        entries.ordered.push(entry.clone());
        entries.by_key.insert(key, idx);
        Ok(RecordOutcome::Inserted(entry))
    }

    async fn entries_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.read().await;
        Ok(entries
            .ordered
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn entries_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.read().await;
        Ok(entries
            .ordered
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .cloned()
            .collect())
    }

    async fn wallet_total(&self, wallet_id: Uuid) -> Result<i64, LedgerError> {
        let entries = self.entries.read().await;
        entries
            .ordered
            .iter()
            .filter(|e| e.wallet_id == wallet_id)
            .try_fold(0i64, |total, e| total.checked_add(e.amount))
            .ok_or_else(|| {
                LedgerError::Validation(format!("ledger total of wallet {} overflowed", wallet_id))
            })
    }
}
