//! PostgreSQL ledger store
//!
//! The table carries a trigger that rejects UPDATE and DELETE, so immutability
//! holds even for writers outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::store::{validate_entry, LedgerError, LedgerStore};
use super::{LedgerEntry, RecordOutcome};

type EntryRow = (Uuid, Uuid, Uuid, String, i64, Option<Uuid>, DateTime<Utc>);

const ENTRY_COLUMNS: &str =
    "id, transaction_id, wallet_id, direction, amount, reverses_transaction_id, created_at";

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: EntryRow) -> Result<LedgerEntry, LedgerError> {
    let (id, transaction_id, wallet_id, direction, amount, reverses, created_at) = row;
    Ok(LedgerEntry {
        id,
        transaction_id,
        wallet_id,
        direction: direction.parse()?,
        amount,
        reverses,
        created_at,
    })
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn record_entry(&self, entry: LedgerEntry) -> Result<RecordOutcome, LedgerError> {
        validate_entry(&entry)?;

        let inserted: Option<EntryRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO ledger_entries
                (id, transaction_id, wallet_id, direction, amount, reverses_transaction_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (transaction_id, direction) DO NOTHING
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        ))
        .bind(entry.id)
        .bind(entry.transaction_id)
        .bind(entry.wallet_id)
        .bind(entry.direction.as_str())
        .bind(entry.amount)
        .bind(entry.reverses)
        .bind(entry.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return entry_from_row(row).map(RecordOutcome::Inserted);
        }

        let existing: EntryRow = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE transaction_id = $1 AND direction = $2",
            ENTRY_COLUMNS
        ))
        .bind(entry.transaction_id)
        .bind(entry.direction.as_str())
        .fetch_one(&self.pool)
        .await?;

        entry_from_row(existing).map(RecordOutcome::AlreadyRecorded)
    }

    async fn entries_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE transaction_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn entries_by_wallet(&self, wallet_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_entries WHERE wallet_id = $1 ORDER BY created_at, id",
            ENTRY_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn wallet_total(&self, wallet_id: Uuid) -> Result<i64, LedgerError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM ledger_entries WHERE wallet_id = $1",
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }
}
