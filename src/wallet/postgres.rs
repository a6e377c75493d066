//! PostgreSQL wallet store
//!
//! The status check-and-set is a conditional `UPDATE ... WHERE status = 'pending'`
//! executed in the same transaction as the balance increment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{AmountDelta, CurrencyCode};

use super::store::{validate_owner, validate_target_status, WalletError, WalletStore};
use super::{
    FailureOutcome, HistoryPage, PageRequest, ReconciliationOutcome, TransactionStatus, Wallet,
    WalletLookup, WalletTransaction,
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const NUMERIC_OUT_OF_RANGE: &str = "22003";

type WalletRow = (
    Uuid,
    String,
    Option<String>,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

type TransactionRow = (
    Uuid,
    String,
    i64,
    String,
    String,
    Option<Uuid>,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// Transaction row prefixed with its wallet id
type FoundRow = (
    Uuid,
    Uuid,
    String,
    i64,
    String,
    String,
    Option<Uuid>,
    DateTime<Utc>,
    DateTime<Utc>,
);

const TRANSACTION_COLUMNS: &str =
    "id, payment_intent_id, amount_delta, status, kind, reverses_transaction_id, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_transactions(&self, wallet_id: Uuid) -> Result<Vec<WalletTransaction>, WalletError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM wallet_transactions WHERE wallet_id = $1 ORDER BY seq ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transaction_from_row).collect()
    }

    async fn wallet_exists(&self, wallet_id: Uuid) -> Result<bool, WalletError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM wallets WHERE id = $1)")
            .bind(wallet_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Run the conditional status update. `None` means the row was not pending.
    async fn transition_pending(
        tx: &mut Transaction<'_, Postgres>,
        wallet_id: Uuid,
        payment_intent_id: &str,
        new_status: TransactionStatus,
        amount_delta: Option<AmountDelta>,
    ) -> Result<Option<WalletTransaction>, WalletError> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE wallet_transactions
            SET status = $3,
                amount_delta = COALESCE($4, amount_delta),
                updated_at = NOW()
            WHERE wallet_id = $1 AND payment_intent_id = $2 AND status = 'pending'
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .bind(payment_intent_id)
        .bind(new_status.as_str())
        .bind(amount_delta.map(|d| d.value()))
        .fetch_optional(&mut **tx)
        .await?;

        row.map(transaction_from_row).transpose()
    }

    /// After a conditional update matched nothing: report why.
    async fn explain_miss(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<WalletTransaction, WalletError> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM wallet_transactions WHERE wallet_id = $1 AND payment_intent_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let existing = transaction_from_row(row)?;
                if existing.status.is_terminal() {
                    Ok(existing)
                } else {
                    // Concurrent writer rolled back between our update and this read
                    Err(WalletError::Unavailable(format!(
                        "transaction {} changed concurrently",
                        payment_intent_id
                    )))
                }
            }
            None if self.wallet_exists(wallet_id).await? => Err(WalletError::TransactionNotFound {
                wallet_id,
                payment_intent_id: payment_intent_id.to_string(),
            }),
            None => Err(WalletError::WalletNotFound(wallet_id)),
        }
    }
}

fn transaction_from_row(row: TransactionRow) -> Result<WalletTransaction, WalletError> {
    let (id, payment_intent_id, amount_delta, status, kind, reverses, created_at, updated_at) = row;
    Ok(WalletTransaction {
        id,
        payment_intent_id,
        amount_delta: AmountDelta::new(amount_delta)?,
        status: status.parse()?,
        kind: kind.parse()?,
        reverses,
        created_at,
        updated_at,
    })
}

fn wallet_from_row(row: WalletRow, transactions: Vec<WalletTransaction>) -> Result<Wallet, WalletError> {
    let (id, owner_user_id, app_id, balance, currency, created_at, updated_at) = row;
    Ok(Wallet {
        id,
        owner_user_id,
        app_id,
        balance,
        currency: CurrencyCode::new(&currency)?,
        transactions,
        created_at,
        updated_at,
    })
}

fn db_code(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

#[async_trait]
impl WalletStore for PgWalletStore {
    async fn create_wallet(
        &self,
        owner_user_id: &str,
        app_id: Option<&str>,
        currency: &CurrencyCode,
    ) -> Result<Wallet, WalletError> {
        validate_owner(owner_user_id, app_id)?;

        let result: Result<WalletRow, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO wallets (id, owner_user_id, app_id, balance, currency)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING id, owner_user_id, app_id, balance, currency, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner_user_id)
        .bind(app_id)
        .bind(currency.as_str())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => wallet_from_row(row, Vec::new()),
            Err(e) if db_code(&e).as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(WalletError::DuplicateWallet {
                    owner_user_id: owner_user_id.to_string(),
                    app_id: app_id.map(str::to_string),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_wallet(&self, lookup: WalletLookup) -> Result<Option<Wallet>, WalletError> {
        const COLUMNS: &str = "id, owner_user_id, app_id, balance, currency, created_at, updated_at";

        let row: Option<WalletRow> = match lookup {
            WalletLookup::ById(id) => {
                sqlx::query_as(&format!("SELECT {} FROM wallets WHERE id = $1", COLUMNS))
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            WalletLookup::ByOwner(owner) => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM wallets WHERE owner_user_id = $1 AND app_id IS NULL",
                    COLUMNS
                ))
                .bind(owner)
                .fetch_optional(&self.pool)
                .await?
            }
            WalletLookup::ByOwnerAndApp {
                owner_user_id,
                app_id,
            } => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM wallets WHERE owner_user_id = $1 AND app_id = $2",
                    COLUMNS
                ))
                .bind(owner_user_id)
                .bind(app_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => {
                let transactions = self.load_transactions(row.0).await?;
                wallet_from_row(row, transactions).map(Some)
            }
            None => Ok(None),
        }
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

        let mut tx = self.pool.begin().await?;

        let inserted: Result<TransactionRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO wallet_transactions
                (id, wallet_id, payment_intent_id, amount_delta, status, kind,
                 reverses_transaction_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $7)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction.id)
        .bind(wallet_id)
        .bind(&transaction.payment_intent_id)
        .bind(transaction.amount_delta.value())
        .bind(transaction.kind.as_str())
        .bind(transaction.reverses)
        .bind(transaction.created_at)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(e) => {
                return Err(match db_code(&e).as_deref() {
                    Some(UNIQUE_VIOLATION) => WalletError::DuplicateTransaction {
                        wallet_id,
                        payment_intent_id: transaction.payment_intent_id,
                    },
                    Some(FOREIGN_KEY_VIOLATION) => WalletError::WalletNotFound(wallet_id),
                    _ => e.into(),
                });
            }
        };

        sqlx::query("UPDATE wallets SET updated_at = NOW() WHERE id = $1")
            .bind(wallet_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        transaction_from_row(row)
    }

    async fn apply_reconciliation(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
        amount_delta: AmountDelta,
        new_status: TransactionStatus,
    ) -> Result<ReconciliationOutcome, WalletError> {
        validate_target_status(new_status)?;

        let mut tx = self.pool.begin().await?;

        let Some(applied) = Self::transition_pending(
            &mut tx,
            wallet_id,
            payment_intent_id,
            new_status,
            Some(amount_delta),
        )
        .await?
        else {
            tx.rollback().await?;
            let existing = self.explain_miss(wallet_id, payment_intent_id).await?;
            return Ok(ReconciliationOutcome::AlreadyTerminal(existing));
        };

        let credit = match new_status {
            TransactionStatus::Succeeded => amount_delta.value(),
            _ => 0,
        };
        let updated = sqlx::query(
            "UPDATE wallets SET balance = balance + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(wallet_id)
        .bind(credit)
        .execute(&mut *tx)
        .await;

        if let Err(e) = updated {
            return Err(match db_code(&e).as_deref() {
                Some(NUMERIC_OUT_OF_RANGE) => {
                    WalletError::Validation("balance arithmetic overflowed".into())
                }
                _ => e.into(),
            });
        }

        tx.commit().await?;
        Ok(ReconciliationOutcome::Applied(applied))
    }

    async fn mark_failed(
        &self,
        wallet_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<FailureOutcome, WalletError> {
        let mut tx = self.pool.begin().await?;

        let Some(failed) = Self::transition_pending(
            &mut tx,
            wallet_id,
            payment_intent_id,
            TransactionStatus::Failed,
            None,
        )
        .await?
        else {
            tx.rollback().await?;
            let existing = self.explain_miss(wallet_id, payment_intent_id).await?;
            return Ok(FailureOutcome::AlreadyTerminal(existing));
        };

        sqlx::query("UPDATE wallets SET updated_at = NOW() WHERE id = $1")
            .bind(wallet_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(FailureOutcome::MarkedFailed(failed))
    }

    async fn get_history(
        &self,
        wallet_id: Uuid,
        page: PageRequest,
    ) -> Result<HistoryPage, WalletError> {
        let page = page.clamped();
        if !self.wallet_exists(wallet_id).await? {
            return Err(WalletError::WalletNotFound(wallet_id));
        }

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM wallet_transactions WHERE wallet_id = $1")
                .bind(wallet_id)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM wallet_transactions
            WHERE wallet_id = $1
            ORDER BY seq DESC
            LIMIT $2 OFFSET $3
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let items = rows
            .into_iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage::new(items, total.max(0) as usize, page))
    }

    async fn find_transaction(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<(Uuid, WalletTransaction)>, WalletError> {
        let rows: Vec<FoundRow> = sqlx::query_as(&format!(
            "SELECT wallet_id, {} FROM wallet_transactions WHERE payment_intent_id = $1 LIMIT 2",
            TRANSACTION_COLUMNS
        ))
        .bind(payment_intent_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(WalletError::Validation(format!(
                "payment intent {} is present in more than one wallet",
                payment_intent_id
            )));
        }

        rows.into_iter()
            .next()
            .map(|(wallet_id, id, intent, delta, status, kind, reverses, created_at, updated_at)| {
                transaction_from_row((id, intent, delta, status, kind, reverses, created_at, updated_at))
                    .map(|tx| (wallet_id, tx))
            })
            .transpose()
    }

    async fn list_wallet_ids(&self) -> Result<Vec<Uuid>, WalletError> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM wallets ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}
