//! Dead-letter path
//!
//! Work that exhausted its retries lands here for manual reconciliation.
//! Letters are keyed by (event fingerprint, handler), so repeated failures of
//! the same delivery accumulate attempts instead of duplicating rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::{EconomicEvent, RawEconomicEvent};

use super::BusError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub fingerprint: String,
    pub handler: String,
    pub event: EconomicEvent,
    pub error: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(handler: &str, event: EconomicEvent, error: impl ToString, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: event.fingerprint(),
            handler: handler.to_string(),
            event,
            error: error.to_string(),
            attempts,
            first_failed_at: now,
            last_failed_at: now,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError>;

    async fn list(&self) -> Result<Vec<DeadLetter>, BusError>;

    /// Remove after manual resolution. Returns whether a letter existed.
    async fn resolve(&self, fingerprint: &str, handler: &str) -> Result<bool, BusError>;
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: RwLock<HashMap<(String, String), DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError> {
        let mut letters = self.letters.write().await;
        let key = (letter.fingerprint.clone(), letter.handler.clone());
        match letters.get_mut(&key) {
            Some(existing) => {
                existing.attempts += letter.attempts;
                existing.error = letter.error;
                existing.last_failed_at = letter.last_failed_at;
            }
            None => {
                letters.insert(key, letter);
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, BusError> {
        let mut letters: Vec<DeadLetter> = self.letters.read().await.values().cloned().collect();
        letters.sort_by_key(|l| l.first_failed_at);
        Ok(letters)
    }

    async fn resolve(&self, fingerprint: &str, handler: &str) -> Result<bool, BusError> {
        let mut letters = self.letters.write().await;
        Ok(letters
            .remove(&(fingerprint.to_string(), handler.to_string()))
            .is_some())
    }
}

#[derive(Debug, Clone)]
pub struct PgDeadLetters {
    pool: PgPool,
}

impl PgDeadLetters {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetters {
    async fn record(&self, letter: DeadLetter) -> Result<(), BusError> {
        let event = serde_json::to_value(letter.event.to_raw())?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (fingerprint, handler, event, error, attempts, first_failed_at, last_failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (fingerprint, handler) DO UPDATE
            SET error = EXCLUDED.error,
                attempts = dead_letters.attempts + EXCLUDED.attempts,
                last_failed_at = EXCLUDED.last_failed_at
            "#,
        )
        .bind(&letter.fingerprint)
        .bind(&letter.handler)
        .bind(event)
        .bind(&letter.error)
        .bind(letter.attempts as i32)
        .bind(letter.last_failed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, BusError> {
        let rows: Vec<(
            String,
            String,
            serde_json::Value,
            String,
            i32,
            DateTime<Utc>,
            DateTime<Utc>,
        )> = sqlx::query_as(
            r#"
            SELECT fingerprint, handler, event, error, attempts, first_failed_at, last_failed_at
            FROM dead_letters
            ORDER BY first_failed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut letters = Vec::with_capacity(rows.len());
        for (fingerprint, handler, event, error, attempts, first_failed_at, last_failed_at) in rows
        {
            let raw: RawEconomicEvent = serde_json::from_value(event)?;
            let event = EconomicEvent::try_from(raw)
                .map_err(|e| BusError::Unavailable(format!("stored dead letter is invalid: {}", e)))?;
            letters.push(DeadLetter {
                fingerprint,
                handler,
                event,
                error,
                attempts: attempts.max(0) as u32,
                first_failed_at,
                last_failed_at,
            });
        }
        Ok(letters)
    }

    async fn resolve(&self, fingerprint: &str, handler: &str) -> Result<bool, BusError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE fingerprint = $1 AND handler = $2")
            .bind(fingerprint)
            .bind(handler)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
