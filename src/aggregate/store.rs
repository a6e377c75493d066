//! Aggregate state persistence
//!
//! Current state per (kind, aggregate id) with an optimistic `version`:
//! an update names the version it read and fails if another writer moved
//! the aggregate in between. Each record also keeps the fingerprints of the
//! events that moved it, so a redelivery is recognised even after a cycle
//! has brought the aggregate back to the same state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::AggregateKind;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Version conflict for {kind} {aggregate_id}: expected {expected}, found {actual}")]
    VersionConflict {
        kind: AggregateKind,
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("{kind} {aggregate_id} already exists")]
    AlreadyExists {
        kind: AggregateKind,
        aggregate_id: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt aggregate state: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateRecord {
    pub kind: AggregateKind,
    pub aggregate_id: String,
    pub state: String,
    /// Starts at 1 on creation, +1 per transition
    pub version: i64,
    /// Fingerprints of the events that created or moved the aggregate
    #[serde(skip)]
    pub applied_events: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregateRecord {
    pub fn new(kind: AggregateKind, aggregate_id: impl Into<String>, state: &str) -> Self {
        let now = Utc::now();
        Self {
            kind,
            aggregate_id: aggregate_id.into(),
            state: state.to_string(),
            version: 1,
            applied_events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record the creating event.
    pub fn applied_by(mut self, fingerprint: impl Into<String>) -> Self {
        self.applied_events.push(fingerprint.into());
        self
    }

    pub fn has_applied(&self, fingerprint: &str) -> bool {
        self.applied_events.iter().any(|f| f == fingerprint)
    }
}

#[async_trait]
pub trait AggregateStateStore: Send + Sync {
    async fn load(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Option<AggregateRecord>, StateStoreError>;

    /// Fails with `AlreadyExists` if the aggregate is present.
    async fn insert(&self, record: AggregateRecord) -> Result<AggregateRecord, StateStoreError>;

    /// Move to `state` if the stored version still equals `expected_version`,
    /// remembering `fingerprint` as applied.
    async fn update(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
        expected_version: i64,
        state: &str,
        fingerprint: &str,
    ) -> Result<AggregateRecord, StateStoreError>;
}

// =========================================================================
// In-memory
// =========================================================================

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<(AggregateKind, String), AggregateRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregateStateStore for MemoryStateStore {
    async fn load(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Option<AggregateRecord>, StateStoreError> {
        let records = self.records.read().await;
        Ok(records.get(&(kind, aggregate_id.to_string())).cloned())
    }

    async fn insert(&self, record: AggregateRecord) -> Result<AggregateRecord, StateStoreError> {
        let mut records = self.records.write().await;
        let key = (record.kind, record.aggregate_id.clone());
        if records.contains_key(&key) {
            return Err(StateStoreError::AlreadyExists {
                kind: record.kind,
                aggregate_id: record.aggregate_id,
            });
        }
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
        expected_version: i64,
        state: &str,
        fingerprint: &str,
    ) -> Result<AggregateRecord, StateStoreError> {
        let mut records = self.records.write().await;
        let conflict = |actual| StateStoreError::VersionConflict {
            kind,
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual,
        };

        let record = records
            .get_mut(&(kind, aggregate_id.to_string()))
            .ok_or_else(|| conflict(0))?;
        if record.version != expected_version {
            return Err(conflict(record.version));
        }

        record.state = state.to_string();
        record.version += 1;
        record.applied_events.push(fingerprint.to_string());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

// =========================================================================
// PostgreSQL
// =========================================================================

type RecordRow = (String, String, String, i64, Vec<String>, DateTime<Utc>, DateTime<Utc>);

const RECORD_COLUMNS: &str =
    "kind, aggregate_id, state, version, applied_events, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: RecordRow) -> Result<AggregateRecord, StateStoreError> {
    let (kind, aggregate_id, state, version, applied_events, created_at, updated_at) = row;
    let kind = kind
        .parse()
        .map_err(|_| StateStoreError::Corrupt(format!("unknown aggregate kind: {}", kind)))?;
    Ok(AggregateRecord {
        kind,
        aggregate_id,
        state,
        version,
        applied_events,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl AggregateStateStore for PgStateStore {
    async fn load(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Option<AggregateRecord>, StateStoreError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            "SELECT {} FROM aggregate_states WHERE kind = $1 AND aggregate_id = $2",
            RECORD_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn insert(&self, record: AggregateRecord) -> Result<AggregateRecord, StateStoreError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO aggregate_states
                (kind, aggregate_id, state, version, applied_events, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (kind, aggregate_id) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(record.kind.as_str())
        .bind(&record.aggregate_id)
        .bind(&record.state)
        .bind(record.version)
        .bind(&record.applied_events)
        .bind(record.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(row),
            None => Err(StateStoreError::AlreadyExists {
                kind: record.kind,
                aggregate_id: record.aggregate_id,
            }),
        }
    }

    async fn update(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
        expected_version: i64,
        state: &str,
        fingerprint: &str,
    ) -> Result<AggregateRecord, StateStoreError> {
        let row: Option<RecordRow> = sqlx::query_as(&format!(
            r#"
            UPDATE aggregate_states
            SET state = $4,
                version = version + 1,
                applied_events = array_append(applied_events, $5),
                updated_at = NOW()
            WHERE kind = $1 AND aggregate_id = $2 AND version = $3
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(kind.as_str())
        .bind(aggregate_id)
        .bind(expected_version)
        .bind(state)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return record_from_row(row);
        }

        let actual = self
            .load(kind, aggregate_id)
            .await?
            .map(|r| r.version)
            .unwrap_or(0);
        Err(StateStoreError::VersionConflict {
            kind,
            aggregate_id: aggregate_id.to_string(),
            expected: expected_version,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = MemoryStateStore::new();
        store
            .insert(AggregateRecord::new(AggregateKind::Round, "r1", "created"))
            .await
            .unwrap();

        let updated = store
            .update(AggregateKind::Round, "r1", 1, "approved", "fp-approve")
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.state, "approved");
        assert!(updated.has_applied("fp-approve"));

        // Same id under another kind is a different aggregate
        assert!(store.load(AggregateKind::Campaign, "r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStateStore::new();
        store
            .insert(AggregateRecord::new(AggregateKind::Round, "r1", "created"))
            .await
            .unwrap();
        store
            .update(AggregateKind::Round, "r1", 1, "approved", "fp-approve")
            .await
            .unwrap();

        let stale = store
            .update(AggregateKind::Round, "r1", 1, "cancelled", "fp-cancel")
            .await;
        assert!(matches!(
            stale,
            Err(StateStoreError::VersionConflict { expected: 1, actual: 2, .. })
        ));
        let record = store.load(AggregateKind::Round, "r1").await.unwrap().unwrap();
        assert_eq!(record.state, "approved");
        assert!(!record.has_applied("fp-cancel"));
    }

    #[tokio::test]
    async fn test_double_insert() {
        let store = MemoryStateStore::new();
        let record = AggregateRecord::new(AggregateKind::Settlement, "s1", "initiated");
        store.insert(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert(record).await,
            Err(StateStoreError::AlreadyExists { .. })
        ));
    }
}
