use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::{info_span, Instrument};

use crate::error::PersistenceError;

/// Materialized state of a workspace as kept in durable storage.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceRecord {
    pub workspace_id: String,
    pub state: Value,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

/// Layout of the persisted state blob.
#[derive(Debug, Serialize, Deserialize)]
struct StateBlob {
    state: Value,
    version: u64,
    last_modified: DateTime<Utc>,
}

impl WorkspaceRecord {
    pub fn to_blob(&self) -> Result<Value, PersistenceError> {
        Ok(serde_json::to_value(StateBlob {
            state: self.state.clone(),
            version: self.version,
            last_modified: self.last_modified,
        })?)
    }

    pub fn from_blob(workspace_id: &str, blob: Value) -> Result<Self, PersistenceError> {
        let blob: StateBlob = serde_json::from_value(blob)?;
        Ok(Self {
            workspace_id: workspace_id.to_string(),
            state: blob.state,
            version: blob.version,
            last_modified: blob.last_modified,
        })
    }
}

/// Point-in-time export of a document, independent of the update log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub workspace_id: String,
    pub state: Value,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

/// Decides when the in-memory state of a workspace is flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushPolicy {
    pub every_updates: Option<u64>,
    pub interval: Option<Duration>,
}

impl FlushPolicy {
    pub fn every_updates(count: u64) -> Self {
        Self { every_updates: Some(count), interval: None }
    }

    pub fn every(interval: Duration) -> Self {
        Self { every_updates: None, interval: Some(interval) }
    }

    pub fn never() -> Self {
        Self::default()
    }

    /// Builds a policy from config values where zero disables a trigger.
    pub fn from_limits(every_updates: u64, interval: Duration) -> Self {
        Self {
            every_updates: (every_updates > 0).then_some(every_updates),
            interval: (!interval.is_zero()).then_some(interval),
        }
    }

    pub fn should_flush(
        &self,
        updates_since_flush: u64,
        last_flush_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if updates_since_flush == 0 {
            return false;
        }

        if self.every_updates.is_some_and(|every| updates_since_flush >= every) {
            return true;
        }

        let Some(interval) = self.interval.and_then(|interval| ChronoDuration::from_std(interval).ok())
        else {
            return false;
        };

        now.signed_duration_since(last_flush_at) >= interval
    }
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PersistenceError>> + Send + 'a>>;

/// Durable storage backend for workspace records.
///
/// `save` must never replace a stored record with a lower version.
pub trait WorkspaceStateStore: Send + Sync {
    fn load<'a>(&'a self, workspace_id: &'a str) -> StoreFuture<'a, Option<WorkspaceRecord>>;

    fn save<'a>(&'a self, record: &'a WorkspaceRecord) -> StoreFuture<'a, ()>;
}

/// Process-local store used in development and tests.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceStore {
    records: RwLock<HashMap<String, Value>>,
    unavailable: AtomicBool,
    saves: AtomicU64,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable backend; every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl WorkspaceStateStore for MemoryWorkspaceStore {
    fn load<'a>(&'a self, workspace_id: &'a str) -> StoreFuture<'a, Option<WorkspaceRecord>> {
        Box::pin(async move {
            self.check_available()?;
            let blob = self.records.read().await.get(workspace_id).cloned();
            blob.map(|blob| WorkspaceRecord::from_blob(workspace_id, blob)).transpose()
        })
    }

    fn save<'a>(&'a self, record: &'a WorkspaceRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_available()?;
            let blob = record.to_blob()?;
            let mut records = self.records.write().await;
            let stored_version = records
                .get(&record.workspace_id)
                .and_then(|existing| existing.get("version"))
                .and_then(Value::as_u64);
            if stored_version.is_some_and(|stored| stored > record.version) {
                return Ok(());
            }
            records.insert(record.workspace_id.clone(), blob);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    state_blob: Value,
}

/// PostgreSQL-backed store writing to `workspace_sync_state`.
#[derive(Debug, Clone)]
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl WorkspaceStateStore for PgWorkspaceStore {
    fn load<'a>(&'a self, workspace_id: &'a str) -> StoreFuture<'a, Option<WorkspaceRecord>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, StateRow>(
                "
                SELECT state_blob
                FROM workspace_sync_state
                WHERE workspace_id = $1
                ",
            )
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .instrument(info_span!("relay.db.query", query = "load_workspace_state"))
            .await?;

            row.map(|row| WorkspaceRecord::from_blob(workspace_id, row.state_blob)).transpose()
        })
    }

    fn save<'a>(&'a self, record: &'a WorkspaceRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let version = i64::try_from(record.version)
                .map_err(|_| PersistenceError::VersionOverflow { version: record.version })?;
            let blob = record.to_blob()?;

            sqlx::query(
                "
                INSERT INTO workspace_sync_state (workspace_id, state_blob, version, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (workspace_id) DO UPDATE
                SET state_blob = EXCLUDED.state_blob,
                    version = EXCLUDED.version,
                    updated_at = EXCLUDED.updated_at
                WHERE workspace_sync_state.version <= EXCLUDED.version
                ",
            )
            .bind(&record.workspace_id)
            .bind(blob)
            .bind(version)
            .bind(record.last_modified)
            .execute(&self.pool)
            .instrument(info_span!("relay.db.query", query = "save_workspace_state"))
            .await?;

            Ok(())
        })
    }
}

/// Durable load/flush of materialized workspace state.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn WorkspaceStateStore>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn WorkspaceStateStore>) -> Self {
        Self { store }
    }

    pub async fn persist_record(&self, record: &WorkspaceRecord) -> Result<(), PersistenceError> {
        self.store
            .save(record)
            .instrument(info_span!(
                "relay.persistence.persist_state",
                workspace_id = %record.workspace_id,
                version = record.version
            ))
            .await
    }

    pub async fn load_state(
        &self,
        workspace_id: &str,
    ) -> Result<Option<WorkspaceRecord>, PersistenceError> {
        self.store
            .load(workspace_id)
            .instrument(info_span!("relay.persistence.load_state", workspace_id = %workspace_id))
            .await
    }
}
