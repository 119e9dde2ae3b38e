use std::collections::{hash_map::Entry, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tandem_common::types::UpdateRecord;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DEFAULT_UPDATE_LOG_LIMIT;
use crate::error::{PersistenceError, SyncError};
use crate::sync::merge::{empty_state, LastWriterWins, MergeCandidate, MergeResolver};
use crate::sync::persistence::{FlushPolicy, PersistenceGateway, Snapshot, WorkspaceRecord};

/// Author recorded on the update produced by a snapshot restore.
pub const RESTORE_AUTHOR: &str = "system:restore";

/// Shared document of one workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub workspace_id: String,
    pub state: Value,
    /// Bounded log of recent updates, oldest first.
    pub updates: VecDeque<UpdateRecord>,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

impl Document {
    fn fresh(workspace_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            state: empty_state(),
            updates: VecDeque::new(),
            version: 0,
            last_modified: Utc::now(),
        }
    }

    fn from_record(record: WorkspaceRecord) -> Self {
        Self {
            workspace_id: record.workspace_id,
            state: record.state,
            updates: VecDeque::new(),
            version: record.version,
            last_modified: record.last_modified,
        }
    }

    fn to_record(&self) -> WorkspaceRecord {
        WorkspaceRecord {
            workspace_id: self.workspace_id.clone(),
            state: self.state.clone(),
            version: self.version,
            last_modified: self.last_modified,
        }
    }

    /// Version of the oldest update still retained in the log.
    pub fn oldest_retained_version(&self) -> Option<u64> {
        self.updates.front().map(|record| record.version)
    }
}

/// Reply to a catch-up request.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub current_version: u64,
    pub missing_updates: Vec<UpdateRecord>,
    /// Present when the missing updates alone cannot rebuild the state.
    pub full_state: Option<Value>,
}

/// Outcome of an explicit flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Persisted { version: u64 },
    UnknownWorkspace,
    Disabled,
}

#[derive(Debug)]
struct DocumentSlot {
    doc: Document,
    last_author: String,
    flushed_version: u64,
    last_flush_at: DateTime<Utc>,
    /// Set once the slot has left the cache; writers must look it up again.
    evicted: bool,
}

impl DocumentSlot {
    fn new(doc: Document) -> Self {
        let flushed_version = doc.version;
        Self {
            doc,
            last_author: String::new(),
            flushed_version,
            last_flush_at: Utc::now(),
            evicted: false,
        }
    }

    fn updates_since_flush(&self) -> u64 {
        self.doc.version.saturating_sub(self.flushed_version)
    }

    fn mark_flushed(&mut self, version: u64, at: DateTime<Utc>) {
        self.flushed_version = self.flushed_version.max(version);
        self.last_flush_at = at;
    }

    fn push_update(&mut self, record: UpdateRecord, log_limit: usize) {
        self.doc.version = record.version;
        self.doc.last_modified = record.timestamp;
        self.last_author = record.user_id.clone();
        self.doc.updates.push_back(record);
        while self.doc.updates.len() > log_limit {
            self.doc.updates.pop_front();
        }
    }
}

/// In-memory cache of workspace documents.
///
/// Each workspace gets its own mutex, so applies to different workspaces run
/// concurrently while applies to one workspace are serialized and versions
/// stay gap-free.
pub struct DocumentStore {
    docs: RwLock<HashMap<String, Arc<Mutex<DocumentSlot>>>>,
    resolver: Arc<dyn MergeResolver>,
    persistence: Option<Arc<PersistenceGateway>>,
    flush_policy: FlushPolicy,
    log_limit: usize,
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(DEFAULT_UPDATE_LOG_LIMIT)
    }
}

impl DocumentStore {
    pub fn new(log_limit: usize) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            resolver: Arc::new(LastWriterWins),
            persistence: None,
            flush_policy: FlushPolicy::never(),
            log_limit: log_limit.max(1),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MergeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_persistence(mut self, gateway: Arc<PersistenceGateway>, policy: FlushPolicy) -> Self {
        self.persistence = Some(gateway);
        self.flush_policy = policy;
        self
    }

    pub fn log_limit(&self) -> usize {
        self.log_limit
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }

    /// Returns the workspace's document, hydrating from durable storage or
    /// creating an empty one at version 0.
    pub async fn get_or_create(&self, workspace_id: &str) -> Result<Document, SyncError> {
        validate_workspace_id(workspace_id)?;
        let slot = self.slot_or_create(workspace_id).await;
        let doc = slot.lock().await.doc.clone();
        Ok(doc)
    }

    /// Returns the workspace's document without creating one.
    pub async fn get(&self, workspace_id: &str) -> Result<Document, SyncError> {
        let slot = self.existing_slot(workspace_id).await?;
        let doc = slot.lock().await.doc.clone();
        Ok(doc)
    }

    pub async fn head_version(&self, workspace_id: &str) -> Option<u64> {
        let slot = self.docs.read().await.get(workspace_id).cloned()?;
        let version = slot.lock().await.doc.version;
        Some(version)
    }

    pub async fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.docs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Applies a full-state update and returns the resulting document.
    ///
    /// The version advances by exactly one per call. When the flush policy
    /// is due the new state is written on a background task; failures there
    /// are logged and never roll back memory.
    pub async fn apply_update(
        &self,
        workspace_id: &str,
        payload: Value,
        user_id: &str,
    ) -> Result<Document, SyncError> {
        let (document, ()) = self.apply_update_with(workspace_id, payload, user_id, |_| ()).await?;
        Ok(document)
    }

    /// Like [`DocumentStore::apply_update`], running `on_applied` while the
    /// workspace is still locked.
    ///
    /// Anything `on_applied` enqueues (a room fan-out, say) is therefore
    /// ordered by version across concurrent writers. It must not block.
    pub async fn apply_update_with<F, R>(
        &self,
        workspace_id: &str,
        payload: Value,
        user_id: &str,
        on_applied: F,
    ) -> Result<(Document, R), SyncError>
    where
        F: FnOnce(&Document) -> R + Send,
        R: Send,
    {
        validate_workspace_id(workspace_id)?;

        async {
            let (document, notified, flush) = {
                let mut slot = self.lock_live_slot(workspace_id).await;
                let version = slot.doc.version + 1;
                let now = Utc::now();

                let state = self.resolver.merge(&[
                    MergeCandidate::new(
                        slot.doc.version,
                        slot.last_author.clone(),
                        slot.doc.state.clone(),
                    ),
                    MergeCandidate::new(version, user_id, payload.clone()),
                ]);
                slot.doc.state = state;
                slot.push_update(
                    UpdateRecord { version, user_id: user_id.to_string(), payload, timestamp: now },
                    self.log_limit,
                );

                let flush = self.persistence.is_some()
                    && self.flush_policy.should_flush(
                        slot.updates_since_flush(),
                        slot.last_flush_at,
                        now,
                    );
                let record = if flush {
                    slot.mark_flushed(version, now);
                    Some(slot.doc.to_record())
                } else {
                    None
                };

                let notified = on_applied(&slot.doc);
                (slot.doc.clone(), notified, record)
            };

            debug!(version = document.version, "update applied");

            if let Some(record) = flush {
                self.spawn_flush(record);
            }

            Ok((document, notified))
        }
        .instrument(info_span!(
            "relay.sync.apply_update",
            workspace_id = %workspace_id,
            user_id = %user_id
        ))
        .await
    }

    /// Updates with a version strictly greater than `since_version`, ascending.
    ///
    /// Only the retained log is consulted, so a client further behind gets
    /// a partial list; use [`DocumentStore::sync_plan`] to detect that.
    pub async fn updates_since(
        &self,
        workspace_id: &str,
        since_version: u64,
    ) -> Result<Vec<UpdateRecord>, SyncError> {
        let slot = self.existing_slot(workspace_id).await?;
        let slot = slot.lock().await;
        Ok(retained_after(&slot.doc, since_version))
    }

    pub async fn full_state(&self, workspace_id: &str) -> Result<Value, SyncError> {
        let slot = self.existing_slot(workspace_id).await?;
        let state = slot.lock().await.doc.state.clone();
        Ok(state)
    }

    /// Everything a client at `since_version` needs to reach the head.
    ///
    /// The full state is attached when `since_version` is 0, when the log
    /// no longer reaches back to `since_version + 1`, or when the client
    /// claims a version the server never produced.
    pub async fn sync_plan(
        &self,
        workspace_id: &str,
        since_version: u64,
    ) -> Result<SyncPlan, SyncError> {
        validate_workspace_id(workspace_id)?;
        let slot = self.lock_live_slot(workspace_id).await;
        let doc = &slot.doc;

        let missing_updates = retained_after(doc, since_version);
        let log_has_gap = since_version < doc.version
            && missing_updates.first().map(|record| record.version) != Some(since_version + 1);
        let needs_full_state = since_version == 0 || since_version > doc.version || log_has_gap;

        Ok(SyncPlan {
            current_version: doc.version,
            missing_updates,
            full_state: needs_full_state.then(|| doc.state.clone()),
        })
    }

    /// Writes the current state of a workspace to durable storage.
    ///
    /// Idempotent: an unchanged document writes the same record again.
    pub async fn persist_state(&self, workspace_id: &str) -> Result<FlushOutcome, PersistenceError> {
        let Some(gateway) = self.persistence.clone() else {
            return Ok(FlushOutcome::Disabled);
        };
        let Some(slot) = self.docs.read().await.get(workspace_id).cloned() else {
            return Ok(FlushOutcome::UnknownWorkspace);
        };

        let record = slot.lock().await.doc.to_record();
        gateway.persist_record(&record).await?;
        slot.lock().await.mark_flushed(record.version, Utc::now());

        Ok(FlushOutcome::Persisted { version: record.version })
    }

    /// Flushes every cached workspace; failures are logged and skipped.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for workspace_id in self.workspace_ids().await {
            match self.persist_state(&workspace_id).await {
                Ok(FlushOutcome::Persisted { .. }) => flushed += 1,
                Ok(_) => {}
                Err(error) => {
                    warn!(workspace_id = %workspace_id, error = %error, "workspace flush failed");
                }
            }
        }
        flushed
    }

    /// Flushes and drops a workspace from memory.
    ///
    /// Returns `false` and keeps the workspace cached when nothing durable
    /// holds its head: the flush failed, persistence is disabled, or an
    /// update landed after the flush.
    pub async fn evict(&self, workspace_id: &str) -> bool {
        let flushed_version = match self.persist_state(workspace_id).await {
            Ok(FlushOutcome::Persisted { version }) => version,
            Ok(FlushOutcome::UnknownWorkspace) => return false,
            Ok(FlushOutcome::Disabled) => {
                debug!(workspace_id = %workspace_id, "no durable storage, keeping workspace cached");
                return false;
            }
            Err(error) => {
                warn!(
                    workspace_id = %workspace_id,
                    error = %error,
                    "flush before eviction failed, keeping workspace cached"
                );
                return false;
            }
        };

        let mut docs = self.docs.write().await;
        let Some(slot) = docs.get(workspace_id).cloned() else {
            return false;
        };
        let mut slot = slot.lock().await;
        if slot.doc.version != flushed_version {
            debug!(
                workspace_id = %workspace_id,
                flushed_version,
                version = slot.doc.version,
                "workspace changed during eviction, keeping it cached"
            );
            return false;
        }
        slot.evicted = true;
        docs.remove(workspace_id);
        true
    }

    pub async fn create_snapshot(&self, workspace_id: &str) -> Result<Snapshot, SyncError> {
        let slot = self.existing_slot(workspace_id).await?;
        let slot = slot.lock().await;
        Ok(Snapshot {
            workspace_id: slot.doc.workspace_id.clone(),
            state: slot.doc.state.clone(),
            version: slot.doc.version,
            created_at: Utc::now(),
        })
    }

    /// Replaces the workspace state with the snapshot's.
    ///
    /// The version moves past both the current head and the snapshot's
    /// version, and the change is logged like any other update so that
    /// catching-up clients see it.
    pub async fn restore_snapshot(
        &self,
        workspace_id: &str,
        snapshot: Snapshot,
    ) -> Result<Document, SyncError> {
        let (document, ()) = self.restore_snapshot_with(workspace_id, snapshot, |_| ()).await?;
        Ok(document)
    }

    /// Like [`DocumentStore::restore_snapshot`], running `on_restored` while
    /// the workspace is still locked.
    pub async fn restore_snapshot_with<F, R>(
        &self,
        workspace_id: &str,
        snapshot: Snapshot,
        on_restored: F,
    ) -> Result<(Document, R), SyncError>
    where
        F: FnOnce(&Document) -> R + Send,
        R: Send,
    {
        validate_workspace_id(workspace_id)?;

        let (document, notified) = {
            let mut slot = self.lock_live_slot(workspace_id).await;
            let version = slot.doc.version.max(snapshot.version) + 1;
            slot.doc.state = snapshot.state.clone();
            slot.push_update(
                UpdateRecord {
                    version,
                    user_id: RESTORE_AUTHOR.to_string(),
                    payload: snapshot.state,
                    timestamp: Utc::now(),
                },
                self.log_limit,
            );
            let notified = on_restored(&slot.doc);
            (slot.doc.clone(), notified)
        };

        info!(
            workspace_id = %workspace_id,
            snapshot_version = snapshot.version,
            version = document.version,
            "snapshot restored"
        );

        if let Err(error) = self.persist_state(workspace_id).await {
            warn!(workspace_id = %workspace_id, error = %error, "flush after restore failed");
        }

        Ok((document, notified))
    }

    fn spawn_flush(&self, record: WorkspaceRecord) {
        let Some(gateway) = self.persistence.clone() else {
            return;
        };

        tokio::spawn(async move {
            if let Err(error) = gateway.persist_record(&record).await {
                warn!(
                    workspace_id = %record.workspace_id,
                    version = record.version,
                    error = %error,
                    "scheduled flush failed, retrying on next trigger"
                );
            }
        });
    }

    async fn existing_slot(&self, workspace_id: &str) -> Result<Arc<Mutex<DocumentSlot>>, SyncError> {
        validate_workspace_id(workspace_id)?;
        if let Some(slot) = self.docs.read().await.get(workspace_id).cloned() {
            return Ok(slot);
        }

        match self.load_durable(workspace_id).await {
            Some(doc) => Ok(self.insert_slot(workspace_id, doc).await),
            None => Err(SyncError::NotFound { workspace_id: workspace_id.to_string() }),
        }
    }

    /// Locks the cached slot for a write, skipping slots that were evicted
    /// while this task waited for them.
    async fn lock_live_slot(&self, workspace_id: &str) -> OwnedMutexGuard<DocumentSlot> {
        loop {
            let slot = self.slot_or_create(workspace_id).await.lock_owned().await;
            if !slot.evicted {
                return slot;
            }
        }
    }

    async fn slot_or_create(&self, workspace_id: &str) -> Arc<Mutex<DocumentSlot>> {
        if let Some(slot) = self.docs.read().await.get(workspace_id).cloned() {
            return slot;
        }

        let doc = self
            .load_durable(workspace_id)
            .await
            .unwrap_or_else(|| Document::fresh(workspace_id));
        self.insert_slot(workspace_id, doc).await
    }

    /// Inserts unless another task won the race, in which case its slot is kept.
    async fn insert_slot(&self, workspace_id: &str, doc: Document) -> Arc<Mutex<DocumentSlot>> {
        let mut docs = self.docs.write().await;
        match docs.entry(workspace_id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(Mutex::new(DocumentSlot::new(doc)))).clone(),
        }
    }

    async fn load_durable(&self, workspace_id: &str) -> Option<Document> {
        let gateway = self.persistence.as_ref()?;
        match gateway.load_state(workspace_id).await {
            Ok(record) => record.map(Document::from_record),
            Err(error) => {
                warn!(
                    workspace_id = %workspace_id,
                    error = %error,
                    "durable load failed, starting from empty state"
                );
                None
            }
        }
    }
}

fn validate_workspace_id(workspace_id: &str) -> Result<(), SyncError> {
    if workspace_id.trim().is_empty() {
        return Err(SyncError::InvalidWorkspaceId);
    }
    Ok(())
}

fn retained_after(doc: &Document, since_version: u64) -> Vec<UpdateRecord> {
    doc.updates.iter().filter(|record| record.version > since_version).cloned().collect()
}
