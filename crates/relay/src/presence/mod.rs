// Presence registry: who is connected to each workspace and where their
// cursor and selection are.

pub mod sweeper;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tandem_common::types::{CursorPosition, PresenceEntry, PresenceStatus, Selection};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

pub use sweeper::{ExpiryNotifier, PresenceSweeper, SweepReport, SweeperHandle};

/// Fixed participant colours, handed out round-robin per workspace.
pub const COLOR_PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
];

/// A `(workspace_id, user_id)` pair touched by a sweep.
pub type PresenceKey = (String, String);

#[derive(Debug, Default)]
struct WorkspacePresence {
    entries: HashMap<String, PresenceEntry>,
    next_color: usize,
    /// Set when the emptied workspace leaves the registry; joiners holding
    /// the stale slot must look it up again.
    retired: bool,
}

impl WorkspacePresence {
    /// First palette colour not in use, starting at the round-robin counter.
    /// When every colour is taken the counter colour is reused.
    fn assign_color(&mut self) -> &'static str {
        let start = self.next_color % COLOR_PALETTE.len();
        self.next_color = self.next_color.wrapping_add(1);

        let in_use: HashSet<&str> = self.entries.values().map(|entry| entry.color.as_str()).collect();
        (0..COLOR_PALETTE.len())
            .map(|offset| COLOR_PALETTE[(start + offset) % COLOR_PALETTE.len()])
            .find(|color| !in_use.contains(color))
            .unwrap_or(COLOR_PALETTE[start])
    }
}

type WorkspaceSlot = Arc<Mutex<WorkspacePresence>>;

/// Ephemeral per-workspace participant state.
///
/// Each workspace has its own mutex, so different workspaces never contend.
/// The outer map lock is only held to look up, insert or drop a slot, and
/// is never awaited while a workspace lock is held except when dropping.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    workspaces: Arc<RwLock<HashMap<String, WorkspaceSlot>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the user to the workspace with status `active`.
    ///
    /// A user already present keeps their colour; identity fields and
    /// activity are refreshed.
    pub async fn join(
        &self,
        workspace_id: &str,
        user_id: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> PresenceEntry {
        let now = Utc::now();
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| default_display_name(email, user_id));

        loop {
            let slot = self.slot_or_insert(workspace_id).await;
            let mut workspace = slot.lock().await;
            if workspace.retired {
                continue;
            }

            if let Some(existing) = workspace.entries.get_mut(user_id) {
                existing.email = email.to_string();
                existing.display_name = display_name;
                existing.status = PresenceStatus::Active;
                existing.last_activity = now;
                return existing.clone();
            }

            let color = workspace.assign_color().to_string();
            let entry = PresenceEntry {
                user_id: user_id.to_string(),
                email: email.to_string(),
                display_name,
                color,
                cursor_position: None,
                selection: None,
                status: PresenceStatus::Active,
                last_activity: now,
            };
            workspace.entries.insert(user_id.to_string(), entry.clone());
            debug!(workspace_id = %workspace_id, user_id = %user_id, color = %entry.color, "participant joined");
            return entry;
        }
    }

    /// Removes the user; drops the workspace slot once it is empty.
    pub async fn leave(&self, workspace_id: &str, user_id: &str) -> bool {
        let Some(slot) = self.slot(workspace_id).await else {
            return false;
        };
        let mut workspace = slot.lock().await;

        let removed = workspace.entries.remove(user_id).is_some();
        if workspace.entries.is_empty() && !workspace.retired {
            self.retire(workspace_id, &slot, &mut workspace).await;
        }
        removed
    }

    pub async fn update_cursor(
        &self,
        workspace_id: &str,
        user_id: &str,
        cursor: CursorPosition,
    ) -> Option<PresenceEntry> {
        self.touch(workspace_id, user_id, |entry| {
            entry.cursor_position = Some(cursor);
            entry.status = PresenceStatus::Active;
        })
        .await
    }

    pub async fn update_selection(
        &self,
        workspace_id: &str,
        user_id: &str,
        selection: Selection,
    ) -> Option<PresenceEntry> {
        self.touch(workspace_id, user_id, |entry| {
            entry.selection = Some(selection);
            entry.status = PresenceStatus::Active;
        })
        .await
    }

    /// Explicit status override, e.g. a client reporting `away`.
    pub async fn update_status(
        &self,
        workspace_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> Option<PresenceEntry> {
        self.touch(workspace_id, user_id, |entry| entry.status = status).await
    }

    /// Records a document edit by the user.
    ///
    /// Activity is refreshed and an `idle` participant becomes `active`
    /// again; `away` is left alone. Returns the entry only when its status
    /// changed.
    pub async fn record_activity(&self, workspace_id: &str, user_id: &str) -> Option<PresenceEntry> {
        let slot = self.slot(workspace_id).await?;
        let mut workspace = slot.lock().await;
        let entry = workspace.entries.get_mut(user_id)?;

        entry.last_activity = Utc::now();
        if entry.status != PresenceStatus::Idle {
            return None;
        }
        entry.status = PresenceStatus::Active;
        Some(entry.clone())
    }

    pub async fn get(&self, workspace_id: &str, user_id: &str) -> Option<PresenceEntry> {
        let slot = self.slot(workspace_id).await?;
        let entry = slot.lock().await.entries.get(user_id).cloned();
        entry
    }

    /// All entries of a workspace, ordered by user id.
    pub async fn list_all(&self, workspace_id: &str) -> Vec<PresenceEntry> {
        let Some(slot) = self.slot(workspace_id).await else {
            return Vec::new();
        };
        let mut entries: Vec<PresenceEntry> = slot.lock().await.entries.values().cloned().collect();
        entries.sort_by(|left, right| left.user_id.cmp(&right.user_id));
        entries
    }

    /// Entries whose status is `active` or `idle`.
    pub async fn list_online(&self, workspace_id: &str) -> Vec<PresenceEntry> {
        let mut entries = self.list_all(workspace_id).await;
        entries.retain(|entry| entry.status.is_online());
        entries
    }

    pub async fn count(&self, workspace_id: &str) -> usize {
        let Some(slot) = self.slot(workspace_id).await else {
            return 0;
        };
        let count = slot.lock().await.entries.len();
        count
    }

    pub async fn workspace_count(&self) -> usize {
        self.workspaces.read().await.len()
    }

    /// Demotes `active` entries without activity for `threshold` to `idle`.
    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<PresenceKey> {
        self.sweep_idle_at(threshold, Utc::now()).await
    }

    pub(crate) async fn sweep_idle_at(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Vec<PresenceKey> {
        let cutoff = cutoff(now, threshold);
        let mut demoted = Vec::new();

        for (workspace_id, slot) in self.slots().await {
            let mut workspace = slot.lock().await;
            for entry in workspace.entries.values_mut() {
                if entry.status == PresenceStatus::Active && entry.last_activity <= cutoff {
                    entry.status = PresenceStatus::Idle;
                    demoted.push((workspace_id.clone(), entry.user_id.clone()));
                }
            }
        }

        demoted.sort();
        demoted
    }

    /// Removes entries without activity for `timeout`, then any workspace
    /// left empty.
    pub async fn sweep_expired(&self, timeout: Duration) -> Vec<PresenceKey> {
        self.sweep_expired_at(timeout, Utc::now(), |_, _| false).await
    }

    /// Like [`PresenceRegistry::sweep_expired`], but never removes a
    /// participant for which `keep(workspace_id, user_id)` holds.
    pub async fn sweep_expired_except<F>(&self, timeout: Duration, keep: F) -> Vec<PresenceKey>
    where
        F: Fn(&str, &str) -> bool,
    {
        self.sweep_expired_at(timeout, Utc::now(), keep).await
    }

    pub(crate) async fn sweep_expired_at<F>(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
        keep: F,
    ) -> Vec<PresenceKey>
    where
        F: Fn(&str, &str) -> bool,
    {
        let cutoff = cutoff(now, timeout);
        let mut expired = Vec::new();

        for (workspace_id, slot) in self.slots().await {
            let mut workspace = slot.lock().await;
            workspace.entries.retain(|user_id, entry| {
                let retained = entry.last_activity > cutoff || keep(workspace_id.as_str(), user_id.as_str());
                if !retained {
                    expired.push((workspace_id.clone(), user_id.clone()));
                }
                retained
            });
            if workspace.entries.is_empty() && !workspace.retired {
                self.retire(&workspace_id, &slot, &mut workspace).await;
            }
        }

        expired.sort();
        expired
    }

    async fn touch<F>(&self, workspace_id: &str, user_id: &str, mutate: F) -> Option<PresenceEntry>
    where
        F: FnOnce(&mut PresenceEntry),
    {
        let slot = self.slot(workspace_id).await?;
        let mut workspace = slot.lock().await;
        let entry = workspace.entries.get_mut(user_id)?;
        mutate(entry);
        entry.last_activity = Utc::now();
        Some(entry.clone())
    }

    async fn slot(&self, workspace_id: &str) -> Option<WorkspaceSlot> {
        self.workspaces.read().await.get(workspace_id).cloned()
    }

    async fn slot_or_insert(&self, workspace_id: &str) -> WorkspaceSlot {
        if let Some(slot) = self.slot(workspace_id).await {
            return slot;
        }
        self.workspaces.write().await.entry(workspace_id.to_string()).or_default().clone()
    }

    async fn slots(&self) -> Vec<(String, WorkspaceSlot)> {
        let workspaces = self.workspaces.read().await;
        workspaces.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect()
    }

    /// Drops an emptied workspace. Must be called with `workspace` locked.
    async fn retire(&self, workspace_id: &str, slot: &WorkspaceSlot, workspace: &mut WorkspacePresence) {
        workspace.retired = true;
        let mut workspaces = self.workspaces.write().await;
        if workspaces.get(workspace_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            workspaces.remove(workspace_id);
        }
    }
}

fn cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(threshold)
        .ok()
        .and_then(|threshold| now.checked_sub_signed(threshold))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Local part of the e-mail, falling back to the user id.
fn default_display_name(email: &str, user_id: &str) -> String {
    email
        .split('@')
        .next()
        .map(str::trim)
        .filter(|local| !local.is_empty())
        .unwrap_or(user_id)
        .to_string()
}
