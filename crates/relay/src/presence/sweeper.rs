// Background maintenance for the presence registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, Instrument};

use super::{PresenceKey, PresenceRegistry};

/// Connection view the sweeper consults before expiring a participant, and
/// the receiver of the ones it removes.
pub trait ExpiryNotifier: Send + Sync {
    /// Whether the user still has a live connection to the workspace.
    /// Connected participants go idle but are never expired.
    fn is_connected(&self, workspace_id: &str, user_id: &str) -> bool;

    fn participant_expired(&self, workspace_id: &str, user_id: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idled: Vec<PresenceKey>,
    pub expired: Vec<PresenceKey>,
}

/// Periodically demotes inactive participants to idle and removes expired
/// ones. Runs until its handle is shut down.
#[derive(Debug, Clone)]
pub struct PresenceSweeper {
    registry: PresenceRegistry,
    idle_after: Duration,
    expire_after: Duration,
    every: Duration,
}

impl PresenceSweeper {
    pub fn new(
        registry: PresenceRegistry,
        idle_after: Duration,
        expire_after: Duration,
        every: Duration,
    ) -> Self {
        Self { registry, idle_after, expire_after, every: every.max(Duration::from_millis(1)) }
    }

    /// One pass: expiry first so entries about to vanish are not idled.
    pub async fn sweep_once(&self, notifier: &dyn ExpiryNotifier) -> SweepReport {
        let expired = self
            .registry
            .sweep_expired_except(self.expire_after, |workspace_id, user_id| {
                notifier.is_connected(workspace_id, user_id)
            })
            .await;
        let idled = self.registry.sweep_idle(self.idle_after).await;
        SweepReport { idled, expired }
    }

    pub fn spawn(self, notifier: Arc<dyn ExpiryNotifier>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + self.every, self.every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = self.sweep_once(notifier.as_ref()).await;
                            for (workspace_id, user_id) in &report.expired {
                                notifier.participant_expired(workspace_id, user_id);
                            }
                            if !report.idled.is_empty() || !report.expired.is_empty() {
                                debug!(
                                    idled = report.idled.len(),
                                    expired = report.expired.len(),
                                    "presence sweep"
                                );
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }

                info!("presence sweeper stopped");
            }
            .instrument(info_span!("relay.presence.sweeper")),
        );

        SweeperHandle { shutdown: shutdown_tx, task }
    }
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
