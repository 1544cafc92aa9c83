use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, LockConfig};
use crate::error::Result;
use crate::logic::branch_state::BranchStateManager;
use crate::logic::lock_coordinator::{CoordinatorSettings, LockCoordinator};
use crate::model::{Clock, Lock, LockState};
use crate::store::branch_cache::BranchCache;
use crate::store::traits::{LockStore, Store};

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub max_lock_lifetime: chrono::Duration,
    pub batch_size: usize,
}

impl From<&LockConfig> for ReaperSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            interval: config.cleanup_interval(),
            max_lock_lifetime: config.max_lock_lifetime(),
            batch_size: config.reaper_batch_size.max(1),
        }
    }
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    /// Locks deleted by this sweep, marked EXPIRED
    pub reclaimed: Vec<Lock>,
    /// Candidates a holder renewed between scan and delete
    pub skipped: usize,
}

/// Reclaims locks whose holder stopped heartbeating or that outlived the
/// maximum lock lifetime
pub struct CleanupReaper<S: LockStore + 'static> {
    coordinator: Arc<LockCoordinator<S>>,
    settings: ReaperSettings,
}

impl<S: LockStore + 'static> CleanupReaper<S> {
    pub fn new(coordinator: Arc<LockCoordinator<S>>, settings: ReaperSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    /// One full pass over every reclaimable lock, page by page
    pub async fn sweep_once(&self) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let store = self.coordinator.store();

        loop {
            let now = self.coordinator.clock().now();
            let page = store
                .list_reclaimable(now, self.settings.max_lock_lifetime, self.settings.batch_size)
                .await?;
            let page_len = page.len();
            let mut progressed = false;

            for mut lock in page {
                if !store.reclaim(&lock).await? {
                    report.skipped += 1;
                    continue;
                }
                progressed = true;
                lock.state = LockState::Expired;
                warn!(
                    "Reclaimed {} lock {} on {} from '{}' (acquired {}, last heartbeat {})",
                    lock.lock_type,
                    lock.id,
                    lock.resource_key,
                    lock.holder_id,
                    lock.acquired_at,
                    lock.last_heartbeat_at
                );
                self.coordinator.notify_released(&lock).await;
                report.reclaimed.push(lock);
            }

            if page_len < self.settings.batch_size || !progressed {
                break;
            }
            tokio::task::yield_now().await;
        }

        if !report.reclaimed.is_empty() {
            info!("Reaper sweep reclaimed {} lock(s)", report.reclaimed.len());
        } else {
            debug!("Reaper sweep found nothing to reclaim");
        }
        Ok(report)
    }

    /// Run `sweep_once` every interval until the handle is shut down
    pub fn spawn(self) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Cleanup reaper running every {:?} (max lock lifetime {}s)",
                self.settings.interval,
                self.settings.max_lock_lifetime.num_seconds()
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!("Reaper sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Cleanup reaper stopped");
        });

        ReaperHandle { cancel, task }
    }
}

impl<S: Store + 'static> CleanupReaper<S> {
    /// Reaper for a process that runs no orchestrator of its own. Reclaimed
    /// branch-wide MIGRATION locks still hand their branch back to ACTIVE.
    pub fn standalone(store: Arc<S>, config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let coordinator = Arc::new(LockCoordinator::with_clock(
            Arc::clone(&store),
            CoordinatorSettings::from(&config.locks),
            clock,
        ));
        let branches = Arc::new(BranchStateManager::new(
            store,
            BranchCache::new(config.cache.branch_state_ttl()),
        ));
        coordinator.register_listener(branches);
        Self::new(coordinator, ReaperSettings::from(&config.locks))
    }
}

pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the reaper and wait for its current sweep to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Reaper task ended abnormally: {}", e);
        }
    }
}
