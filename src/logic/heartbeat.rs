use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{BranchLockError, Result};
use crate::logic::lock_coordinator::LockCoordinator;
use crate::model::{Lock, LockHandle};
use crate::store::traits::LockStore;

const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatHealth {
    /// Renewed within the expected cadence
    Healthy,
    /// Missed renewals but still inside its TTL
    Late,
    /// Past its TTL; the reaper or the next acquirer will take it
    Stale,
}

/// Renews locks on behalf of holders and judges how recently a lock was renewed
pub struct HeartbeatMonitor<S: LockStore + 'static> {
    coordinator: Arc<LockCoordinator<S>>,
}

impl<S: LockStore + 'static> HeartbeatMonitor<S> {
    pub fn new(coordinator: Arc<LockCoordinator<S>>) -> Self {
        Self { coordinator }
    }

    /// Renewal cadence for a TTL: a quarter of it, which stays below a third
    pub fn renewal_interval(ttl_seconds: u64) -> Duration {
        (Duration::from_secs(ttl_seconds) / 4).max(MIN_RENEWAL_INTERVAL)
    }

    pub fn assess(lock: &Lock, now: DateTime<Utc>) -> HeartbeatHealth {
        let elapsed = now - lock.last_heartbeat_at;
        if elapsed > lock.ttl() {
            HeartbeatHealth::Stale
        } else if elapsed > lock.ttl() / 3 {
            HeartbeatHealth::Late
        } else {
            HeartbeatHealth::Healthy
        }
    }

    pub async fn beat(&self, handle: &LockHandle) -> Result<Lock> {
        self.coordinator.heartbeat(handle).await
    }

    /// Renew `handle` in the background until stopped or the lock is lost.
    /// Stopping never releases the lock.
    pub fn keep_alive(&self, handle: LockHandle) -> KeepAlive {
        let stop = CancellationToken::new();
        let lost = CancellationToken::new();
        let interval = Self::renewal_interval(handle.ttl_seconds);

        let task = {
            let coordinator = Arc::clone(&self.coordinator);
            let stop = stop.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately; the lock was just acquired
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match coordinator.heartbeat(&handle).await {
                        Ok(_) => debug!("Renewed lock {} on {}", handle.lock_id, handle.resource_key),
                        Err(BranchLockError::LockLost { .. }) => {
                            lost.cancel();
                            break;
                        }
                        Err(e) => {
                            // Transient store failure; the next tick retries while the TTL allows
                            warn!("Heartbeat for lock {} failed: {}", handle.lock_id, e);
                        }
                    }
                }
            })
        };

        KeepAlive {
            stop,
            lost,
            task: Some(task),
        }
    }
}

/// Background renewal of one lock. Dropping it stops renewal.
#[derive(Debug)]
pub struct KeepAlive {
    stop: CancellationToken,
    lost: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Fires once a renewal finds the lock gone
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
