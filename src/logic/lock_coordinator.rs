use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LockConfig;
use crate::error::{BranchLockError, Result};
use crate::model::{
    generate_id, Clock, Id, Lock, LockHandle, LockRequest, LockState, LockType, ResourceKey,
    SystemClock,
};
use crate::store::traits::{AcquireOutcome, LockStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Released,
    /// The lock was already gone (released, evicted or reaped)
    NotFound,
}

/// Called after a lock leaves the table, whether released, evicted or reaped
#[async_trait::async_trait]
pub trait LockReleaseListener: Send + Sync {
    async fn on_lock_released(&self, lock: &Lock);
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub default_ttl_secs: u64,
    pub poll_interval: Duration,
}

impl From<&LockConfig> for CoordinatorSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            default_ttl_secs: config.default_ttl_secs,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

/// One watch channel per branch; every release on the branch bumps it
#[derive(Debug, Default)]
struct WaitRegistry {
    channels: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl WaitRegistry {
    fn subscribe(&self, branch: &str) -> watch::Receiver<u64> {
        let mut channels = self.channels.lock();
        channels
            .entry(branch.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn notify(&self, branch: &str) {
        let mut channels = self.channels.lock();
        if let Some(sender) = channels.get(branch) {
            sender.send_modify(|generation| *generation = generation.wrapping_add(1));
            if sender.receiver_count() == 0 {
                channels.remove(branch);
            }
        }
    }
}

/// Grants, renews and releases locks against a shared [`LockStore`].
///
/// Correctness rests on the store's atomic check-and-insert, so any number of
/// coordinators (in this process or others) may share one store. The
/// in-process wait registry only shortens waits; a waiter that misses a wake
/// still retries every `poll_interval`.
///
/// Waiters are not served in arrival order. A later waiter may win a freed
/// lock; callers bound their wait with `acquire_timeout` and retry.
pub struct LockCoordinator<S: LockStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    waiters: WaitRegistry,
    listeners: RwLock<Vec<Arc<dyn LockReleaseListener>>>,
    settings: CoordinatorSettings,
}

impl<S: LockStore> LockCoordinator<S> {
    pub fn new(store: Arc<S>, settings: CoordinatorSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, settings: CoordinatorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            waiters: WaitRegistry::default(),
            listeners: RwLock::new(Vec::new()),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn register_listener(&self, listener: Arc<dyn LockReleaseListener>) {
        self.listeners.write().push(listener);
    }

    /// Request for `key` using the configured default TTL
    pub fn request(&self, key: ResourceKey, lock_type: LockType, holder_id: impl Into<String>) -> LockRequest {
        LockRequest::new(key, lock_type, holder_id).with_ttl_secs(self.settings.default_ttl_secs)
    }

    pub async fn acquire(&self, request: LockRequest) -> Result<LockHandle> {
        self.acquire_cancellable(request, &CancellationToken::new())
            .await
    }

    /// Acquire, waiting up to `request.acquire_timeout` while a conflicting
    /// lock is held. Cancelling `cancel` mid-wait returns `Cancelled` and
    /// leaves nothing behind.
    pub async fn acquire_cancellable(
        &self,
        request: LockRequest,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        if request.holder_id.is_empty() {
            return Err(BranchLockError::invalid_request("holder id must not be empty"));
        }
        if request.ttl_seconds == 0 {
            return Err(BranchLockError::invalid_request("lock ttl must be positive"));
        }

        let started = Instant::now();
        let deadline = started + request.acquire_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(BranchLockError::Cancelled);
            }

            // Subscribe before the attempt so a release racing it still wakes us
            let mut wake = self.waiters.subscribe(request.resource_key.branch_name());
            let now = self.clock.now();

            let blocker = match self.store.try_acquire(Lock::new(&request, now), now).await? {
                AcquireOutcome::Acquired { lock, evicted } => {
                    for stale in &evicted {
                        warn!(
                            "Evicted stale {} lock on {} held by '{}' (last heartbeat {})",
                            stale.lock_type, stale.resource_key, stale.holder_id, stale.last_heartbeat_at
                        );
                        self.notify_released(stale).await;
                    }
                    debug!(
                        "Acquired {} lock {} on {} for '{}'",
                        lock.lock_type, lock.id, lock.resource_key, lock.holder_id
                    );
                    return Ok(lock.handle());
                }
                AcquireOutcome::Blocked(blocker) => blocker,
            };

            if request.acquire_timeout.is_zero() {
                return Err(BranchLockError::LockConflict {
                    key: request.resource_key.to_string(),
                    holder: blocker.holder_id,
                    lock_type: blocker.lock_type,
                });
            }

            let current = Instant::now();
            if current >= deadline {
                debug!(
                    "Gave up waiting for {} after {:?}",
                    request.resource_key,
                    started.elapsed()
                );
                return Err(BranchLockError::LockTimeout {
                    key: request.resource_key.to_string(),
                    waited: started.elapsed(),
                    holder: blocker.holder_id,
                    lock_type: blocker.lock_type,
                });
            }

            let pause = self.settings.poll_interval.min(deadline - current);
            tokio::select! {
                _ = cancel.cancelled() => return Err(BranchLockError::Cancelled),
                _ = wake.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Idempotent: releasing a lock that is already gone reports `NotFound`
    /// and is not an error.
    pub async fn release(&self, handle: &LockHandle) -> Result<ReleaseStatus> {
        match self.store.release(&handle.lock_id).await? {
            Some(lock) => {
                debug!("Released lock {} on {}", lock.id, lock.resource_key);
                self.notify_released(&lock).await;
                Ok(ReleaseStatus::Released)
            }
            None => {
                debug!(
                    "Release of lock {} on {} found nothing to release",
                    handle.lock_id, handle.resource_key
                );
                Ok(ReleaseStatus::NotFound)
            }
        }
    }

    /// Record a heartbeat. `LockLost` means the lock was reaped or evicted and
    /// the protected work must stop.
    pub async fn heartbeat(&self, handle: &LockHandle) -> Result<Lock> {
        let now = self.clock.now();
        match self.store.renew(&handle.lock_id, now).await? {
            Some(lock) => Ok(lock),
            None => {
                warn!(
                    "Heartbeat for lock {} on {} found no lock; holder '{}' lost it",
                    handle.lock_id, handle.resource_key, handle.holder_id
                );
                Err(BranchLockError::LockLost {
                    lock_id: handle.lock_id.clone(),
                    key: handle.resource_key.to_string(),
                })
            }
        }
    }

    /// The lock on exactly `key` if one exists, otherwise the oldest lock
    /// overlapping it
    pub async fn inspect(&self, key: &ResourceKey) -> Result<Option<Lock>> {
        let mut overlapping = self.inspect_all(key).await?;
        let position = overlapping
            .iter()
            .position(|lock| &lock.resource_key == key)
            .unwrap_or(0);
        if overlapping.is_empty() {
            return Ok(None);
        }
        Ok(Some(overlapping.swap_remove(position)))
    }

    /// Every lock overlapping `key`, oldest first. Locks past their TTL that
    /// have not been reaped yet are reported as EXPIRED.
    pub async fn inspect_all(&self, key: &ResourceKey) -> Result<Vec<Lock>> {
        let now = self.clock.now();
        let mut locks = self.store.find_overlapping(key).await?;
        for lock in &mut locks {
            if lock.heartbeat_expired(now) {
                lock.state = LockState::Expired;
            }
        }
        Ok(locks)
    }

    pub async fn active_locks(&self) -> Result<Vec<Lock>> {
        Ok(self.store.list_locks().await?)
    }

    /// Release every lock held under `session_id`
    pub async fn release_session(&self, session_id: &Id) -> Result<Vec<Lock>> {
        let released = self.store.release_session(session_id).await?;
        if !released.is_empty() {
            info!(
                "Session {} ended; released {} lock(s)",
                session_id,
                released.len()
            );
        }
        for lock in &released {
            self.notify_released(lock).await;
        }
        Ok(released)
    }

    /// Wake waiters on the lock's branch and run release listeners
    pub async fn notify_released(&self, lock: &Lock) {
        self.waiters.notify(lock.resource_key.branch_name());
        let listeners: Vec<Arc<dyn LockReleaseListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_lock_released(lock).await;
        }
    }
}

impl<S: LockStore + 'static> LockCoordinator<S> {
    /// Open a session and attach it to the store. If this process dies without
    /// closing it, the store stops seeing the session as attached and the
    /// reaper takes its locks without waiting for their TTL.
    pub async fn open_session(self: &Arc<Self>, holder_id: impl Into<String>) -> Result<LockSession<S>> {
        let id = generate_id();
        self.store.attach_session(&id).await?;
        debug!("Session {} attached", id);
        Ok(LockSession {
            id,
            holder_id: holder_id.into(),
            coordinator: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Release the session's locks, then detach it
    async fn end_session(&self, session_id: &Id) -> Result<Vec<Lock>> {
        let released = self.release_session(session_id).await?;
        self.store.detach_session(session_id).await?;
        Ok(released)
    }
}

/// Groups the locks of one holder session. Dropping the session without
/// calling [`LockSession::close`] releases its locks on a background task.
pub struct LockSession<S: LockStore + 'static> {
    id: Id,
    holder_id: String,
    coordinator: Arc<LockCoordinator<S>>,
    closed: AtomicBool,
}

impl<S: LockStore + 'static> LockSession<S> {
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquire with the coordinator's default TTL and the given wait bound
    pub async fn acquire(
        &self,
        key: ResourceKey,
        lock_type: LockType,
        acquire_timeout: Duration,
    ) -> Result<LockHandle> {
        let request = self
            .coordinator
            .request(key, lock_type, self.holder_id.clone())
            .with_acquire_timeout(acquire_timeout)
            .in_session(self.id.clone());
        self.coordinator.acquire(request).await
    }

    /// End the session, releasing every lock it still holds
    pub async fn close(self) -> Result<usize> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(self.coordinator.end_session(&self.id).await?.len())
    }
}

impl<S: LockStore + 'static> Drop for LockSession<S> {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Session {} dropped outside a runtime; its locks expire by TTL",
                self.id
            );
            return;
        };
        let coordinator = Arc::clone(&self.coordinator);
        let session_id = self.id.clone();
        runtime.spawn(async move {
            if let Err(e) = coordinator.end_session(&session_id).await {
                warn!("Failed to end session {}: {}", session_id, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> LockCoordinator<MemoryStore> {
        LockCoordinator::new(Arc::new(MemoryStore::new()), CoordinatorSettings::default())
    }

    fn manual(key: &str, holder: &str) -> LockRequest {
        LockRequest::new(ResourceKey::branch(key), LockType::Manual, holder)
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_conflict_with_holder() {
        let coordinator = coordinator();
        coordinator.acquire(manual("main", "a")).await.unwrap();

        match coordinator.acquire(manual("main", "b")).await {
            Err(BranchLockError::LockConflict {
                holder, lock_type, ..
            }) => {
                assert_eq!(holder, "a");
                assert_eq!(lock_type, LockType::Manual);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compatible_types_share_a_branch() {
        let coordinator = coordinator();
        let key = ResourceKey::branch("main");
        for (holder, lock_type) in [
            ("indexer", LockType::Indexing),
            ("backup", LockType::Backup),
            ("maint", LockType::Maintenance),
        ] {
            coordinator
                .acquire(LockRequest::new(key.clone(), lock_type, holder))
                .await
                .unwrap();
        }
        assert_eq!(coordinator.inspect_all(&key).await.unwrap().len(), 3);

        let migration = LockRequest::new(key, LockType::Migration, "migrator");
        assert!(matches!(
            coordinator.acquire(migration).await,
            Err(BranchLockError::LockConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let coordinator = coordinator();
        let handle = coordinator.acquire(manual("main", "a")).await.unwrap();

        assert_eq!(
            coordinator.release(&handle).await.unwrap(),
            ReleaseStatus::Released
        );
        assert_eq!(
            coordinator.release(&handle).await.unwrap(),
            ReleaseStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let coordinator = Arc::new(coordinator());
        let held = coordinator.acquire(manual("main", "a")).await.unwrap();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .acquire(manual("main", "b").with_acquire_timeout(Duration::from_secs(5)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.release(&held).await.unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.holder_id, "b");
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_lock() {
        let coordinator = Arc::new(coordinator());
        coordinator.acquire(manual("main", "a")).await.unwrap();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire_cancellable(
                        manual("main", "b").with_acquire_timeout(Duration::from_secs(30)),
                        &cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(BranchLockError::Cancelled)
        ));
        let locks = coordinator.active_locks().await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].holder_id, "a");
    }

    #[tokio::test]
    async fn test_stale_lock_is_evicted_on_acquire() {
        let clock = Arc::new(ManualClock::default());
        let coordinator = LockCoordinator::with_clock(
            Arc::new(MemoryStore::new()),
            CoordinatorSettings::default(),
            clock.clone(),
        );
        let stale = coordinator
            .acquire(manual("main", "a").with_ttl_secs(5))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(6));
        coordinator.acquire(manual("main", "b")).await.unwrap();

        assert!(matches!(
            coordinator.heartbeat(&stale).await,
            Err(BranchLockError::LockLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_inspect_marks_expired_locks() {
        let clock = Arc::new(ManualClock::default());
        let coordinator = LockCoordinator::with_clock(
            Arc::new(MemoryStore::new()),
            CoordinatorSettings::default(),
            clock.clone(),
        );
        let key = ResourceKey::resource("main", "R1");
        coordinator
            .acquire(LockRequest::new(key.clone(), LockType::Indexing, "a").with_ttl_secs(5))
            .await
            .unwrap();

        assert_eq!(
            coordinator.inspect(&key).await.unwrap().unwrap().state,
            LockState::Active
        );
        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(
            coordinator.inspect(&key).await.unwrap().unwrap().state,
            LockState::Expired
        );
        assert!(coordinator
            .inspect(&ResourceKey::resource("main", "R2"))
            .await
            .unwrap()
            .is_none());
    }

    struct CountingListener(AtomicUsize);

    #[async_trait::async_trait]
    impl LockReleaseListener for CountingListener {
        async fn on_lock_released(&self, _lock: &Lock) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_session_close_releases_everything() {
        let coordinator = Arc::new(coordinator());
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        coordinator.register_listener(listener.clone());

        let session = coordinator.open_session("worker-1").await.unwrap();
        session
            .acquire(ResourceKey::resource("main", "R1"), LockType::Manual, Duration::ZERO)
            .await
            .unwrap();
        session
            .acquire(ResourceKey::resource("dev", "R1"), LockType::Manual, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(session.close().await.unwrap(), 2);
        assert!(coordinator.active_locks().await.unwrap().is_empty());
        assert_eq!(listener.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_in_background() {
        let coordinator = Arc::new(coordinator());
        {
            let session = coordinator.open_session("worker-2").await.unwrap();
            session
                .acquire(ResourceKey::branch("main"), LockType::Manual, Duration::ZERO)
                .await
                .unwrap();
        }

        for _ in 0..50 {
            if coordinator.active_locks().await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session locks were not released after drop");
    }
}
