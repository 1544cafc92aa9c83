use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;

use crate::error::{BranchLockError, Result};
use crate::logic::lock_coordinator::LockReleaseListener;
use crate::model::{Branch, BranchStatus, Lock, LockHandle, LockScope, WriteIntent};
use crate::store::branch_cache::BranchCache;
use crate::store::traits::BranchStore;

/// Owns branch status transitions. Durable changes are compare-and-set on
/// the stored status; every write drops the cached entry before returning.
pub struct BranchStateManager<S: BranchStore> {
    store: Arc<S>,
    cache: BranchCache,
}

impl<S: BranchStore> BranchStateManager<S> {
    pub fn new(store: Arc<S>, cache: BranchCache) -> Self {
        Self { store, cache }
    }

    pub async fn get(&self, name: &str) -> Result<Branch> {
        self.find(name)
            .await?
            .ok_or_else(|| BranchLockError::BranchNotFound(name.to_string()))
    }

    pub async fn find(&self, name: &str) -> Result<Option<Branch>> {
        if let Some(branch) = self.cache.get(name).await {
            return Ok(Some(branch));
        }
        let branch = self.store.get_branch(name).await?;
        if let Some(ref branch) = branch {
            self.cache.put(branch.clone()).await;
        }
        Ok(branch)
    }

    pub async fn list(&self) -> Result<Vec<Branch>> {
        Ok(self.store.list_branches().await?)
    }

    pub async fn create(&self, branch: Branch) -> Result<Branch> {
        let name = branch.name.clone();
        if !self.store.insert_branch(branch.clone()).await? {
            return Err(BranchLockError::BranchExists(name));
        }
        self.cache.invalidate(&name).await;
        info!("Created branch '{}' at {}", name, branch.head_commit_hash);
        Ok(branch)
    }

    /// Move `name` from `from` to `to`. Fails with `InvalidTransition` when the
    /// edge is not allowed or the stored status is no longer `from`.
    pub async fn transition(&self, name: &str, from: BranchStatus, to: BranchStatus) -> Result<()> {
        if !from.can_transition_to(to) {
            return Err(BranchLockError::InvalidTransition {
                branch: name.to_string(),
                from,
                to,
            });
        }

        let applied = self
            .store
            .compare_and_set_status(name, from, to, Utc::now())
            .await?;
        self.cache.invalidate(name).await;

        if !applied {
            let current = self
                .store
                .get_branch(name)
                .await?
                .ok_or_else(|| BranchLockError::BranchNotFound(name.to_string()))?;
            return Err(BranchLockError::InvalidTransition {
                branch: name.to_string(),
                from: current.status,
                to,
            });
        }

        info!("Branch '{}' {} -> {}", name, from.as_str(), to.as_str());
        Ok(())
    }

    pub async fn record_head(&self, name: &str, head_commit_hash: &str) -> Result<()> {
        let updated = self
            .store
            .update_head(name, head_commit_hash, Utc::now())
            .await?;
        self.cache.invalidate(name).await;
        if !updated {
            return Err(BranchLockError::BranchNotFound(name.to_string()));
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self.store.delete_branch(name).await?;
        self.cache.invalidate(name).await;
        Ok(deleted)
    }

    pub async fn check_write_allowed(&self, name: &str, intent: WriteIntent) -> Result<Branch> {
        let branch = self.get(name).await?;
        if let Some(rule) = branch.blocking_rule(intent) {
            return Err(BranchLockError::ProtectionViolation {
                branch: name.to_string(),
                rule: rule.describe(),
            });
        }
        Ok(branch)
    }

    /// ACTIVE → LOCKED_FOR_WRITE on the strength of an exclusive BRANCH lock
    /// held through `handle`.
    pub async fn lock_for_write(&self, name: &str, handle: &LockHandle, intent: WriteIntent) -> Result<()> {
        let covers_branch = handle.resource_key.scope() == LockScope::Branch
            && handle.resource_key.branch_name() == name
            && handle.lock_type.is_exclusive();
        if !covers_branch {
            return Err(BranchLockError::invalid_request(format!(
                "{} lock on {} does not give exclusive access to branch '{}'",
                handle.lock_type, handle.resource_key, name
            )));
        }

        let branch = self.check_write_allowed(name, intent).await?;
        match self
            .transition(name, BranchStatus::Active, BranchStatus::LockedForWrite)
            .await
        {
            Ok(()) => Ok(()),
            Err(BranchLockError::InvalidTransition {
                from: BranchStatus::LockedForWrite,
                ..
            }) => {
                // Left behind by a holder whose release callback never ran. We hold
                // the exclusive lock now, so the status is ours.
                warn!(
                    "Branch '{}' was already LOCKED_FOR_WRITE when '{}' took its lock",
                    branch.name, handle.holder_id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// LOCKED_FOR_WRITE → ACTIVE; a no-op when the branch is not locked
    pub async fn unlock(&self, name: &str) -> Result<bool> {
        let applied = self
            .store
            .compare_and_set_status(name, BranchStatus::LockedForWrite, BranchStatus::Active, Utc::now())
            .await?;
        self.cache.invalidate(name).await;
        if applied {
            info!("Branch '{}' LOCKED_FOR_WRITE -> ACTIVE", name);
        }
        Ok(applied)
    }
}

#[async_trait::async_trait]
impl<S: BranchStore> LockReleaseListener for BranchStateManager<S> {
    async fn on_lock_released(&self, lock: &Lock) {
        if lock.scope() != LockScope::Branch || !lock.lock_type.is_exclusive() {
            return;
        }
        let name = lock.resource_key.branch_name();
        if let Err(e) = self.unlock(name).await {
            warn!(
                "Failed to return branch '{}' to ACTIVE after lock {} ended: {}",
                name, lock.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LockRequest, LockType, ProtectionRule, ResourceKey};
    use crate::store::MemoryStore;

    async fn manager_with(branch: Branch) -> BranchStateManager<MemoryStore> {
        let manager = BranchStateManager::new(Arc::new(MemoryStore::new()), BranchCache::default());
        manager.create(branch).await.unwrap();
        manager
    }

    fn main_branch() -> Branch {
        Branch::new_root("main".into(), "c1".into(), "alice".into())
    }

    fn exclusive_handle(branch: &str) -> LockHandle {
        let request = LockRequest::new(ResourceKey::branch(branch), LockType::Migration, "merger");
        Lock::new(&request, Utc::now()).handle()
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_name() {
        let manager = manager_with(main_branch()).await;
        assert!(matches!(
            manager.create(main_branch()).await,
            Err(BranchLockError::BranchExists(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_for_write_and_release_callback() {
        let manager = manager_with(main_branch()).await;
        let handle = exclusive_handle("main");

        manager
            .lock_for_write("main", &handle, WriteIntent::DirectWrite)
            .await
            .unwrap();
        assert_eq!(manager.get("main").await.unwrap().status, BranchStatus::LockedForWrite);

        let request = LockRequest::new(ResourceKey::branch("main"), LockType::Migration, "merger");
        manager.on_lock_released(&Lock::new(&request, Utc::now())).await;
        assert_eq!(manager.get("main").await.unwrap().status, BranchStatus::Active);
    }

    #[tokio::test]
    async fn test_shared_lock_cannot_lock_branch() {
        let manager = manager_with(main_branch()).await;
        let request = LockRequest::new(ResourceKey::branch("main"), LockType::Indexing, "indexer");
        let handle = Lock::new(&request, Utc::now()).handle();

        assert!(matches!(
            manager.lock_for_write("main", &handle, WriteIntent::DirectWrite).await,
            Err(BranchLockError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_protected_branch_rejects_direct_write() {
        let branch = main_branch().with_protection(vec![ProtectionRule::ForbidDirectWrites]);
        let manager = manager_with(branch).await;

        let result = manager
            .lock_for_write("main", &exclusive_handle("main"), WriteIntent::DirectWrite)
            .await;
        assert!(matches!(result, Err(BranchLockError::ProtectionViolation { .. })));
        assert_eq!(manager.get("main").await.unwrap().status, BranchStatus::Active);

        manager
            .lock_for_write(
                "main",
                &exclusive_handle("main"),
                WriteIntent::ProposalMerge { approvals: 1 },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_status_rejects_transition() {
        let manager = manager_with(main_branch()).await;
        manager
            .transition("main", BranchStatus::Active, BranchStatus::Merged)
            .await
            .unwrap();

        match manager
            .transition("main", BranchStatus::Active, BranchStatus::Archived)
            .await
        {
            Err(BranchLockError::InvalidTransition { from, .. }) => {
                assert_eq!(from, BranchStatus::Merged)
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
        assert!(matches!(
            manager
                .transition("main", BranchStatus::Merged, BranchStatus::Active)
                .await,
            Err(BranchLockError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_writes_invalidate_cache() {
        let manager = manager_with(main_branch()).await;
        assert_eq!(manager.get("main").await.unwrap().head_commit_hash, "c1");

        manager.record_head("main", "c2").await.unwrap();
        assert_eq!(manager.get("main").await.unwrap().head_commit_hash, "c2");
    }
}
