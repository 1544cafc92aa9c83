use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};

use crate::model::{
    Branch, BranchStatus, ChangeProposal, Id, Lock, LockState, ProposalStatus, ResourceKey,
};
use crate::store::traits::{AcquireOutcome, BranchStore, LockStore, ProposalStore};

/// In-process store for embedding and tests. Every lock-table mutation runs
/// under one mutex, which gives the same atomicity the durable store gets
/// from its transactions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Attached sessions. Taken before `locks` when both are needed.
    sessions: Mutex<HashSet<Id>>,
    locks: Mutex<HashMap<Id, Lock>>,
    branches: RwLock<HashMap<String, Branch>>,
    proposals: RwLock<HashMap<Id, ChangeProposal>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, candidate: Lock, now: DateTime<Utc>) -> Result<AcquireOutcome> {
        let mut locks = self.locks.lock();

        let (stale, live): (Vec<&Lock>, Vec<&Lock>) = locks
            .values()
            .filter(|held| held.conflicts_with(&candidate.resource_key, candidate.lock_type))
            .partition(|held| held.heartbeat_expired(now));

        if let Some(blocker) = live.into_iter().min_by_key(|held| held.acquired_at) {
            return Ok(AcquireOutcome::Blocked(blocker.clone()));
        }

        let stale_ids: Vec<Id> = stale.iter().map(|held| held.id.clone()).collect();
        let evicted = stale_ids
            .iter()
            .filter_map(|id| locks.remove(id))
            .map(|mut lock| {
                lock.state = LockState::Expired;
                lock
            })
            .collect();

        locks.insert(candidate.id.clone(), candidate.clone());
        Ok(AcquireOutcome::Acquired {
            lock: candidate,
            evicted,
        })
    }

    async fn release(&self, lock_id: &Id) -> Result<Option<Lock>> {
        Ok(self.locks.lock().remove(lock_id).map(|mut lock| {
            lock.state = LockState::Released;
            lock
        }))
    }

    async fn get_lock(&self, lock_id: &Id) -> Result<Option<Lock>> {
        Ok(self.locks.lock().get(lock_id).cloned())
    }

    async fn find_overlapping(&self, key: &ResourceKey) -> Result<Vec<Lock>> {
        let mut found: Vec<Lock> = self
            .locks
            .lock()
            .values()
            .filter(|lock| lock.resource_key.overlaps(key))
            .cloned()
            .collect();
        found.sort_by_key(|lock| lock.acquired_at);
        Ok(found)
    }

    async fn renew(&self, lock_id: &Id, now: DateTime<Utc>) -> Result<Option<Lock>> {
        let mut locks = self.locks.lock();
        Ok(locks.get_mut(lock_id).map(|lock| {
            lock.last_heartbeat_at = now;
            lock.clone()
        }))
    }

    async fn attach_session(&self, session_id: &Id) -> Result<()> {
        self.sessions.lock().insert(session_id.clone());
        Ok(())
    }

    async fn detach_session(&self, session_id: &Id) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    async fn list_reclaimable(
        &self,
        now: DateTime<Utc>,
        max_lifetime: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<Lock>> {
        let sessions = self.sessions.lock();
        let orphaned = |lock: &Lock| {
            lock.session_id
                .as_ref()
                .map(|session| !sessions.contains(session))
                .unwrap_or(false)
        };
        let mut expired: Vec<Lock> = self
            .locks
            .lock()
            .values()
            .filter(|lock| lock.is_reclaimable(now, max_lifetime) || orphaned(lock))
            .cloned()
            .collect();
        expired.sort_by_key(|lock| lock.last_heartbeat_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn reclaim(&self, lock: &Lock) -> Result<bool> {
        let mut locks = self.locks.lock();
        let unchanged = locks
            .get(&lock.id)
            .map(|held| held.last_heartbeat_at == lock.last_heartbeat_at)
            .unwrap_or(false);
        if unchanged {
            locks.remove(&lock.id);
        }
        Ok(unchanged)
    }

    async fn release_session(&self, session_id: &Id) -> Result<Vec<Lock>> {
        let mut locks = self.locks.lock();
        let ids: Vec<Id> = locks
            .values()
            .filter(|lock| lock.session_id.as_ref() == Some(session_id))
            .map(|lock| lock.id.clone())
            .collect();
        Ok(ids
            .iter()
            .filter_map(|id| locks.remove(id))
            .map(|mut lock| {
                lock.state = LockState::Released;
                lock
            })
            .collect())
    }

    async fn list_locks(&self) -> Result<Vec<Lock>> {
        let mut all: Vec<Lock> = self.locks.lock().values().cloned().collect();
        all.sort_by_key(|lock| lock.acquired_at);
        Ok(all)
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn get_branch(&self, name: &str) -> Result<Option<Branch>> {
        Ok(self.branches.read().get(name).cloned())
    }

    async fn list_branches(&self) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self.branches.read().values().cloned().collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(branches)
    }

    async fn insert_branch(&self, branch: Branch) -> Result<bool> {
        let mut branches = self.branches.write();
        if branches.contains_key(&branch.name) {
            return Ok(false);
        }
        branches.insert(branch.name.clone(), branch);
        Ok(true)
    }

    async fn update_head(&self, name: &str, head_commit_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut branches = self.branches.write();
        Ok(match branches.get_mut(name) {
            Some(branch) => {
                branch.head_commit_hash = head_commit_hash.to_string();
                branch.last_modified = now;
                true
            }
            None => false,
        })
    }

    async fn compare_and_set_status(
        &self,
        name: &str,
        expected: BranchStatus,
        status: BranchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut branches = self.branches.write();
        Ok(match branches.get_mut(name) {
            Some(branch) if branch.status == expected => {
                branch.status = status;
                branch.last_modified = now;
                true
            }
            _ => false,
        })
    }

    async fn delete_branch(&self, name: &str) -> Result<bool> {
        Ok(self.branches.write().remove(name).is_some())
    }
}

#[async_trait::async_trait]
impl ProposalStore for MemoryStore {
    async fn get_proposal(&self, id: &Id) -> Result<Option<ChangeProposal>> {
        Ok(self.proposals.read().get(id).cloned())
    }

    async fn list_proposals(&self) -> Result<Vec<ChangeProposal>> {
        let mut proposals: Vec<ChangeProposal> = self.proposals.read().values().cloned().collect();
        proposals.sort_by_key(|p| p.created_at);
        Ok(proposals)
    }

    async fn insert_proposal(&self, proposal: ChangeProposal) -> Result<()> {
        self.proposals.write().insert(proposal.id.clone(), proposal);
        Ok(())
    }

    async fn update_proposal(
        &self,
        proposal: ChangeProposal,
        expected_status: ProposalStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut proposals = self.proposals.write();
        let unchanged = proposals
            .get(&proposal.id)
            .map(|stored| stored.status == expected_status && stored.updated_at == expected_updated_at)
            .unwrap_or(false);
        if unchanged {
            proposals.insert(proposal.id.clone(), proposal);
        }
        Ok(unchanged)
    }
}
