use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    Branch, BranchStatus, ChangeProposal, CommitInfo, Id, Lock, NewCommit, ProposalStatus,
    ResourceKey,
};

/// Result of an atomic check-and-insert
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The candidate was stored. `evicted` lists stale conflicting locks
    /// removed in the same step.
    Acquired { lock: Lock, evicted: Vec<Lock> },
    /// A live conflicting lock blocks the candidate
    Blocked(Lock),
}

/// Durable lock table. The only cross-process synchronization point.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Check for conflicting locks and insert `candidate` as one indivisible step.
    /// Conflicting locks whose heartbeat has expired at `now` are evicted.
    async fn try_acquire(&self, candidate: Lock, now: DateTime<Utc>) -> Result<AcquireOutcome>;
    /// Remove a lock, returning it if it existed
    async fn release(&self, lock_id: &Id) -> Result<Option<Lock>>;
    async fn get_lock(&self, lock_id: &Id) -> Result<Option<Lock>>;
    /// Every active lock whose key overlaps `key`
    async fn find_overlapping(&self, key: &ResourceKey) -> Result<Vec<Lock>>;
    /// Record a heartbeat; `None` if the lock no longer exists
    async fn renew(&self, lock_id: &Id, now: DateTime<Utc>) -> Result<Option<Lock>>;
    /// Mark a session live for as long as this store instance holds it.
    /// Locks taken under a session that is no longer attached anywhere are
    /// reclaimable whatever their heartbeat says.
    async fn attach_session(&self, session_id: &Id) -> Result<()>;
    async fn detach_session(&self, session_id: &Id) -> Result<()>;
    /// Up to `limit` locks past their TTL or maximum lifetime, or held by a
    /// detached session, oldest heartbeat first
    async fn list_reclaimable(
        &self,
        now: DateTime<Utc>,
        max_lifetime: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<Lock>>;
    /// Delete `lock` only if its heartbeat still equals the scanned value
    async fn reclaim(&self, lock: &Lock) -> Result<bool>;
    /// Remove every lock held under a session
    async fn release_session(&self, session_id: &Id) -> Result<Vec<Lock>>;
    async fn list_locks(&self) -> Result<Vec<Lock>>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    async fn get_branch(&self, name: &str) -> Result<Option<Branch>>;
    async fn list_branches(&self) -> Result<Vec<Branch>>;
    /// Insert a new branch; `false` if the name is taken
    async fn insert_branch(&self, branch: Branch) -> Result<bool>;
    /// Move the recorded head without touching the status
    async fn update_head(&self, name: &str, head_commit_hash: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Set `status` only if the stored status equals `expected`
    async fn compare_and_set_status(
        &self,
        name: &str,
        expected: BranchStatus,
        status: BranchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    async fn delete_branch(&self, name: &str) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait ProposalStore: Send + Sync {
    async fn get_proposal(&self, id: &Id) -> Result<Option<ChangeProposal>>;
    async fn list_proposals(&self) -> Result<Vec<ChangeProposal>>;
    async fn insert_proposal(&self, proposal: ChangeProposal) -> Result<()>;
    /// Replace a proposal only while the stored status and `updated_at` still
    /// equal the expected values. `false` when either moved or the proposal is gone.
    async fn update_proposal(
        &self,
        proposal: ChangeProposal,
        expected_status: ProposalStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool>;
}

pub trait Store: LockStore + BranchStore + ProposalStore + Send + Sync {}
impl<T: LockStore + BranchStore + ProposalStore + Send + Sync> Store for T {}

/// The backing document/graph store. Commit identity and content live there;
/// this crate only orchestrates its commit primitive.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Commits reachable from the branch head, head first
    async fn commit_history(&self, branch: &str) -> Result<Vec<CommitInfo>>;
    async fn get_commit(&self, hash: &str) -> Result<Option<CommitInfo>>;
    async fn resource_at_commit(&self, hash: &str, resource_id: &str) -> Result<Option<Value>>;
    /// Create a commit on top of `commit.parent_hashes[0]`'s content and point
    /// `branch` at it
    async fn commit_changes(&self, branch: &str, commit: NewCommit) -> Result<String>;
    async fn branch_head(&self, branch: &str) -> Result<Option<String>>;
    async fn create_branch_ref(&self, branch: &str, at_commit: &str) -> Result<()>;
    async fn set_branch_ref(&self, branch: &str, commit: &str) -> Result<()>;
    async fn delete_branch_ref(&self, branch: &str) -> Result<bool>;
}
