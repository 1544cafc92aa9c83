use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::{BranchLockError, Result};
use crate::logic::branch_state::BranchStateManager;
use crate::logic::diff::DiffEngine;
use crate::logic::heartbeat::HeartbeatMonitor;
use crate::logic::lock_coordinator::{CoordinatorSettings, LockCoordinator};
use crate::logic::merge::{MergeExecutor, MergePlan};
use crate::logic::reaper::{CleanupReaper, ReaperHandle, ReaperSettings};
use crate::model::{
    Branch, BranchDiff, BranchStatus, ChangeProposal, Clock, CommitInfo, Conflict, Id, Lock,
    LockHandle, LockType, MergeResult, MergeStrategy, NewCommit, ProposalQuery, ProposalStatus,
    ProposalUpdate, ProtectionRule, Resolutions, ResourceKey, SystemClock, WriteIntent,
};
use crate::store::branch_cache::BranchCache;
use crate::store::traits::{DocumentStore, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBranchRequest {
    pub name: String,
    /// Fork point; `None` creates a root branch with an empty initial commit
    pub from_branch: Option<String>,
    pub created_by: String,
    #[serde(default)]
    pub protection_rules: Vec<ProtectionRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProposalRequest {
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub strategy: MergeStrategy,
    #[serde(default)]
    pub resolutions: Resolutions,
    /// Holder recorded on the BRANCH lock taken for the write
    pub holder_id: String,
    /// Merging through a proposal: it must be APPROVED and becomes MERGED
    pub proposal_id: Option<Id>,
    pub message: Option<String>,
    pub author: String,
    /// Leave the source branch ACTIVE after the merge
    #[serde(default)]
    pub keep_source: bool,
}

impl MergeRequest {
    pub fn new(
        source_branch: impl Into<String>,
        target_branch: impl Into<String>,
        strategy: MergeStrategy,
        holder_id: impl Into<String>,
    ) -> Self {
        let holder_id = holder_id.into();
        Self {
            source_branch: source_branch.into(),
            target_branch: target_branch.into(),
            strategy,
            resolutions: Resolutions::new(),
            author: holder_id.clone(),
            holder_id,
            proposal_id: None,
            message: None,
            keep_source: false,
        }
    }

    pub fn with_resolutions(mut self, resolutions: Resolutions) -> Self {
        self.resolutions = resolutions;
        self
    }

    pub fn for_proposal(mut self, proposal_id: impl Into<Id>) -> Self {
        self.proposal_id = Some(proposal_id.into());
        self
    }

    pub fn keep_source(mut self) -> Self {
        self.keep_source = true;
        self
    }
}

/// Rewrite `branch` on top of the current head of `onto`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseRequest {
    pub branch: String,
    pub onto: String,
    #[serde(default)]
    pub resolutions: Resolutions,
    pub holder_id: String,
}

/// Entry point for every branch operation. Composes the lock coordinator,
/// branch state manager, diff engine and merge executor over one lock store
/// and one backing document store.
pub struct BranchOperations<S: Store + 'static, D: DocumentStore + 'static> {
    store: Arc<S>,
    docs: Arc<D>,
    coordinator: Arc<LockCoordinator<S>>,
    branches: Arc<BranchStateManager<S>>,
    diff: DiffEngine<D>,
    executor: MergeExecutor<D>,
    heartbeat: HeartbeatMonitor<S>,
    config: AppConfig,
}

impl<S: Store + 'static, D: DocumentStore + 'static> BranchOperations<S, D> {
    pub fn new(store: Arc<S>, docs: Arc<D>, config: AppConfig) -> Self {
        Self::with_clock(store, docs, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, docs: Arc<D>, config: AppConfig, clock: Arc<dyn Clock>) -> Self {
        let coordinator = Arc::new(LockCoordinator::with_clock(
            Arc::clone(&store),
            CoordinatorSettings::from(&config.locks),
            clock,
        ));
        let branches = Arc::new(BranchStateManager::new(
            Arc::clone(&store),
            BranchCache::new(config.cache.branch_state_ttl()),
        ));
        coordinator.register_listener(branches.clone());

        Self {
            diff: DiffEngine::new(Arc::clone(&docs), config.diff.max_ancestor_depth),
            executor: MergeExecutor::new(Arc::clone(&docs)),
            heartbeat: HeartbeatMonitor::new(Arc::clone(&coordinator)),
            store,
            docs,
            coordinator,
            branches,
            config,
        }
    }

    pub fn coordinator(&self) -> &Arc<LockCoordinator<S>> {
        &self.coordinator
    }

    pub fn branch_states(&self) -> &Arc<BranchStateManager<S>> {
        &self.branches
    }

    pub fn diff_engine(&self) -> &DiffEngine<D> {
        &self.diff
    }

    pub fn heartbeat_monitor(&self) -> &HeartbeatMonitor<S> {
        &self.heartbeat
    }

    /// Start the cleanup reaper for this orchestrator's lock store
    pub fn spawn_reaper(&self) -> ReaperHandle {
        CleanupReaper::new(
            Arc::clone(&self.coordinator),
            ReaperSettings::from(&self.config.locks),
        )
        .spawn()
    }

    pub async fn heartbeat(&self, handle: &LockHandle) -> Result<Lock> {
        self.coordinator.heartbeat(handle).await
    }

    // Branches

    pub async fn create_branch(&self, request: CreateBranchRequest) -> Result<Branch> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(BranchLockError::invalid_request("branch name must not be empty"));
        }
        if self.branches.find(&name).await?.is_some() {
            return Err(BranchLockError::BranchExists(name));
        }

        let branch = match &request.from_branch {
            None => {
                let head = self
                    .docs
                    .commit_changes(
                        &name,
                        NewCommit::new(vec![], vec![], "Initial commit", request.created_by.clone()),
                    )
                    .await?;
                Branch::new_root(name.clone(), head, request.created_by.clone())
            }
            Some(parent_name) => {
                let mut parent = self.branches.get(parent_name).await?;
                parent.head_commit_hash = self.head_of(&parent).await?;
                self.docs
                    .create_branch_ref(&name, &parent.head_commit_hash)
                    .await?;
                Branch::new_from_branch(&parent, name.clone(), request.created_by.clone())
            }
        };

        self.branches
            .create(branch.with_protection(request.protection_rules))
            .await
    }

    /// The branch with its head and ahead/behind counts refreshed
    pub async fn get_branch(&self, name: &str) -> Result<Branch> {
        let branch = self.branches.get(name).await?;
        self.annotate(branch).await
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        let mut annotated = Vec::new();
        for branch in self.branches.list().await? {
            annotated.push(self.annotate(branch).await?);
        }
        Ok(annotated)
    }

    /// Archive the branch, or with `purge` remove it and its ref entirely
    pub async fn delete_branch(&self, name: &str, purge: bool) -> Result<()> {
        let branch = self.branches.get(name).await?;
        if let Some(rule) = branch
            .protection_rules
            .iter()
            .find(|rule| !rule.permits_deletion())
        {
            return Err(BranchLockError::ProtectionViolation {
                branch: name.to_string(),
                rule: rule.describe(),
            });
        }

        let open = self
            .store
            .list_proposals()
            .await?
            .into_iter()
            .find(|p| p.status.is_open() && p.references_branch(name));
        if let Some(proposal) = open {
            return Err(BranchLockError::BranchInUse {
                branch: name.to_string(),
                proposal_id: proposal.id,
            });
        }

        if branch.status == BranchStatus::Active {
            self.branches
                .transition(name, BranchStatus::Active, BranchStatus::Archived)
                .await?;
        } else if !branch.status.is_terminal() {
            return Err(BranchLockError::InvalidTransition {
                branch: name.to_string(),
                from: branch.status,
                to: BranchStatus::Archived,
            });
        }

        if purge {
            self.branches.delete(name).await?;
            self.docs.delete_branch_ref(name).await?;
            info!("Purged branch '{}'", name);
        }
        Ok(())
    }

    // Diffs

    pub async fn get_diff(&self, source_branch: &str, target_branch: &str) -> Result<BranchDiff> {
        let source = self.branches.get(source_branch).await?;
        let target = self.branches.get(target_branch).await?;
        let source_head = self.head_of(&source).await?;
        let target_head = self.head_of(&target).await?;

        self.diff
            .compute_diff(source_branch, &source_head, target_branch, &target_head)
            .await
    }

    pub async fn get_conflicts(&self, source_branch: &str, target_branch: &str) -> Result<Vec<Conflict>> {
        let diff = self.get_diff(source_branch, target_branch).await?;
        Ok(diff.conflicts().into_iter().cloned().collect())
    }

    pub async fn find_common_ancestor(&self, left: &str, right: &str) -> Result<String> {
        let left_head = self.head_of(&self.branches.get(left).await?).await?;
        let right_head = self.head_of(&self.branches.get(right).await?).await?;
        self.diff
            .find_labeled_ancestor(left, &left_head, right, &right_head)
            .await
    }

    /// Every commit reachable from the branch head, head first
    pub async fn get_commit_history(&self, branch: &str) -> Result<Vec<CommitInfo>> {
        let branch = self.branches.get(branch).await?;
        Ok(self.docs.commit_history(&branch.name).await?)
    }

    // Proposals

    pub async fn create_proposal(&self, request: CreateProposalRequest) -> Result<ChangeProposal> {
        if request.source_branch == request.target_branch {
            return Err(BranchLockError::invalid_request(
                "a proposal needs two different branches",
            ));
        }
        if request.title.trim().is_empty() {
            return Err(BranchLockError::invalid_request("proposal title must not be empty"));
        }
        let source = self.branches.get(&request.source_branch).await?;
        if source.status.is_terminal() {
            return Err(BranchLockError::invalid_request(format!(
                "source branch '{}' is {}",
                source.name,
                source.status.as_str()
            )));
        }

        let mut proposal = ChangeProposal::new(
            request.title,
            request.description,
            request.source_branch,
            request.target_branch,
            request.created_by,
        );
        self.refresh_proposal_diff(&mut proposal).await?;
        self.store.insert_proposal(proposal.clone()).await?;
        info!(
            "Opened proposal {} ({} -> {})",
            proposal.id, proposal.source_branch, proposal.target_branch
        );
        Ok(proposal)
    }

    pub async fn get_proposal(&self, id: &Id) -> Result<ChangeProposal> {
        self.store
            .get_proposal(id)
            .await?
            .ok_or_else(|| BranchLockError::ProposalNotFound(id.clone()))
    }

    pub async fn list_proposals(&self, query: &ProposalQuery) -> Result<Vec<ChangeProposal>> {
        Ok(self
            .store
            .list_proposals()
            .await?
            .into_iter()
            .filter(|proposal| query.matches(proposal))
            .collect())
    }

    /// Apply a partial update. Concurrent updates are serialized by a version
    /// check on the stored proposal; a lost race re-reads and re-applies.
    pub async fn update_proposal(&self, id: &Id, update: ProposalUpdate) -> Result<ChangeProposal> {
        let mut attempt = 1;
        loop {
            let current = self.get_proposal(id).await?;
            let updated = self.apply_update(current.clone(), &update).await?;
            if self
                .store
                .update_proposal(updated.clone(), current.status, current.updated_at)
                .await?
            {
                if updated.status != current.status {
                    info!(
                        "Proposal {} {} -> {}",
                        id,
                        current.status.as_str(),
                        updated.status.as_str()
                    );
                }
                return Ok(updated);
            }
            if attempt >= self.config.retry.max_attempts {
                return Err(BranchLockError::ProposalChanged { id: id.clone() });
            }
            debug!("Proposal {} changed during update; re-reading", id);
            attempt += 1;
        }
    }

    async fn apply_update(&self, mut proposal: ChangeProposal, update: &ProposalUpdate) -> Result<ChangeProposal> {
        let id = proposal.id.clone();
        if !proposal.status.is_open() {
            return Err(BranchLockError::InvalidProposalTransition {
                id,
                from: proposal.status,
                to: update.status.unwrap_or(proposal.status),
            });
        }

        if let Some(title) = &update.title {
            proposal.title = title.clone();
        }
        if let Some(description) = &update.description {
            proposal.description = Some(description.clone());
        }
        if let Some(resolutions) = &update.resolutions {
            proposal.resolutions.extend(resolutions.clone());
            for conflict in &mut proposal.conflicts {
                if let Some(resolution) = proposal.resolutions.get(&conflict.resource_id) {
                    conflict.resolve(resolution.clone());
                }
            }
        }
        if let Some(approval) = &update.approval {
            if !matches!(proposal.status, ProposalStatus::Review | ProposalStatus::Approved) {
                return Err(BranchLockError::invalid_request(format!(
                    "proposal {} is {} and cannot be approved",
                    id,
                    proposal.status.as_str()
                )));
            }
            proposal.approvals.push(approval.clone());
        }

        if let Some(next) = update.status.filter(|next| *next != proposal.status) {
            if !proposal.status.can_transition_to(next) {
                return Err(BranchLockError::InvalidProposalTransition {
                    id,
                    from: proposal.status,
                    to: next,
                });
            }
            match next {
                ProposalStatus::Approved => {
                    let required = self.required_approvals(&proposal.target_branch).await?;
                    if proposal.approval_count() < required {
                        return Err(BranchLockError::invalid_request(format!(
                            "proposal {} needs {} approval(s), has {}",
                            id,
                            required,
                            proposal.approval_count()
                        )));
                    }
                }
                ProposalStatus::Review => self.refresh_proposal_diff(&mut proposal).await?,
                _ => {}
            }
            proposal.status = next;
        }

        proposal.touch();
        Ok(proposal)
    }

    // Merges

    /// Merge, squash or replay `source_branch` into `target_branch`. Lock
    /// contention and a target head that moved during planning are retried
    /// with backoff.
    pub async fn merge_branch(&self, request: MergeRequest) -> Result<MergeResult> {
        let mut attempt = 1;
        loop {
            match self.try_merge(&request).await {
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    let backoff = self.config.retry.backoff(attempt);
                    debug!(
                        "Merge {} -> {} attempt {} failed ({}); retrying in {:?}",
                        request.source_branch, request.target_branch, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_merge(&self, request: &MergeRequest) -> Result<MergeResult> {
        if request.source_branch == request.target_branch {
            return Err(BranchLockError::invalid_request("cannot merge a branch into itself"));
        }

        let source = self.branches.get(&request.source_branch).await?;
        if source.status.is_terminal() {
            return Err(BranchLockError::InvalidTransition {
                branch: source.name,
                from: source.status,
                to: BranchStatus::Merged,
            });
        }

        // Re-checked and claimed under the lock; this read only plans the merge
        let proposal = match &request.proposal_id {
            Some(id) => Some(
                self.approved_proposal(id, &request.source_branch, &request.target_branch)
                    .await?,
            ),
            None => None,
        };
        let intent = match &proposal {
            Some(p) => WriteIntent::ProposalMerge {
                approvals: p.approval_count(),
            },
            None => WriteIntent::DirectWrite,
        };
        let mut resolutions = proposal
            .as_ref()
            .map(|p| p.resolutions.clone())
            .unwrap_or_default();
        resolutions.extend(request.resolutions.clone());

        self.branches
            .check_write_allowed(&request.target_branch, intent)
            .await?;

        // Everything up to here runs without a lock
        let diff = self
            .get_diff(&request.source_branch, &request.target_branch)
            .await?;
        let message = request.message.clone().unwrap_or_else(|| {
            format!(
                "Merge '{}' into '{}'",
                request.source_branch, request.target_branch
            )
        });

        let (result, claimed) = if diff.is_up_to_date() {
            info!(
                "'{}' is already contained in '{}'",
                request.source_branch, request.target_branch
            );
            let claimed = match &request.proposal_id {
                Some(id) => Some(
                    self.claim_proposal(id, &request.source_branch, &request.target_branch)
                        .await?,
                ),
                None => None,
            };
            let result = MergeResult {
                success: true,
                strategy: request.strategy,
                merge_commit_hash: Some(diff.target_head.clone()),
                parent_hashes: Vec::new(),
                applied_commits: Vec::new(),
                applied_changes: 0,
                resolved_conflicts: Vec::new(),
                message: "Already up to date".to_string(),
            };
            (result, claimed)
        } else {
            let step = match request.strategy {
                MergeStrategy::Merge => WriteStep::Merge(MergeExecutor::<D>::plan(&diff, &resolutions)?),
                MergeStrategy::Squash => WriteStep::Squash(MergeExecutor::<D>::plan(&diff, &resolutions)?),
                MergeStrategy::Rebase => WriteStep::Replay {
                    original_head: diff.target_head.clone(),
                    onto_head: diff.target_head.clone(),
                    commits: self
                        .diff
                        .commits_since(&diff.source_head, &diff.base_commit)
                        .await?,
                },
            };
            self.write_branch(
                &request.target_branch,
                &request.holder_id,
                intent,
                &diff.target_head,
                step,
                &resolutions,
                &message,
                &request.author,
                request
                    .proposal_id
                    .as_ref()
                    .map(|id| (id, request.source_branch.as_str())),
            )
            .await?
        };

        self.finish_merge(request, claimed, &result).await;
        Ok(result)
    }

    /// Replay the commits `branch` has since it diverged from `onto` on top of
    /// `onto`'s head
    pub async fn rebase_branch(&self, request: RebaseRequest) -> Result<MergeResult> {
        let mut attempt = 1;
        loop {
            match self.try_rebase(&request).await {
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    let backoff = self.config.retry.backoff(attempt);
                    debug!(
                        "Rebase of '{}' attempt {} failed ({}); retrying in {:?}",
                        request.branch, attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_rebase(&self, request: &RebaseRequest) -> Result<MergeResult> {
        if request.branch == request.onto {
            return Err(BranchLockError::invalid_request("cannot rebase a branch onto itself"));
        }
        let branch = self.branches.get(&request.branch).await?;
        let onto = self.branches.get(&request.onto).await?;
        let branch_head = self.head_of(&branch).await?;
        let onto_head = self.head_of(&onto).await?;

        let base = self
            .diff
            .find_labeled_ancestor(&request.branch, &branch_head, &request.onto, &onto_head)
            .await?;
        if base == onto_head {
            return Ok(MergeResult {
                success: true,
                strategy: MergeStrategy::Rebase,
                merge_commit_hash: Some(branch_head),
                parent_hashes: Vec::new(),
                applied_commits: Vec::new(),
                applied_changes: 0,
                resolved_conflicts: Vec::new(),
                message: "Already up to date".to_string(),
            });
        }

        let commits = self.diff.commits_since(&branch_head, &base).await?;
        self.write_branch(
            &request.branch,
            &request.holder_id,
            WriteIntent::DirectWrite,
            &branch_head,
            WriteStep::Replay {
                original_head: branch_head.clone(),
                onto_head,
                commits,
            },
            &request.resolutions,
            &format!("Rebase '{}' onto '{}'", request.branch, request.onto),
            &request.holder_id,
            None,
        )
        .await
        .map(|(result, _)| result)
    }

    /// Point `branch` at an existing commit, e.g. to roll back a partial rebase
    pub async fn reset_branch_head(&self, branch: &str, commit: &str, holder_id: &str) -> Result<Branch> {
        if self.docs.get_commit(commit).await?.is_none() {
            return Err(BranchLockError::invalid_request(format!(
                "commit {} does not exist",
                commit
            )));
        }

        let handle = self.begin_write(branch, holder_id, WriteIntent::Maintenance).await?;
        let outcome = self.docs.set_branch_ref(branch, commit).await;
        let ended = self.end_write(&handle).await;
        outcome?;
        info!("Reset '{}' to {}", branch, commit);
        ended
    }

    /// Take the exclusive BRANCH lock and move the branch to LOCKED_FOR_WRITE.
    /// The caller writes through the backing store, heartbeats the handle and
    /// finishes with [`Self::end_write`].
    pub async fn begin_write(&self, branch: &str, holder_id: &str, intent: WriteIntent) -> Result<LockHandle> {
        let request = self
            .coordinator
            .request(ResourceKey::branch(branch), LockType::Migration, holder_id)
            .with_acquire_timeout(self.config.locks.acquire_timeout());
        let handle = self.coordinator.acquire(request).await?;

        if let Err(e) = self.branches.lock_for_write(branch, &handle, intent).await {
            self.release_quietly(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Record the branch's current head and release the write lock. The
    /// release callback returns the branch to ACTIVE.
    pub async fn end_write(&self, handle: &LockHandle) -> Result<Branch> {
        let branch = handle.resource_key.branch_name().to_string();
        let synced = self.sync_head(&branch).await;
        self.release_quietly(handle).await;
        synced?;
        self.get_branch(&branch).await
    }

    // Internals

    /// Apply `step` to `branch` under its exclusive lock. With `claim` set to a
    /// proposal id and its source branch, the proposal is claimed once the lock
    /// is held and handed back to APPROVED if the step fails.
    #[allow(clippy::too_many_arguments)]
    async fn write_branch(
        &self,
        branch: &str,
        holder_id: &str,
        intent: WriteIntent,
        expected_head: &str,
        step: WriteStep,
        resolutions: &Resolutions,
        message: &str,
        author: &str,
        claim: Option<(&Id, &str)>,
    ) -> Result<(MergeResult, Option<ChangeProposal>)> {
        let handle = self.begin_write(branch, holder_id, intent).await?;

        let outcome = async {
            let current = self.head_of(&self.branches.get(branch).await?).await?;
            if current != expected_head {
                return Err(BranchLockError::HeadMoved {
                    branch: branch.to_string(),
                });
            }
            let claimed = match claim {
                Some((id, source)) => Some(self.claim_proposal(id, source, branch).await?),
                None => None,
            };

            let work = async {
                match step {
                    WriteStep::Merge(plan) => {
                        self.executor.execute_merge(branch, plan, message, author).await
                    }
                    WriteStep::Squash(plan) => {
                        self.executor.execute_squash(branch, plan, message, author).await
                    }
                    WriteStep::Replay {
                        original_head,
                        onto_head,
                        commits,
                    } => {
                        self.executor
                            .replay(branch, &original_head, &onto_head, &commits, resolutions)
                            .await
                    }
                }
            };
            match self.while_held(&handle, work).await {
                Ok(result) => Ok((result, claimed)),
                Err(e) => {
                    if let Some(claimed) = &claimed {
                        self.unclaim_proposal(claimed).await;
                    }
                    Err(e)
                }
            }
        }
        .await;

        let synced = self.sync_head(branch).await;
        self.release_quietly(&handle).await;
        let result = outcome?;
        synced?;
        Ok(result)
    }

    /// Run `work` while renewing `handle`; `LockLost` if the lock disappears first
    async fn while_held<T>(&self, handle: &LockHandle, work: impl Future<Output = Result<T>>) -> Result<T> {
        let keep_alive = self.heartbeat.keep_alive(handle.clone());
        let lost = keep_alive.lost();
        let outcome = tokio::select! {
            biased;
            result = work => result,
            _ = lost.cancelled() => Err(BranchLockError::LockLost {
                lock_id: handle.lock_id.clone(),
                key: handle.resource_key.to_string(),
            }),
        };
        keep_alive.stop().await;
        outcome
    }

    async fn release_quietly(&self, handle: &LockHandle) {
        if let Err(e) = self.coordinator.release(handle).await {
            warn!(
                "Failed to release lock {} on {}; it expires after {}s: {}",
                handle.lock_id, handle.resource_key, handle.ttl_seconds, e
            );
        }
    }

    async fn finish_merge(&self, request: &MergeRequest, claimed: Option<ChangeProposal>, result: &MergeResult) {
        if !request.keep_source {
            if let Err(e) = self
                .branches
                .transition(&request.source_branch, BranchStatus::Active, BranchStatus::Merged)
                .await
            {
                warn!(
                    "Merge into '{}' succeeded but '{}' could not be marked MERGED: {}",
                    request.target_branch, request.source_branch, e
                );
            }
        }

        let Some(claimed) = claimed else {
            return;
        };
        let mut merged = claimed.clone();
        merged.merge_commit_hash = result.merge_commit_hash.clone();
        merged.touch();
        match self
            .store
            .update_proposal(merged, ProposalStatus::Merged, claimed.updated_at)
            .await
        {
            Ok(true) => info!(
                "Proposal {} merged as {:?}",
                claimed.id, result.merge_commit_hash
            ),
            Ok(false) => warn!(
                "Proposal {} changed after it was claimed; merge commit not recorded",
                claimed.id
            ),
            Err(e) => warn!(
                "Proposal {} is MERGED but its merge commit was not recorded: {}",
                claimed.id, e
            ),
        }
    }

    /// Move an APPROVED proposal to MERGED, failing if it is no longer
    /// approved. Only one merge can win the claim.
    async fn claim_proposal(&self, id: &Id, source_branch: &str, target_branch: &str) -> Result<ChangeProposal> {
        let mut attempt = 1;
        loop {
            let current = self.approved_proposal(id, source_branch, target_branch).await?;
            let mut claimed = current.clone();
            claimed.status = ProposalStatus::Merged;
            claimed.touch();
            if self
                .store
                .update_proposal(claimed.clone(), ProposalStatus::Approved, current.updated_at)
                .await?
            {
                debug!("Claimed proposal {} for merge into '{}'", id, target_branch);
                return Ok(claimed);
            }
            if attempt >= self.config.retry.max_attempts {
                return Err(BranchLockError::ProposalChanged { id: id.clone() });
            }
            attempt += 1;
        }
    }

    async fn unclaim_proposal(&self, claimed: &ChangeProposal) {
        let mut restored = claimed.clone();
        restored.status = ProposalStatus::Approved;
        restored.touch();
        match self
            .store
            .update_proposal(restored, ProposalStatus::Merged, claimed.updated_at)
            .await
        {
            Ok(true) => debug!("Proposal {} returned to APPROVED", claimed.id),
            Ok(false) => warn!("Proposal {} changed while claimed; left as is", claimed.id),
            Err(e) => warn!(
                "Proposal {} stays MERGED after a failed merge: {}",
                claimed.id, e
            ),
        }
    }

    async fn approved_proposal(&self, id: &Id, source_branch: &str, target_branch: &str) -> Result<ChangeProposal> {
        let proposal = self.get_proposal(id).await?;
        if proposal.source_branch != source_branch || proposal.target_branch != target_branch {
            return Err(BranchLockError::invalid_request(format!(
                "proposal {} covers {} -> {}",
                id, proposal.source_branch, proposal.target_branch
            )));
        }
        if proposal.status != ProposalStatus::Approved {
            return Err(BranchLockError::InvalidProposalTransition {
                id: id.clone(),
                from: proposal.status,
                to: ProposalStatus::Merged,
            });
        }
        Ok(proposal)
    }

    async fn required_approvals(&self, target_branch: &str) -> Result<usize> {
        let target = self.branches.get(target_branch).await?;
        Ok(target
            .protection_rules
            .iter()
            .filter_map(|rule| match rule {
                ProtectionRule::RequireApprovedProposal { min_approvals } => Some(*min_approvals),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            .max(1))
    }

    async fn refresh_proposal_diff(&self, proposal: &mut ChangeProposal) -> Result<()> {
        let diff = self
            .get_diff(&proposal.source_branch, &proposal.target_branch)
            .await?;
        proposal.diff_stats = diff.stats.clone();
        proposal.conflicts = diff.conflicts().into_iter().cloned().collect();
        for conflict in &mut proposal.conflicts {
            if let Some(resolution) = proposal.resolutions.get(&conflict.resource_id) {
                conflict.resolve(resolution.clone());
            }
        }
        Ok(())
    }

    /// Head according to the backing store, which owns commit identity
    async fn head_of(&self, branch: &Branch) -> Result<String> {
        Ok(self
            .docs
            .branch_head(&branch.name)
            .await?
            .unwrap_or_else(|| branch.head_commit_hash.clone()))
    }

    async fn sync_head(&self, name: &str) -> Result<()> {
        if let Some(head) = self.docs.branch_head(name).await? {
            self.branches.record_head(name, &head).await?;
        }
        Ok(())
    }

    async fn annotate(&self, mut branch: Branch) -> Result<Branch> {
        branch.head_commit_hash = self.head_of(&branch).await?;
        branch.commits_ahead = 0;
        branch.commits_behind = 0;
        branch.has_pending_changes = false;

        let Some(parent_name) = branch.from_branch.clone() else {
            return Ok(branch);
        };
        let Some(parent) = self.branches.find(&parent_name).await? else {
            return Ok(branch);
        };
        let parent_head = self.head_of(&parent).await?;

        let base = match self
            .diff
            .find_labeled_ancestor(&branch.name, &branch.head_commit_hash, &parent_name, &parent_head)
            .await
        {
            Ok(base) => base,
            Err(BranchLockError::AncestorNotFound { reason, .. }) => {
                debug!(
                    "No ahead/behind for '{}' against '{}': {}",
                    branch.name, parent_name, reason
                );
                return Ok(branch);
            }
            Err(e) => return Err(e),
        };

        let ahead = self.diff.commits_since(&branch.head_commit_hash, &base).await?;
        let behind = self.diff.commits_since(&parent_head, &base).await?;
        branch.commits_ahead = u32::try_from(ahead.len()).unwrap_or(u32::MAX);
        branch.commits_behind = u32::try_from(behind.len()).unwrap_or(u32::MAX);
        branch.has_pending_changes = ahead.iter().any(|c| !c.changed_resources.is_empty());
        Ok(branch)
    }
}

/// The commit-apply step run under the branch lock
enum WriteStep {
    Merge(MergePlan),
    Squash(MergePlan),
    Replay {
        original_head: String,
        onto_head: String,
        commits: Vec<CommitInfo>,
    },
}
