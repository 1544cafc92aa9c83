use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{BranchLockError, Result};
use crate::logic::diff::{merge_object_fields, DiffEngine, Side};
use crate::model::{
    BranchDiff, ChangeOp, CommitInfo, Conflict, MergeResult, MergeStrategy, NewCommit,
    RebaseAbort, Resolution, ResolutionChoice, Resolutions,
};
use crate::store::traits::DocumentStore;

/// Everything needed to write a merge, computed without holding a lock
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub base_commit: String,
    pub source_head: String,
    pub target_head: String,
    /// Writes that turn the target head into the merged state
    pub changes: Vec<ChangeOp>,
    /// Conflicts with the resolution that settled them
    pub resolved: Vec<Conflict>,
}

/// Value a resolution produces for a conflicting resource; `None` deletes it
pub fn resolve_conflict(conflict: &Conflict, resolution: &Resolution) -> Option<Value> {
    let prefer = match resolution.choice {
        ResolutionChoice::UseBase => return conflict.base_version.clone(),
        ResolutionChoice::UseCustom => {
            return resolution
                .custom_value
                .clone()
                .filter(|value| !value.is_null())
        }
        ResolutionChoice::UseSource => Side::Source,
        ResolutionChoice::UseTarget => Side::Target,
    };

    match (
        &conflict.base_version,
        &conflict.source_version,
        &conflict.target_version,
    ) {
        (Some(Value::Object(b)), Some(Value::Object(s)), Some(Value::Object(t))) => {
            Some(Value::Object(merge_object_fields(b, s, t, prefer).0))
        }
        _ => match prefer {
            Side::Source => conflict.source_version.clone(),
            Side::Target => conflict.target_version.clone(),
        },
    }
}

/// Applies merge plans and replays commits through the backing store's
/// commit primitive. Callers hold the BRANCH lock on the written branch.
pub struct MergeExecutor<D: DocumentStore> {
    docs: Arc<D>,
}

impl<D: DocumentStore> MergeExecutor<D> {
    pub fn new(docs: Arc<D>) -> Self {
        Self { docs }
    }

    /// Fails with `ConflictsUnresolved` unless every conflict in `diff` has a
    /// resolution
    pub fn plan(diff: &BranchDiff, resolutions: &Resolutions) -> Result<MergePlan> {
        let unresolved: Vec<String> = diff
            .conflicts()
            .into_iter()
            .filter(|conflict| !resolutions.contains_key(&conflict.resource_id))
            .map(|conflict| conflict.resource_id.clone())
            .collect();
        if !unresolved.is_empty() {
            return Err(BranchLockError::ConflictsUnresolved {
                resource_ids: unresolved,
            });
        }

        let mut changes = Vec::new();
        let mut resolved = Vec::new();
        for resource in &diff.resource_diffs {
            let merged = match &resource.conflict {
                Some(conflict) => {
                    let resolution = &resolutions[&conflict.resource_id];
                    let value = resolve_conflict(conflict, resolution);
                    let mut settled = conflict.clone();
                    settled.resolve(resolution.clone());
                    resolved.push(settled);
                    value
                }
                None => resource.merged_value.clone(),
            };

            if merged.as_ref() != resource.target_value() {
                changes.push(ChangeOp::set(resource.resource_id.clone(), merged));
            }
        }

        Ok(MergePlan {
            base_commit: diff.base_commit.clone(),
            source_head: diff.source_head.clone(),
            target_head: diff.target_head.clone(),
            changes,
            resolved,
        })
    }

    /// Two-parent commit on the target: target head first, then source head
    pub async fn execute_merge(
        &self,
        target_branch: &str,
        plan: MergePlan,
        message: &str,
        author: &str,
    ) -> Result<MergeResult> {
        let parents = vec![plan.target_head.clone(), plan.source_head.clone()];
        let applied_changes = plan.changes.len();
        let hash = self
            .docs
            .commit_changes(
                target_branch,
                NewCommit::new(parents.clone(), plan.changes, message, author),
            )
            .await?;
        info!(
            "Merged {} into '{}' as {} ({} change(s))",
            plan.source_head, target_branch, hash, applied_changes
        );

        Ok(MergeResult {
            success: true,
            strategy: MergeStrategy::Merge,
            merge_commit_hash: Some(hash),
            parent_hashes: parents,
            applied_commits: Vec::new(),
            applied_changes,
            resolved_conflicts: plan.resolved,
            message: message.to_string(),
        })
    }

    /// Single commit on top of the target head carrying the net source effect.
    /// Nothing is written when that effect is empty.
    pub async fn execute_squash(
        &self,
        target_branch: &str,
        plan: MergePlan,
        message: &str,
        author: &str,
    ) -> Result<MergeResult> {
        let parents = vec![plan.target_head.clone()];
        let applied_changes = plan.changes.len();

        let hash = if plan.changes.is_empty() {
            debug!("Squash into '{}' has no net effect; nothing committed", target_branch);
            plan.target_head.clone()
        } else {
            let hash = self
                .docs
                .commit_changes(
                    target_branch,
                    NewCommit::new(parents.clone(), plan.changes, message, author),
                )
                .await?;
            info!(
                "Squashed {} into '{}' as {} ({} change(s))",
                plan.source_head, target_branch, hash, applied_changes
            );
            hash
        };

        Ok(MergeResult {
            success: true,
            strategy: MergeStrategy::Squash,
            merge_commit_hash: Some(hash),
            parent_hashes: parents,
            applied_commits: Vec::new(),
            applied_changes,
            resolved_conflicts: plan.resolved,
            message: message.to_string(),
        })
    }

    /// Replay `commits` (oldest first) onto `onto_head`, writing `branch`.
    ///
    /// Each commit's own change is merged against the running head. The first
    /// conflict without a resolution stops the replay with `RebaseAborted`;
    /// commits already replayed stay recorded and are listed in the abort.
    pub async fn replay(
        &self,
        branch: &str,
        original_head: &str,
        onto_head: &str,
        commits: &[CommitInfo],
        resolutions: &Resolutions,
    ) -> Result<MergeResult> {
        let mut head = onto_head.to_string();
        let mut applied = Vec::new();
        let mut applied_changes = 0;
        let mut resolved = Vec::new();

        for commit in commits {
            let mut changes = Vec::new();
            for resource_id in &commit.changed_resources {
                let base = match commit.first_parent() {
                    Some(parent) => self.docs.resource_at_commit(parent, resource_id).await?,
                    None => None,
                };
                let source = self.docs.resource_at_commit(&commit.hash, resource_id).await?;
                let target = self.docs.resource_at_commit(&head, resource_id).await?;

                let Some(diff) =
                    DiffEngine::<D>::classify(resource_id, base.as_ref(), source.as_ref(), target.as_ref())
                else {
                    continue;
                };

                let merged = match diff.conflict {
                    None => diff.merged_value,
                    Some(mut conflict) => match resolutions.get(resource_id) {
                        Some(resolution) => {
                            let value = resolve_conflict(&conflict, resolution);
                            conflict.resolve(resolution.clone());
                            resolved.push(conflict);
                            value
                        }
                        None => {
                            info!(
                                "Rebase of '{}' stopped at {} on '{}' after {} commit(s)",
                                branch,
                                commit.hash,
                                resource_id,
                                applied.len()
                            );
                            return Err(BranchLockError::RebaseAborted(Box::new(RebaseAbort {
                                branch: branch.to_string(),
                                original_head: original_head.to_string(),
                                applied,
                                blocking_commit: commit.hash.clone(),
                                conflict,
                            })));
                        }
                    },
                };

                if merged != target {
                    changes.push(ChangeOp::set(resource_id.clone(), merged));
                }
            }

            if changes.is_empty() {
                debug!("Skipping {} during rebase of '{}': no net change", commit.hash, branch);
                continue;
            }

            applied_changes += changes.len();
            head = self
                .docs
                .commit_changes(
                    branch,
                    NewCommit::new(
                        vec![head.clone()],
                        changes,
                        commit.message.clone(),
                        commit.author.clone(),
                    ),
                )
                .await?;
            applied.push(head.clone());
        }

        self.docs.set_branch_ref(branch, &head).await?;
        info!(
            "Rebased '{}' onto {}: {} commit(s) replayed, head {}",
            branch,
            onto_head,
            applied.len(),
            head
        );

        Ok(MergeResult {
            success: true,
            strategy: MergeStrategy::Rebase,
            merge_commit_hash: Some(head),
            parent_hashes: vec![onto_head.to_string()],
            applied_commits: applied,
            applied_changes,
            resolved_conflicts: resolved,
            message: format!("Replayed {} commit(s)", commits.len()),
        })
    }
}
