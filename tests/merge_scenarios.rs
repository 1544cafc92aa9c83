use branchlock::logic::{
    BranchOperations, CreateBranchRequest, CreateProposalRequest, MergeRequest, RebaseRequest,
};
use branchlock::model::{
    Approval, BranchStatus, ChangeOp, ChangeProposal, ConflictType, MergeStrategy, ProposalQuery,
    ProposalStatus, ProposalUpdate, Resolution, Resolutions, WriteIntent,
};
use branchlock::store::{DocumentStore, MemoryDocumentStore, MemoryStore};
use branchlock::{AppConfig, BranchLockError};
use serde_json::{json, Value};
use std::sync::Arc;

// Orchestrator over in-memory stores with helpers for writing documents
struct Repo {
    ops: BranchOperations<MemoryStore, MemoryDocumentStore>,
    docs: Arc<MemoryDocumentStore>,
}

impl Repo {
    async fn new() -> Self {
        let docs = Arc::new(MemoryDocumentStore::new());
        let ops = BranchOperations::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&docs),
            AppConfig::default(),
        );
        let repo = Self { ops, docs };
        repo.ops
            .create_branch(CreateBranchRequest {
                name: "main".into(),
                from_branch: None,
                created_by: "alice".into(),
                protection_rules: vec![],
            })
            .await
            .unwrap();
        repo
    }

    async fn fork(&self, name: &str, from: &str) {
        self.ops
            .create_branch(CreateBranchRequest {
                name: name.into(),
                from_branch: Some(from.into()),
                created_by: "bob".into(),
                protection_rules: vec![],
            })
            .await
            .unwrap();
    }

    /// One commit on `branch` setting `id`, made under the branch write lock
    async fn put(&self, branch: &str, id: &str, value: Value) -> String {
        let handle = self
            .ops
            .begin_write(branch, "editor", WriteIntent::DirectWrite)
            .await
            .unwrap();
        let head = self
            .docs
            .write(branch, vec![ChangeOp::set(id, Some(value))], "edit", "editor")
            .await
            .unwrap();
        self.ops.end_write(&handle).await.unwrap();
        head
    }

    /// Open a proposal and take it through review to APPROVED
    async fn approved_proposal(&self, source: &str, target: &str) -> ChangeProposal {
        let proposal = self
            .ops
            .create_proposal(CreateProposalRequest {
                title: format!("{} into {}", source, target),
                description: None,
                source_branch: source.into(),
                target_branch: target.into(),
                created_by: "bob".into(),
            })
            .await
            .unwrap();
        for update in [
            ProposalUpdate {
                status: Some(ProposalStatus::Review),
                ..Default::default()
            },
            ProposalUpdate {
                status: Some(ProposalStatus::Approved),
                approval: Some(Approval::new("carol", None)),
                ..Default::default()
            },
        ] {
            self.ops.update_proposal(&proposal.id, update).await.unwrap();
        }
        self.ops.get_proposal(&proposal.id).await.unwrap()
    }

    async fn read(&self, branch: &str, id: &str) -> Option<Value> {
        let head = self.ops.get_branch(branch).await.unwrap().head_commit_hash;
        self.docs.resource_at_commit(&head, id).await.unwrap()
    }
}

fn merge(source: &str, target: &str, strategy: MergeStrategy) -> MergeRequest {
    MergeRequest::new(source, target, strategy, "merger")
}

#[tokio::test]
async fn test_disjoint_field_edits_merge_cleanly() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1, "y": 1})).await;
    repo.fork("feature", "main").await;
    repo.put("feature", "R", json!({"x": 2, "y": 1})).await;
    repo.put("main", "R", json!({"x": 1, "y": 5})).await;

    assert!(repo.ops.get_conflicts("feature", "main").await.unwrap().is_empty());

    let result = repo
        .ops
        .merge_branch(merge("feature", "main", MergeStrategy::Merge))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(repo.read("main", "R").await, Some(json!({"x": 2, "y": 5})));
}

#[tokio::test]
async fn test_same_field_conflict_needs_resolution() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1})).await;
    repo.fork("feature", "main").await;
    repo.put("feature", "R", json!({"x": 3})).await;
    repo.put("main", "R", json!({"x": 4})).await;

    let conflicts = repo.ops.get_conflicts("feature", "main").await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::ModifyModify);
    assert_eq!(conflicts[0].conflicting_fields, vec!["x".to_string()]);

    let main_before = repo.ops.get_branch("main").await.unwrap().head_commit_hash;
    match repo
        .ops
        .merge_branch(merge("feature", "main", MergeStrategy::Merge))
        .await
    {
        Err(BranchLockError::ConflictsUnresolved { resource_ids }) => {
            assert_eq!(resource_ids, vec!["R".to_string()])
        }
        other => panic!("expected unresolved conflicts, got {:?}", other),
    }
    let main = repo.ops.get_branch("main").await.unwrap();
    assert_eq!(main.head_commit_hash, main_before);
    assert_eq!(main.status, BranchStatus::Active);

    let resolutions = Resolutions::from([("R".to_string(), Resolution::use_source())]);
    repo.ops
        .merge_branch(merge("feature", "main", MergeStrategy::Merge).with_resolutions(resolutions))
        .await
        .unwrap();
    assert_eq!(repo.read("main", "R").await, Some(json!({"x": 3})));
}

#[tokio::test]
async fn test_delete_against_modify_is_reported() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1})).await;
    repo.fork("feature", "main").await;

    let handle = repo
        .ops
        .begin_write("feature", "editor", WriteIntent::DirectWrite)
        .await
        .unwrap();
    repo.docs
        .write("feature", vec![ChangeOp::set("R", None)], "drop R", "editor")
        .await
        .unwrap();
    repo.ops.end_write(&handle).await.unwrap();
    repo.put("main", "R", json!({"x": 2})).await;

    let conflicts = repo.ops.get_conflicts("feature", "main").await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::DeleteModify);
}

#[tokio::test]
async fn test_merge_and_squash_commit_parents() {
    let repo = Repo::new().await;
    repo.fork("a", "main").await;
    repo.fork("b", "main").await;
    repo.put("a", "A", json!(1)).await;
    repo.put("a", "A2", json!(1)).await;
    repo.put("b", "B", json!(1)).await;

    let main_head = repo.ops.get_branch("main").await.unwrap().head_commit_hash;
    let a_head = repo.ops.get_branch("a").await.unwrap().head_commit_hash;
    let merged = repo
        .ops
        .merge_branch(merge("a", "main", MergeStrategy::Merge))
        .await
        .unwrap();
    let merge_commit = repo
        .docs
        .get_commit(merged.merge_commit_hash.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merge_commit.parent_hashes, vec![main_head, a_head]);
    assert!(merge_commit.is_merge());

    let main_head = repo.ops.get_branch("main").await.unwrap().head_commit_hash;
    let squashed = repo
        .ops
        .merge_branch(merge("b", "main", MergeStrategy::Squash))
        .await
        .unwrap();
    let squash_commit = repo
        .docs
        .get_commit(squashed.merge_commit_hash.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(squash_commit.parent_hashes, vec![main_head]);
    assert_eq!(repo.read("main", "A").await, Some(json!(1)));
    assert_eq!(repo.read("main", "B").await, Some(json!(1)));
    assert_eq!(repo.ops.get_branch("a").await.unwrap().status, BranchStatus::Merged);
    assert_eq!(repo.ops.get_branch("b").await.unwrap().status, BranchStatus::Merged);
}

#[tokio::test]
async fn test_rebase_replays_onto_new_base() {
    let repo = Repo::new().await;
    repo.fork("feature", "main").await;
    repo.put("feature", "F", json!("feature")).await;
    repo.put("main", "M", json!("main")).await;

    let result = repo
        .ops
        .rebase_branch(RebaseRequest {
            branch: "feature".into(),
            onto: "main".into(),
            resolutions: Resolutions::new(),
            holder_id: "rebaser".into(),
        })
        .await
        .unwrap();
    assert_eq!(result.applied_commits.len(), 1);

    let feature = repo.ops.get_branch("feature").await.unwrap();
    assert_eq!(feature.commits_behind, 0);
    assert_eq!(feature.commits_ahead, 1);
    assert_eq!(repo.read("feature", "M").await, Some(json!("main")));
    assert_eq!(repo.read("feature", "F").await, Some(json!("feature")));
}

#[tokio::test]
async fn test_rebase_abort_reports_prefix_and_can_be_rolled_back() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1})).await;
    repo.fork("feature", "main").await;
    repo.put("feature", "S", json!(1)).await;
    let blocking = repo.put("feature", "R", json!({"x": 3})).await;
    repo.put("main", "R", json!({"x": 4})).await;
    let original = repo.ops.get_branch("feature").await.unwrap().head_commit_hash;

    let abort = match repo
        .ops
        .rebase_branch(RebaseRequest {
            branch: "feature".into(),
            onto: "main".into(),
            resolutions: Resolutions::new(),
            holder_id: "rebaser".into(),
        })
        .await
    {
        Err(BranchLockError::RebaseAborted(abort)) => abort,
        other => panic!("expected rebase abort, got {:?}", other),
    };
    assert_eq!(abort.original_head, original);
    assert_eq!(abort.applied.len(), 1);
    assert_eq!(abort.blocking_commit, blocking);
    assert_eq!(abort.conflict.resource_id, "R");

    let feature = repo.ops.get_branch("feature").await.unwrap();
    assert_eq!(feature.status, BranchStatus::Active);
    assert_eq!(feature.head_commit_hash, abort.applied[0]);

    let restored = repo
        .ops
        .reset_branch_head("feature", &abort.original_head, "rebaser")
        .await
        .unwrap();
    assert_eq!(restored.head_commit_hash, original);
    assert_eq!(repo.read("feature", "R").await, Some(json!({"x": 3})));
}

#[tokio::test]
async fn test_rebase_strategy_merge_replays_source_commits_onto_target() {
    let repo = Repo::new().await;
    repo.fork("feature", "main").await;
    repo.put("feature", "F", json!("f")).await;
    repo.put("feature", "G", json!("g")).await;
    let main_before = repo.put("main", "M", json!("m")).await;

    let result = repo
        .ops
        .merge_branch(merge("feature", "main", MergeStrategy::Rebase))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.strategy, MergeStrategy::Rebase);
    assert_eq!(result.applied_commits.len(), 2);

    let main = repo.ops.get_branch("main").await.unwrap();
    assert_eq!(main.status, BranchStatus::Active);
    assert_eq!(Some(&main.head_commit_hash), result.applied_commits.last());
    assert_ne!(main.head_commit_hash, main_before);
    assert_eq!(repo.read("main", "F").await, Some(json!("f")));
    assert_eq!(repo.read("main", "G").await, Some(json!("g")));
    assert_eq!(repo.read("main", "M").await, Some(json!("m")));
    assert_eq!(repo.ops.get_branch("feature").await.unwrap().status, BranchStatus::Merged);
    assert!(repo.ops.coordinator().active_locks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rebase_strategy_merge_abort_hands_proposal_back() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1})).await;
    repo.fork("feature", "main").await;
    repo.put("feature", "S", json!(1)).await;
    let blocking = repo.put("feature", "R", json!({"x": 3})).await;
    let main_before = repo.put("main", "R", json!({"x": 4})).await;
    let proposal = repo.approved_proposal("feature", "main").await;

    let abort = match repo
        .ops
        .merge_branch(
            merge("feature", "main", MergeStrategy::Rebase).for_proposal(proposal.id.clone()),
        )
        .await
    {
        Err(BranchLockError::RebaseAborted(abort)) => abort,
        other => panic!("expected rebase abort, got {:?}", other),
    };
    assert_eq!(abort.original_head, main_before);
    assert_eq!(abort.applied.len(), 1);
    assert_eq!(abort.blocking_commit, blocking);

    let main = repo.ops.get_branch("main").await.unwrap();
    assert_eq!(main.status, BranchStatus::Active);
    assert_eq!(main.head_commit_hash, abort.applied[0]);
    assert_eq!(repo.ops.get_branch("feature").await.unwrap().status, BranchStatus::Active);

    let after = repo.ops.get_proposal(&proposal.id).await.unwrap();
    assert_eq!(after.status, ProposalStatus::Approved);
    assert_eq!(after.merge_commit_hash, None);

    let restored = repo
        .ops
        .reset_branch_head("main", &abort.original_head, "merger")
        .await
        .unwrap();
    assert_eq!(restored.head_commit_hash, main_before);
    assert_eq!(repo.read("main", "S").await, None);
    assert_eq!(repo.read("main", "R").await, Some(json!({"x": 4})));
}

#[tokio::test]
async fn test_diff_conflicts_are_symmetric() {
    let repo = Repo::new().await;
    repo.put("main", "R", json!({"x": 1})).await;
    repo.put("main", "Q", json!(1)).await;
    repo.fork("feature", "main").await;
    repo.put("feature", "R", json!({"x": 2})).await;
    repo.put("feature", "Q", json!(2)).await;
    repo.put("main", "R", json!({"x": 3})).await;
    repo.put("main", "N", json!(true)).await;

    let forward = repo.ops.get_diff("feature", "main").await.unwrap();
    let backward = repo.ops.get_diff("main", "feature").await.unwrap();

    let ids = |diff: &branchlock::model::BranchDiff| -> Vec<String> {
        let mut ids: Vec<String> = diff
            .conflicts()
            .into_iter()
            .map(|c| c.resource_id.clone())
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&forward), vec!["R".to_string()]);
    assert_eq!(ids(&forward), ids(&backward));
    assert_eq!(forward.base_commit, backward.base_commit);
    assert_eq!(forward.stats.conflicts, backward.stats.conflicts);
}

#[tokio::test]
async fn test_common_ancestor_of_unrelated_roots_is_an_error() {
    let repo = Repo::new().await;
    repo.ops
        .create_branch(CreateBranchRequest {
            name: "island".into(),
            from_branch: None,
            created_by: "carol".into(),
            protection_rules: vec![],
        })
        .await
        .unwrap();

    assert!(matches!(
        repo.ops.find_common_ancestor("main", "island").await,
        Err(BranchLockError::AncestorNotFound { .. })
    ));
}

#[tokio::test]
async fn test_proposal_lifecycle() {
    let repo = Repo::new().await;
    repo.fork("feature", "main").await;
    repo.put("feature", "A", json!(1)).await;

    let proposal = repo
        .ops
        .create_proposal(CreateProposalRequest {
            title: "Add A".into(),
            description: Some("adds resource A".into()),
            source_branch: "feature".into(),
            target_branch: "main".into(),
            created_by: "bob".into(),
        })
        .await
        .unwrap();
    assert_eq!(proposal.status, ProposalStatus::Draft);
    assert_eq!(proposal.diff_stats.added, 1);

    let early = repo
        .ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                approval: Some(Approval::new("carol", None)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(early, Err(BranchLockError::InvalidRequest(_))));

    repo.ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                status: Some(ProposalStatus::Review),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let unapproved = repo
        .ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                status: Some(ProposalStatus::Approved),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(unapproved, Err(BranchLockError::InvalidRequest(_))));

    let approved = repo
        .ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                status: Some(ProposalStatus::Approved),
                approval: Some(Approval::new("carol", Some("looks good".into()))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(approved.approval_count(), 1);

    let open = repo
        .ops
        .list_proposals(&ProposalQuery {
            branch: Some("main".into()),
            status: Some(ProposalStatus::Approved),
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 1);

    let result = repo
        .ops
        .merge_branch(merge("feature", "main", MergeStrategy::Squash).for_proposal(proposal.id.clone()))
        .await
        .unwrap();

    let merged = repo.ops.get_proposal(&proposal.id).await.unwrap();
    assert_eq!(merged.status, ProposalStatus::Merged);
    assert_eq!(merged.merge_commit_hash, result.merge_commit_hash);

    let reopened = repo
        .ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                status: Some(ProposalStatus::Review),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        reopened,
        Err(BranchLockError::InvalidProposalTransition { .. })
    ));
}

#[tokio::test]
async fn test_delete_blocked_by_open_proposal() {
    let repo = Repo::new().await;
    repo.fork("feature", "main").await;
    let proposal = repo
        .ops
        .create_proposal(CreateProposalRequest {
            title: "WIP".into(),
            description: None,
            source_branch: "feature".into(),
            target_branch: "main".into(),
            created_by: "bob".into(),
        })
        .await
        .unwrap();

    assert!(matches!(
        repo.ops.delete_branch("feature", false).await,
        Err(BranchLockError::BranchInUse { .. })
    ));

    repo.ops
        .update_proposal(
            &proposal.id,
            ProposalUpdate {
                status: Some(ProposalStatus::Rejected),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    repo.ops.delete_branch("feature", false).await.unwrap();
    assert_eq!(
        repo.ops.get_branch("feature").await.unwrap().status,
        BranchStatus::Archived
    );

    repo.ops.delete_branch("feature", true).await.unwrap();
    assert!(matches!(
        repo.ops.get_branch("feature").await,
        Err(BranchLockError::BranchNotFound(_))
    ));
    assert_eq!(repo.docs.branch_head("feature").await.unwrap(), None);
}

#[tokio::test]
async fn test_merged_branch_cannot_be_merged_again() {
    let repo = Repo::new().await;
    repo.fork("feature", "main").await;
    repo.put("feature", "A", json!(1)).await;
    repo.ops
        .merge_branch(merge("feature", "main", MergeStrategy::Merge))
        .await
        .unwrap();

    assert!(matches!(
        repo.ops
            .merge_branch(merge("feature", "main", MergeStrategy::Merge))
            .await,
        Err(BranchLockError::InvalidTransition { .. })
    ));
}
