use std::time::Duration;
use thiserror::Error;

use crate::model::{BranchStatus, Id, LockType, ProposalStatus, RebaseAbort};

pub type Result<T> = std::result::Result<T, BranchLockError>;

#[derive(Debug, Error)]
pub enum BranchLockError {
    #[error("lock on {key} is held by '{holder}' ({lock_type})")]
    LockConflict {
        key: String,
        holder: String,
        lock_type: LockType,
    },

    #[error("gave up on {key} after {waited:?}: held by '{holder}' ({lock_type})")]
    LockTimeout {
        key: String,
        waited: Duration,
        holder: String,
        lock_type: LockType,
    },

    #[error("lock {lock_id} on {key} is gone; abort the protected operation")]
    LockLost { lock_id: Id, key: String },

    #[error("branch '{branch}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        branch: String,
        from: BranchStatus,
        to: BranchStatus,
    },

    #[error("proposal {id} cannot move from {from:?} to {to:?}")]
    InvalidProposalTransition {
        id: Id,
        from: ProposalStatus,
        to: ProposalStatus,
    },

    #[error("no common ancestor for '{left}' and '{right}': {reason}")]
    AncestorNotFound {
        left: String,
        right: String,
        reason: String,
    },

    #[error("{} conflict(s) still need a resolution: {}", .resource_ids.len(), .resource_ids.join(", "))]
    ConflictsUnresolved { resource_ids: Vec<String> },

    #[error(
        "rebase of '{}' stopped at commit {} after {} replayed commit(s): conflict on '{}'",
        .0.branch, .0.blocking_commit, .0.applied.len(), .0.conflict.resource_id
    )]
    RebaseAborted(Box<RebaseAbort>),

    #[error("head of branch '{branch}' moved while the merge was being planned")]
    HeadMoved { branch: String },

    #[error("branch '{0}' not found")]
    BranchNotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("proposal {0} not found")]
    ProposalNotFound(Id),

    #[error("proposal {id} kept changing underneath the update; re-read and retry")]
    ProposalChanged { id: Id },

    #[error("branch '{branch}' is protected: {rule}")]
    ProtectionViolation { branch: String, rule: String },

    #[error("branch '{branch}' is referenced by open proposal {proposal_id}")]
    BranchInUse { branch: String, proposal_id: Id },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl BranchLockError {
    /// Errors the orchestrator retries with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BranchLockError::LockConflict { .. }
                | BranchLockError::LockTimeout { .. }
                | BranchLockError::HeadMoved { .. }
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        BranchLockError::InvalidRequest(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lock_contention_is_retryable() {
        let conflict = BranchLockError::LockConflict {
            key: "BRANCH:main".into(),
            holder: "a".into(),
            lock_type: LockType::Manual,
        };
        let lost = BranchLockError::LockLost {
            lock_id: "l1".into(),
            key: "BRANCH:main".into(),
        };
        let unresolved = BranchLockError::ConflictsUnresolved {
            resource_ids: vec!["R".into()],
        };

        assert!(conflict.is_retryable());
        assert!(!lost.is_retryable());
        assert!(!unresolved.is_retryable());
        assert_eq!(
            unresolved.to_string(),
            "1 conflict(s) still need a resolution: R"
        );
    }
}
