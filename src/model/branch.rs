use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchStatus {
    Active,         // Open for writes
    LockedForWrite, // An exclusive branch lock is held
    Merged,         // Merged into its target, terminal
    Archived,       // Kept for history, terminal
}

impl BranchStatus {
    pub fn can_transition_to(&self, next: BranchStatus) -> bool {
        matches!(
            (self, next),
            (BranchStatus::Active, BranchStatus::LockedForWrite)
                | (BranchStatus::LockedForWrite, BranchStatus::Active)
                | (BranchStatus::Active, BranchStatus::Merged)
                | (BranchStatus::Active, BranchStatus::Archived)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchStatus::Merged | BranchStatus::Archived)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "ACTIVE",
            BranchStatus::LockedForWrite => "LOCKED_FOR_WRITE",
            BranchStatus::Merged => "MERGED",
            BranchStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(BranchStatus::Active),
            "LOCKED_FOR_WRITE" => Some(BranchStatus::LockedForWrite),
            "MERGED" => Some(BranchStatus::Merged),
            "ARCHIVED" => Some(BranchStatus::Archived),
            _ => None,
        }
    }
}

/// Why a caller wants to move a branch into LOCKED_FOR_WRITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// Ad-hoc edits by a client
    DirectWrite,
    /// Applying an approved change proposal
    ProposalMerge { approvals: usize },
    /// Housekeeping such as head resets
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ProtectionRule {
    /// Only proposal merges may write to the branch
    ForbidDirectWrites,
    /// Writes must come from a proposal with at least this many approvals
    RequireApprovedProposal { min_approvals: usize },
    /// The branch may not be archived or purged
    ForbidDeletion,
}

impl ProtectionRule {
    pub fn permits_write(&self, intent: WriteIntent) -> bool {
        match (self, intent) {
            (ProtectionRule::ForbidDeletion, _) => true,
            (_, WriteIntent::Maintenance) => true,
            (ProtectionRule::ForbidDirectWrites, WriteIntent::DirectWrite) => false,
            (ProtectionRule::ForbidDirectWrites, WriteIntent::ProposalMerge { .. }) => true,
            (ProtectionRule::RequireApprovedProposal { .. }, WriteIntent::DirectWrite) => false,
            (
                ProtectionRule::RequireApprovedProposal { min_approvals },
                WriteIntent::ProposalMerge { approvals },
            ) => approvals >= *min_approvals,
        }
    }

    pub fn permits_deletion(&self) -> bool {
        !matches!(self, ProtectionRule::ForbidDeletion)
    }

    pub fn describe(&self) -> String {
        match self {
            ProtectionRule::ForbidDirectWrites => "direct writes are forbidden".to_string(),
            ProtectionRule::RequireApprovedProposal { min_approvals } => format!(
                "writes require a proposal with at least {} approval(s)",
                min_approvals
            ),
            ProtectionRule::ForbidDeletion => "branch may not be deleted".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub from_branch: Option<String>, // None for a root branch
    pub head_commit_hash: String,
    pub status: BranchStatus,
    pub protection_rules: Vec<ProtectionRule>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub commits_ahead: u32,
    pub commits_behind: u32,
    pub has_pending_changes: bool,
}

impl Branch {
    pub fn new_root(name: String, head_commit_hash: String, created_by: String) -> Self {
        let now = Utc::now();
        Self {
            name,
            from_branch: None,
            head_commit_hash,
            status: BranchStatus::Active,
            protection_rules: Vec::new(),
            created_by,
            created_at: now,
            last_modified: now,
            commits_ahead: 0,
            commits_behind: 0,
            has_pending_changes: false,
        }
    }

    pub fn new_from_branch(parent: &Branch, name: String, created_by: String) -> Self {
        let mut branch = Self::new_root(name, parent.head_commit_hash.clone(), created_by);
        branch.from_branch = Some(parent.name.clone());
        branch
    }

    pub fn with_protection(mut self, rules: Vec<ProtectionRule>) -> Self {
        self.protection_rules = rules;
        self
    }

    pub fn is_protected(&self) -> bool {
        !self.protection_rules.is_empty()
    }

    /// First protection rule that rejects `intent`, if any
    pub fn blocking_rule(&self, intent: WriteIntent) -> Option<&ProtectionRule> {
        self.protection_rules
            .iter()
            .find(|rule| !rule.permits_write(intent))
    }
}
