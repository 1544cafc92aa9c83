use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, Conflict, DiffStats, Id, Resolutions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Draft,
    Review,
    Approved,
    Merged,
    Rejected,
}

impl ProposalStatus {
    /// Transitions a caller may request. APPROVED → MERGED only happens through a merge.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Draft, Review)
                | (Review, Draft)
                | (Review, Approved)
                | (Approved, Review)
                | (Draft, Rejected)
                | (Review, Rejected)
                | (Approved, Rejected)
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Draft | ProposalStatus::Review | ProposalStatus::Approved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Draft => "DRAFT",
            ProposalStatus::Review => "REVIEW",
            ProposalStatus::Approved => "APPROVED",
            ProposalStatus::Merged => "MERGED",
            ProposalStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(ProposalStatus::Draft),
            "REVIEW" => Some(ProposalStatus::Review),
            "APPROVED" => Some(ProposalStatus::Approved),
            "MERGED" => Some(ProposalStatus::Merged),
            "REJECTED" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub reviewer: String,
    pub comment: Option<String>,
    pub approved_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(reviewer: impl Into<String>, comment: Option<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            comment,
            approved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub id: Id,
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub status: ProposalStatus,
    pub diff_stats: DiffStats,
    pub conflicts: Vec<Conflict>,
    pub approvals: Vec<Approval>,
    /// Resolutions to apply when the proposal is merged
    pub resolutions: Resolutions,
    pub merge_commit_hash: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeProposal {
    pub fn new(
        title: String,
        description: Option<String>,
        source_branch: String,
        target_branch: String,
        created_by: String,
    ) -> Self {
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: generate_id(),
            title,
            description,
            source_branch,
            target_branch,
            status: ProposalStatus::Draft,
            diff_stats: DiffStats::default(),
            conflicts: Vec::new(),
            approvals: Vec::new(),
            resolutions: Resolutions::new(),
            merge_commit_hash: None,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// Distinct reviewers who approved
    pub fn approval_count(&self) -> usize {
        let mut reviewers: Vec<&str> = self.approvals.iter().map(|a| a.reviewer.as_str()).collect();
        reviewers.sort_unstable();
        reviewers.dedup();
        reviewers.len()
    }

    pub fn references_branch(&self, branch: &str) -> bool {
        self.source_branch == branch || self.target_branch == branch
    }

    /// Move `updated_at` forward. Stamps are kept at microsecond precision so
    /// they survive a round trip through the durable store, and each one is
    /// strictly later than the last so version checks see every write.
    pub fn touch(&mut self) {
        let floor = self.updated_at.trunc_subsecs(6) + chrono::Duration::microseconds(1);
        self.updated_at = Utc::now().trunc_subsecs(6).max(floor);
    }

    pub fn unresolved_conflicts(&self) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| !c.is_resolved && !self.resolutions.contains_key(&c.resource_id))
            .collect()
    }
}

/// Partial update to a proposal; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProposalStatus>,
    pub approval: Option<Approval>,
    pub resolutions: Option<Resolutions>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalQuery {
    /// Matches either side of the proposal
    pub branch: Option<String>,
    pub status: Option<ProposalStatus>,
}

impl ProposalQuery {
    pub fn matches(&self, proposal: &ChangeProposal) -> bool {
        self.branch
            .as_deref()
            .map(|b| proposal.references_branch(b))
            .unwrap_or(true)
            && self.status.map(|s| proposal.status == s).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> ChangeProposal {
        ChangeProposal::new(
            "Add colors".into(),
            None,
            "feature".into(),
            "main".into(),
            "alice".into(),
        )
    }

    #[test]
    fn test_proposal_lifecycle_transitions() {
        use ProposalStatus::*;
        assert!(Draft.can_transition_to(Review));
        assert!(Review.can_transition_to(Approved));
        assert!(Approved.can_transition_to(Rejected));
        assert!(!Approved.can_transition_to(Merged));
        assert!(!Merged.can_transition_to(Review));
        assert!(!Rejected.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Approved));
    }

    #[test]
    fn test_touch_always_moves_forward() {
        let mut p = proposal();
        let future = Utc::now() + chrono::Duration::hours(1);
        p.updated_at = future;
        p.touch();
        assert!(p.updated_at > future.trunc_subsecs(6));

        let before = p.updated_at;
        p.touch();
        assert!(p.updated_at > before);
        assert_eq!(p.updated_at, p.updated_at.trunc_subsecs(6));
    }

    #[test]
    fn test_approval_count_ignores_repeat_reviewers() {
        let mut p = proposal();
        p.approvals.push(Approval::new("bob", None));
        p.approvals.push(Approval::new("bob", Some("again".into())));
        p.approvals.push(Approval::new("carol", None));
        assert_eq!(p.approval_count(), 2);
    }

    #[test]
    fn test_query_matches_either_side() {
        let p = proposal();
        let by_target = ProposalQuery {
            branch: Some("main".into()),
            status: None,
        };
        let by_status = ProposalQuery {
            branch: None,
            status: Some(ProposalStatus::Merged),
        };
        assert!(by_target.matches(&p));
        assert!(!by_status.matches(&p));
    }
}
