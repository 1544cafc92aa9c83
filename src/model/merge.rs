use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffType {
    Added,
    Modified,
    Deleted,
    Conflict,
}

impl DiffType {
    /// Kind of change from `old` to `new`
    pub fn between(old: Option<&Value>, new: Option<&Value>) -> Self {
        match (old, new) {
            (None, Some(_)) => DiffType::Added,
            (Some(_), None) => DiffType::Deleted,
            _ => DiffType::Modified,
        }
    }
}

/// One side's change to a resource relative to the common ancestor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Both sides changed the same value differently
    ModifyModify,
    /// One side deleted, the other modified
    DeleteModify,
    /// Both sides created the resource with different content
    AddAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionChoice {
    UseSource,
    UseTarget,
    UseBase,
    UseCustom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub choice: ResolutionChoice,
    /// Only read for `UseCustom`; `None` or JSON null deletes the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_value: Option<Value>,
}

impl Resolution {
    pub fn use_source() -> Self {
        Self {
            choice: ResolutionChoice::UseSource,
            custom_value: None,
        }
    }

    pub fn use_target() -> Self {
        Self {
            choice: ResolutionChoice::UseTarget,
            custom_value: None,
        }
    }

    pub fn use_base() -> Self {
        Self {
            choice: ResolutionChoice::UseBase,
            custom_value: None,
        }
    }

    pub fn custom(value: Value) -> Self {
        Self {
            choice: ResolutionChoice::UseCustom,
            custom_value: Some(value),
        }
    }
}

/// Resolutions keyed by resource id
pub type Resolutions = HashMap<String, Resolution>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub resource_id: String,
    pub conflict_type: ConflictType,
    pub source_version: Option<Value>,
    pub target_version: Option<Value>,
    pub base_version: Option<Value>,
    /// Top-level object fields changed differently on both sides.
    /// Empty when the whole value conflicts.
    #[serde(default)]
    pub conflicting_fields: Vec<String>,
    pub is_resolved: bool,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn resolve(&mut self, resolution: Resolution) {
        self.resolution = Some(resolution);
        self.is_resolved = true;
    }

    pub fn description(&self) -> String {
        if self.conflicting_fields.is_empty() {
            format!("{:?} conflict on '{}'", self.conflict_type, self.resource_id)
        } else {
            format!(
                "{:?} conflict on '{}' (fields: {})",
                self.conflict_type,
                self.resource_id,
                self.conflicting_fields.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDiff {
    pub resource_id: String,
    pub diff_type: DiffType,
    /// Present when the source branch changed the resource
    pub source_delta: Option<ResourceDelta>,
    /// Present when the target branch changed the resource
    pub target_delta: Option<ResourceDelta>,
    /// Value after merging; `None` means absent. Ignored for conflicts.
    pub merged_value: Option<Value>,
    pub conflict: Option<Conflict>,
}

impl ResourceDiff {
    pub fn base_value(&self) -> Option<&Value> {
        self.source_delta
            .as_ref()
            .or(self.target_delta.as_ref())
            .and_then(|delta| delta.old_value.as_ref())
    }

    pub fn source_value(&self) -> Option<&Value> {
        match &self.source_delta {
            Some(delta) => delta.new_value.as_ref(),
            None => self.base_value(),
        }
    }

    pub fn target_value(&self) -> Option<&Value> {
        match &self.target_delta {
            Some(delta) => delta.new_value.as_ref(),
            None => self.base_value(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDiff {
    pub source_branch: String,
    pub target_branch: String,
    pub source_head: String,
    pub target_head: String,
    /// Nearest common ancestor of the two heads
    pub base_commit: String,
    pub resource_diffs: Vec<ResourceDiff>,
    pub stats: DiffStats,
}

impl BranchDiff {
    pub fn conflicts(&self) -> Vec<&Conflict> {
        self.resource_diffs
            .iter()
            .filter_map(|diff| diff.conflict.as_ref())
            .collect()
    }

    pub fn has_conflicts(&self) -> bool {
        self.stats.conflicts > 0
    }

    /// Source head already reachable from the target head
    pub fn is_up_to_date(&self) -> bool {
        self.base_commit == self.source_head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStrategy {
    Merge,
    Squash,
    Rebase,
}

/// Outcome of a merge, squash or rebase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub strategy: MergeStrategy,
    /// New head of the written branch
    pub merge_commit_hash: Option<String>,
    pub parent_hashes: Vec<String>,
    /// Commits created by a rebase, in replay order
    pub applied_commits: Vec<String>,
    pub applied_changes: usize,
    /// Conflicts settled by the supplied resolutions
    pub resolved_conflicts: Vec<Conflict>,
    pub message: String,
}

/// Returned when a rebase stops on an unresolved conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseAbort {
    pub branch: String,
    /// Head before the rebase started, for rolling back
    pub original_head: String,
    /// Replayed commits already recorded, oldest first
    pub applied: Vec<String>,
    /// Source commit whose replay conflicted
    pub blocking_commit: String,
    pub conflict: Conflict,
}
