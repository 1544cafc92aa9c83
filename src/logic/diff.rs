use itertools::Itertools;
use log::debug;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{BranchLockError, Result};
use crate::model::{
    BranchDiff, CommitInfo, Conflict, ConflictType, DiffStats, DiffType, ResourceDelta,
    ResourceDiff,
};
use crate::store::traits::DocumentStore;

/// Which side wins a field that both sides changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

/// Three-way merge of top-level object fields. Returns the merged object and
/// the fields both sides changed differently, which take `prefer`'s value.
pub fn merge_object_fields(
    base: &Map<String, Value>,
    source: &Map<String, Value>,
    target: &Map<String, Value>,
    prefer: Side,
) -> (Map<String, Value>, Vec<String>) {
    let mut merged = Map::new();
    let mut conflicting = Vec::new();

    let keys = base
        .keys()
        .chain(source.keys())
        .chain(target.keys())
        .sorted()
        .dedup();

    for key in keys {
        let (b, s, t) = (base.get(key), source.get(key), target.get(key));
        let value = match (s != b, t != b) {
            (false, false) => b,
            (true, false) => s,
            (false, true) => t,
            (true, true) if s == t => s,
            (true, true) => {
                conflicting.push(key.clone());
                match prefer {
                    Side::Source => s,
                    Side::Target => t,
                }
            }
        };
        if let Some(value) = value {
            merged.insert(key.clone(), value.clone());
        }
    }

    (merged, conflicting)
}

fn delta(old: Option<&Value>, new: Option<&Value>) -> ResourceDelta {
    ResourceDelta {
        old_value: old.cloned(),
        new_value: new.cloned(),
    }
}

struct SearchSide {
    label: String,
    frontier: Vec<String>,
    depth: HashMap<String, usize>,
    level: usize,
}

impl SearchSide {
    fn new(label: &str, head: &str) -> Self {
        Self {
            label: label.to_string(),
            frontier: vec![head.to_string()],
            depth: HashMap::from([(head.to_string(), 0)]),
            level: 0,
        }
    }
}

/// Read-only comparison of branch histories. Never takes a lock.
pub struct DiffEngine<D: DocumentStore> {
    docs: Arc<D>,
    max_depth: usize,
}

impl<D: DocumentStore> DiffEngine<D> {
    pub fn new(docs: Arc<D>, max_depth: usize) -> Self {
        Self { docs, max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    async fn parents_of(&self, hash: &str) -> Result<Vec<String>> {
        let commit = self.docs.get_commit(hash).await?.ok_or_else(|| {
            BranchLockError::Store(anyhow::anyhow!("Commit not found: {}", hash))
        })?;
        Ok(commit.parent_hashes)
    }

    pub async fn find_common_ancestor(&self, left_head: &str, right_head: &str) -> Result<String> {
        self.find_labeled_ancestor(left_head, left_head, right_head, right_head)
            .await
    }

    /// Nearest common ancestor by breadth-first search alternating one level
    /// at a time from each head. Among ancestors found on the same level the
    /// one with the smallest combined depth wins, ties broken by hash.
    pub async fn find_labeled_ancestor(
        &self,
        left_label: &str,
        left_head: &str,
        right_label: &str,
        right_head: &str,
    ) -> Result<String> {
        if left_head == right_head {
            return Ok(left_head.to_string());
        }

        let mut left = SearchSide::new(left_label, left_head);
        let mut right = SearchSide::new(right_label, right_head);
        let mut expand_left = true;
        let mut depth_exceeded = false;

        loop {
            if left.frontier.is_empty() && right.frontier.is_empty() {
                let reason = if depth_exceeded {
                    format!("no common commit within {} generations", self.max_depth)
                } else {
                    "histories share no commit".to_string()
                };
                return Err(BranchLockError::AncestorNotFound {
                    left: left.label,
                    right: right.label,
                    reason,
                });
            }

            let use_left = match (left.frontier.is_empty(), right.frontier.is_empty()) {
                (true, _) => false,
                (_, true) => true,
                _ => expand_left,
            };
            expand_left = !use_left;

            let (side, other) = if use_left {
                (&mut left, &right)
            } else {
                (&mut right, &left)
            };
            if side.level >= self.max_depth {
                side.frontier.clear();
                depth_exceeded = true;
                continue;
            }

            side.level += 1;
            let mut next = Vec::new();
            let mut meetings = Vec::new();
            for hash in std::mem::take(&mut side.frontier) {
                for parent in self.parents_of(&hash).await? {
                    if side.depth.contains_key(&parent) {
                        continue;
                    }
                    side.depth.insert(parent.clone(), side.level);
                    if let Some(other_depth) = other.depth.get(&parent) {
                        meetings.push((side.level + other_depth, parent.clone()));
                    }
                    next.push(parent);
                }
            }
            side.frontier = next;

            if let Some((_, ancestor)) = meetings.into_iter().min() {
                debug!(
                    "Common ancestor of '{}' and '{}' is {}",
                    left.label, right.label, ancestor
                );
                return Ok(ancestor);
            }
        }
    }

    /// Commits reachable from `head` but not from `base`, oldest first
    pub async fn commits_since(&self, head: &str, base: &str) -> Result<Vec<CommitInfo>> {
        let mut excluded = HashSet::new();
        let mut queue = VecDeque::from([(base.to_string(), 0usize)]);
        while let Some((hash, depth)) = queue.pop_front() {
            if depth > self.max_depth || !excluded.insert(hash.clone()) {
                continue;
            }
            for parent in self.parents_of(&hash).await? {
                queue.push_back((parent, depth + 1));
            }
        }

        // Iterative post-order walk so parents land before children
        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(String, bool)> = vec![(head.to_string(), false)];
        while let Some((hash, expanded)) = stack.pop() {
            if excluded.contains(&hash) {
                continue;
            }
            if expanded {
                let commit = self.docs.get_commit(&hash).await?.ok_or_else(|| {
                    BranchLockError::Store(anyhow::anyhow!("Commit not found: {}", hash))
                })?;
                ordered.push(commit);
                continue;
            }
            if !visited.insert(hash.clone()) {
                continue;
            }
            stack.push((hash.clone(), true));
            for parent in self.parents_of(&hash).await?.into_iter().rev() {
                if !visited.contains(&parent) {
                    stack.push((parent, false));
                }
            }
        }
        Ok(ordered)
    }

    pub async fn compute_diff(
        &self,
        source_branch: &str,
        source_head: &str,
        target_branch: &str,
        target_head: &str,
    ) -> Result<BranchDiff> {
        let base = self
            .find_labeled_ancestor(source_branch, source_head, target_branch, target_head)
            .await?;

        let source_commits = self.commits_since(source_head, &base).await?;
        let target_commits = self.commits_since(target_head, &base).await?;
        let touched = source_commits
            .iter()
            .chain(target_commits.iter())
            .flat_map(|commit| commit.changed_resources.iter().cloned())
            .sorted()
            .dedup();

        let mut resource_diffs = Vec::new();
        for resource_id in touched {
            let base_value = self.docs.resource_at_commit(&base, &resource_id).await?;
            let source_value = self.docs.resource_at_commit(source_head, &resource_id).await?;
            let target_value = self.docs.resource_at_commit(target_head, &resource_id).await?;
            if let Some(diff) = Self::classify(
                &resource_id,
                base_value.as_ref(),
                source_value.as_ref(),
                target_value.as_ref(),
            ) {
                resource_diffs.push(diff);
            }
        }

        let stats = Self::stats(&resource_diffs);
        debug!(
            "Diff {} -> {} from {}: {} resource(s), {} conflict(s)",
            source_branch,
            target_branch,
            base,
            resource_diffs.len(),
            stats.conflicts
        );

        Ok(BranchDiff {
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            source_head: source_head.to_string(),
            target_head: target_head.to_string(),
            base_commit: base,
            resource_diffs,
            stats,
        })
    }

    pub fn stats(diffs: &[ResourceDiff]) -> DiffStats {
        let mut stats = DiffStats::default();
        for diff in diffs {
            match diff.diff_type {
                DiffType::Added => stats.added += 1,
                DiffType::Modified => stats.modified += 1,
                DiffType::Deleted => stats.deleted += 1,
                DiffType::Conflict => stats.conflicts += 1,
            }
        }
        stats
    }

    /// Three-way classification of one resource. `None` when neither side
    /// changed it. Swapping source and target flags the same conflict.
    pub fn classify(
        resource_id: &str,
        base: Option<&Value>,
        source: Option<&Value>,
        target: Option<&Value>,
    ) -> Option<ResourceDiff> {
        let source_changed = source != base;
        let target_changed = target != base;

        let clean = |diff_type, merged: Option<&Value>| ResourceDiff {
            resource_id: resource_id.to_string(),
            diff_type,
            source_delta: source_changed.then(|| delta(base, source)),
            target_delta: target_changed.then(|| delta(base, target)),
            merged_value: merged.cloned(),
            conflict: None,
        };

        match (source_changed, target_changed) {
            (false, false) => return None,
            (true, false) => return Some(clean(DiffType::between(base, source), source)),
            (false, true) => return Some(clean(DiffType::between(base, target), target)),
            (true, true) if source == target => {
                return Some(clean(DiffType::between(base, source), source))
            }
            (true, true) => {}
        }

        let (conflict_type, conflicting_fields) = match (base, source, target) {
            (None, Some(_), Some(_)) => (ConflictType::AddAdd, Vec::new()),
            (Some(_), None, Some(_)) | (Some(_), Some(_), None) => {
                (ConflictType::DeleteModify, Vec::new())
            }
            (Some(Value::Object(b)), Some(Value::Object(s)), Some(Value::Object(t))) => {
                let (merged, fields) = merge_object_fields(b, s, t, Side::Target);
                if fields.is_empty() {
                    let merged = Value::Object(merged);
                    return Some(clean(DiffType::Modified, Some(&merged)));
                }
                (ConflictType::ModifyModify, fields)
            }
            _ => (ConflictType::ModifyModify, Vec::new()),
        };

        Some(ResourceDiff {
            resource_id: resource_id.to_string(),
            diff_type: DiffType::Conflict,
            source_delta: Some(delta(base, source)),
            target_delta: Some(delta(base, target)),
            merged_value: None,
            conflict: Some(Conflict {
                resource_id: resource_id.to_string(),
                conflict_type,
                source_version: source.cloned(),
                target_version: target.cloned(),
                base_version: base.cloned(),
                conflicting_fields,
                is_resolved: false,
                resolution: None,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeOp, NewCommit};
    use crate::store::MemoryDocumentStore;
    use serde_json::json;

    type Engine = DiffEngine<MemoryDocumentStore>;

    #[test]
    fn test_classify_disjoint_fields_auto_merge() {
        let diff = Engine::classify(
            "R",
            Some(&json!({"x": 1, "y": 1})),
            Some(&json!({"x": 2, "y": 1})),
            Some(&json!({"x": 1, "y": 5})),
        )
        .unwrap();

        assert!(!diff.is_conflict());
        assert_eq!(diff.merged_value, Some(json!({"x": 2, "y": 5})));
    }

    #[test]
    fn test_classify_same_field_conflict_is_symmetric() {
        let base = json!({"x": 1});
        let left = json!({"x": 3});
        let right = json!({"x": 4});

        let forward = Engine::classify("R", Some(&base), Some(&left), Some(&right)).unwrap();
        let backward = Engine::classify("R", Some(&base), Some(&right), Some(&left)).unwrap();

        let forward = forward.conflict.unwrap();
        let backward = backward.conflict.unwrap();
        assert_eq!(forward.conflict_type, ConflictType::ModifyModify);
        assert_eq!(backward.conflict_type, ConflictType::ModifyModify);
        assert_eq!(forward.conflicting_fields, vec!["x".to_string()]);
        assert_eq!(forward.conflicting_fields, backward.conflicting_fields);
    }

    #[test]
    fn test_classify_conflict_kinds() {
        let deleted = Engine::classify("R", Some(&json!(1)), None, Some(&json!(2))).unwrap();
        assert_eq!(
            deleted.conflict.unwrap().conflict_type,
            ConflictType::DeleteModify
        );

        let added = Engine::classify("R", None, Some(&json!("a")), Some(&json!("b"))).unwrap();
        assert_eq!(added.conflict.unwrap().conflict_type, ConflictType::AddAdd);

        let convergent =
            Engine::classify("R", Some(&json!(1)), Some(&json!(2)), Some(&json!(2))).unwrap();
        assert!(!convergent.is_conflict());

        assert!(Engine::classify("R", Some(&json!(1)), Some(&json!(1)), Some(&json!(1))).is_none());
    }

    #[tokio::test]
    async fn test_ancestor_of_forked_branches() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let root = docs.write("main", vec![], "root", "a").await.unwrap();
        docs.create_branch_ref("feature", &root).await.unwrap();
        let fork = docs
            .write("main", vec![ChangeOp::set("A", Some(json!(1)))], "a", "a")
            .await
            .unwrap();
        docs.create_branch_ref("other", &fork).await.unwrap();
        let main_head = docs
            .write("main", vec![ChangeOp::set("B", Some(json!(1)))], "b", "a")
            .await
            .unwrap();
        let other_head = docs
            .write("other", vec![ChangeOp::set("C", Some(json!(1)))], "c", "a")
            .await
            .unwrap();

        let engine = DiffEngine::new(Arc::clone(&docs), 100);
        assert_eq!(
            engine.find_common_ancestor(&main_head, &other_head).await.unwrap(),
            fork
        );
        assert_eq!(engine.find_common_ancestor(&main_head, &root).await.unwrap(), root);
        assert_eq!(engine.find_common_ancestor(&root, &main_head).await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_disjoint_histories_have_no_ancestor() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let a = docs.write("a", vec![], "root a", "x").await.unwrap();
        let b = docs.write("b", vec![], "root b", "x").await.unwrap();

        let engine = DiffEngine::new(docs, 100);
        assert!(matches!(
            engine.find_common_ancestor(&a, &b).await,
            Err(BranchLockError::AncestorNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_depth_bound_stops_search() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let root = docs.write("main", vec![], "root", "x").await.unwrap();
        docs.create_branch_ref("long", &root).await.unwrap();
        let mut head = root.clone();
        for i in 0..6 {
            head = docs
                .write("long", vec![ChangeOp::set("R", Some(json!(i)))], "step", "x")
                .await
                .unwrap();
        }

        let shallow = DiffEngine::new(Arc::clone(&docs), 3);
        assert!(matches!(
            shallow.find_common_ancestor(&head, &root).await,
            Err(BranchLockError::AncestorNotFound { .. })
        ));
        let deep = DiffEngine::new(docs, 10);
        assert_eq!(deep.find_common_ancestor(&head, &root).await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_commits_since_orders_oldest_first() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let root = docs.write("main", vec![], "root", "x").await.unwrap();
        let first = docs
            .write("main", vec![ChangeOp::set("R", Some(json!(1)))], "first", "x")
            .await
            .unwrap();
        let second = docs
            .commit_changes(
                "main",
                NewCommit::new(vec![first.clone()], vec![ChangeOp::set("R", Some(json!(2)))], "second", "x"),
            )
            .await
            .unwrap();

        let engine = DiffEngine::new(docs, 100);
        let commits = engine.commits_since(&second, &root).await.unwrap();
        let hashes: Vec<&str> = commits.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec![first.as_str(), second.as_str()]);
        assert!(engine.commits_since(&root, &second).await.unwrap().is_empty());
    }
}
