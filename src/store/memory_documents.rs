use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::model::{ChangeOp, CommitInfo, NewCommit};
use crate::store::traits::DocumentStore;

/// Full resource snapshot as of one commit
type Snapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
struct StoredCommit {
    info: CommitInfo,
    snapshot: Snapshot,
}

#[derive(Debug, Default)]
struct DocumentState {
    commits: HashMap<String, StoredCommit>,
    refs: HashMap<String, String>,
    sequence: u64,
}

/// Content-addressed document store kept in memory. Every commit stores the
/// complete snapshot, so reading a resource at a commit is a map lookup.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<DocumentState>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `changes` on top of the current head of `branch`, creating the
    /// branch ref if it does not exist yet.
    pub async fn write(
        &self,
        branch: &str,
        changes: Vec<ChangeOp>,
        message: &str,
        author: &str,
    ) -> Result<String> {
        let parents = self.branch_head(branch).await?.into_iter().collect();
        self.commit_changes(branch, NewCommit::new(parents, changes, message, author))
            .await
    }

    /// Every resource visible at `hash`
    pub fn snapshot(&self, hash: &str) -> Option<BTreeMap<String, Value>> {
        self.state
            .lock()
            .commits
            .get(hash)
            .map(|commit| commit.snapshot.clone())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn commit_history(&self, branch: &str) -> Result<Vec<CommitInfo>> {
        let state = self.state.lock();
        let head = state
            .refs
            .get(branch)
            .with_context(|| format!("Branch ref not found: {}", branch))?;

        let mut history = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([head.clone()]);
        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            let commit = state
                .commits
                .get(&hash)
                .with_context(|| format!("Commit not found: {}", hash))?;
            queue.extend(commit.info.parent_hashes.iter().cloned());
            history.push(commit.info.clone());
        }
        Ok(history)
    }

    async fn get_commit(&self, hash: &str) -> Result<Option<CommitInfo>> {
        Ok(self
            .state
            .lock()
            .commits
            .get(hash)
            .map(|commit| commit.info.clone()))
    }

    async fn resource_at_commit(&self, hash: &str, resource_id: &str) -> Result<Option<Value>> {
        let state = self.state.lock();
        let commit = state
            .commits
            .get(hash)
            .with_context(|| format!("Commit not found: {}", hash))?;
        Ok(commit.snapshot.get(resource_id).cloned())
    }

    async fn commit_changes(&self, branch: &str, commit: NewCommit) -> Result<String> {
        let mut state = self.state.lock();

        for parent in &commit.parent_hashes {
            if !state.commits.contains_key(parent) {
                anyhow::bail!("Parent commit not found: {}", parent);
            }
        }

        let mut snapshot = commit
            .parent_hashes
            .first()
            .and_then(|parent| state.commits.get(parent))
            .map(|parent| parent.snapshot.clone())
            .unwrap_or_default();

        let mut changed = Vec::new();
        for change in &commit.changes {
            match change {
                ChangeOp::Put { resource_id, value } => {
                    snapshot.insert(resource_id.clone(), value.clone());
                }
                ChangeOp::Delete { resource_id } => {
                    snapshot.remove(resource_id);
                }
            }
            changed.push(change.resource_id().to_string());
        }
        changed.sort();
        changed.dedup();

        state.sequence += 1;
        let hash = commit.content_hash(state.sequence);
        let info = CommitInfo {
            hash: hash.clone(),
            parent_hashes: commit.parent_hashes,
            message: commit.message,
            author: commit.author,
            created_at: Utc::now(),
            changed_resources: changed,
        };

        state
            .commits
            .insert(hash.clone(), StoredCommit { info, snapshot });
        state.refs.insert(branch.to_string(), hash.clone());
        Ok(hash)
    }

    async fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        Ok(self.state.lock().refs.get(branch).cloned())
    }

    async fn create_branch_ref(&self, branch: &str, at_commit: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.refs.contains_key(branch) {
            anyhow::bail!("Branch ref already exists: {}", branch);
        }
        if !state.commits.contains_key(at_commit) {
            anyhow::bail!("Commit not found: {}", at_commit);
        }
        state.refs.insert(branch.to_string(), at_commit.to_string());
        Ok(())
    }

    async fn set_branch_ref(&self, branch: &str, commit: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.commits.contains_key(commit) {
            anyhow::bail!("Commit not found: {}", commit);
        }
        state.refs.insert(branch.to_string(), commit.to_string());
        Ok(())
    }

    async fn delete_branch_ref(&self, branch: &str) -> Result<bool> {
        Ok(self.state.lock().refs.remove(branch).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commits_carry_parent_snapshot_forward() {
        let docs = MemoryDocumentStore::new();
        let root = docs
            .write("main", vec![ChangeOp::set("A", Some(json!(1)))], "root", "alice")
            .await
            .unwrap();
        let second = docs
            .write("main", vec![ChangeOp::set("B", Some(json!(2)))], "second", "alice")
            .await
            .unwrap();

        assert_eq!(docs.resource_at_commit(&root, "B").await.unwrap(), None);
        assert_eq!(
            docs.resource_at_commit(&second, "A").await.unwrap(),
            Some(json!(1))
        );

        let info = docs.get_commit(&second).await.unwrap().unwrap();
        assert_eq!(info.parent_hashes, vec![root.clone()]);
        assert_eq!(info.changed_resources, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_identical_empty_commits_get_distinct_hashes() {
        let docs = MemoryDocumentStore::new();
        let a = docs
            .commit_changes("a", NewCommit::new(vec![], vec![], "Initial commit", "x"))
            .await
            .unwrap();
        let b = docs
            .commit_changes("b", NewCommit::new(vec![], vec![], "Initial commit", "x"))
            .await
            .unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_history_walks_every_parent_once() {
        let docs = MemoryDocumentStore::new();
        let root = docs.write("main", vec![], "root", "a").await.unwrap();
        docs.create_branch_ref("feature", &root).await.unwrap();
        let left = docs
            .write("main", vec![ChangeOp::set("L", Some(json!(1)))], "left", "a")
            .await
            .unwrap();
        let right = docs
            .write("feature", vec![ChangeOp::set("R", Some(json!(1)))], "right", "a")
            .await
            .unwrap();
        docs.commit_changes(
            "main",
            NewCommit::new(vec![left, right], vec![], "merge", "a"),
        )
        .await
        .unwrap();

        let history = docs.commit_history("main").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().hash, root);
    }

    #[tokio::test]
    async fn test_unknown_parent_is_rejected() {
        let docs = MemoryDocumentStore::new();
        let result = docs
            .commit_changes("main", NewCommit::new(vec!["nope".into()], vec![], "m", "a"))
            .await;
        assert!(result.is_err());
    }
}
