use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Commit metadata as reported by the backing document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Content hash identifying the commit
    pub hash: String,
    /// Parent hashes, first parent first. Empty for a root commit.
    pub parent_hashes: Vec<String>,
    pub message: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    /// Resources written by this commit relative to its first parent
    pub changed_resources: Vec<String>,
}

impl CommitInfo {
    pub fn first_parent(&self) -> Option<&str> {
        self.parent_hashes.first().map(String::as_str)
    }

    pub fn is_merge(&self) -> bool {
        self.parent_hashes.len() > 1
    }
}

/// A single resource write handed to the store's commit primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op_type")]
pub enum ChangeOp {
    Put {
        resource_id: String,
        value: serde_json::Value,
    },
    Delete {
        resource_id: String,
    },
}

impl ChangeOp {
    /// Write `value` if present, delete otherwise
    pub fn set(resource_id: impl Into<String>, value: Option<serde_json::Value>) -> Self {
        match value {
            Some(value) => ChangeOp::Put {
                resource_id: resource_id.into(),
                value,
            },
            None => ChangeOp::Delete {
                resource_id: resource_id.into(),
            },
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            ChangeOp::Put { resource_id, .. } | ChangeOp::Delete { resource_id } => resource_id,
        }
    }
}

/// Commit creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommit {
    pub parent_hashes: Vec<String>,
    pub changes: Vec<ChangeOp>,
    pub message: String,
    pub author: String,
}

impl NewCommit {
    pub fn new(parent_hashes: Vec<String>, changes: Vec<ChangeOp>, message: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            parent_hashes,
            changes,
            message: message.into(),
            author: author.into(),
        }
    }

    /// SHA-256 over parents, author, message and changes. `salt` keeps
    /// otherwise identical commits (e.g. two empty root commits) distinct.
    pub fn content_hash(&self, salt: u64) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for parent in &self.parent_hashes {
            hasher.update(format!("parent:{}\n", parent));
        }
        hasher.update(format!("author:{}\n", self.author));
        hasher.update(format!("message:{}\n", self.message));
        for change in &self.changes {
            let encoded = serde_json::to_string(change).unwrap_or_default();
            hasher.update(format!("change:{}\n", encoded));
        }
        hasher.update(format!("salt:{}\n", salt));

        hex::encode(hasher.finalize())
    }
}
