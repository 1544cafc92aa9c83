use crate::model::Branch;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache entry for a branch record
#[derive(Clone, Debug)]
struct CacheEntry {
    branch: Branch,
    cached_at: Instant,
}

/// Read-through cache for branch records. Entries expire after `ttl`, which
/// bounds how stale a read can be when another process changed the branch.
#[derive(Debug)]
pub struct BranchCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl BranchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Get a branch from cache if present and not expired
    pub async fn get(&self, name: &str) -> Option<Branch> {
        if self.ttl.is_zero() {
            return None;
        }

        {
            let entries = self.entries.read().await;
            match entries.get(name) {
                Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                    return Some(entry.branch.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired
        self.entries.write().await.remove(name);
        None
    }

    pub async fn put(&self, branch: Branch) {
        if self.ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.write().await;
        entries.insert(
            branch.name.clone(),
            CacheEntry {
                branch,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop a branch so the next read goes to the store
    pub async fn invalidate(&self, name: &str) {
        self.entries.write().await.remove(name);
    }

    /// Clear all expired entries from cache
    pub async fn clear_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.cached_at.elapsed() <= ttl);
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for BranchCache {
    fn default() -> Self {
        Self::new(Duration::from_millis(2_000))
    }
}
