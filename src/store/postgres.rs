use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{
    Approval, Branch, BranchStatus, ChangeProposal, Conflict, DiffStats, Id, Lock, LockScope,
    LockState, LockType, ProposalStatus, ProtectionRule, Resolutions, ResourceKey,
};
use crate::store::traits::{AcquireOutcome, BranchStore, LockStore, ProposalStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS locks (
        id TEXT PRIMARY KEY,
        branch TEXT NOT NULL,
        scope TEXT NOT NULL,
        resource_key TEXT NOT NULL,
        lock_type TEXT NOT NULL,
        holder_id TEXT NOT NULL,
        session_id TEXT,
        acquired_at TIMESTAMPTZ NOT NULL,
        ttl_seconds BIGINT NOT NULL,
        last_heartbeat_at TIMESTAMPTZ NOT NULL,
        state TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS locks_scope_key_idx ON locks (scope, resource_key)",
    "CREATE INDEX IF NOT EXISTS locks_branch_idx ON locks (branch)",
    "CREATE INDEX IF NOT EXISTS locks_session_idx ON locks (session_id)",
    r#"
    CREATE TABLE IF NOT EXISTS branches (
        name TEXT PRIMARY KEY,
        from_branch TEXT,
        head_commit_hash TEXT NOT NULL,
        status TEXT NOT NULL,
        protection_rules JSONB NOT NULL DEFAULT '[]',
        created_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        last_modified TIMESTAMPTZ NOT NULL,
        commits_ahead INTEGER NOT NULL DEFAULT 0,
        commits_behind INTEGER NOT NULL DEFAULT 0,
        has_pending_changes BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS change_proposals (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        source_branch TEXT NOT NULL,
        target_branch TEXT NOT NULL,
        status TEXT NOT NULL,
        diff_stats JSONB NOT NULL,
        conflicts JSONB NOT NULL,
        approvals JSONB NOT NULL,
        resolutions JSONB NOT NULL,
        merge_commit_hash TEXT,
        created_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const LOCK_COLUMNS: &str = "id, scope, resource_key, lock_type, holder_id, session_id, acquired_at, ttl_seconds, last_heartbeat_at, state";

const BRANCH_COLUMNS: &str = "name, from_branch, head_commit_hash, status, protection_rules, created_by, created_at, last_modified, commits_ahead, commits_behind, has_pending_changes";

const PROPOSAL_COLUMNS: &str = "id, title, description, source_branch, target_branch, status, diff_stats, conflicts, approvals, resolutions, merge_commit_hash, created_by, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    sessions: Arc<SessionConnections>,
}

/// First key of the two-key advisory locks that mark sessions as live
const SESSION_LOCK_NAMESPACE: i32 = 0x424C;

/// Pool connections pinned to attached sessions. Each holds a shared advisory
/// lock on its session, which Postgres drops when the connection dies.
#[derive(Default)]
struct SessionConnections(Mutex<HashMap<Id, PoolConnection<Postgres>>>);

impl std::fmt::Debug for SessionConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnections")
            .field("attached", &self.0.lock().len())
            .finish()
    }
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self {
            pool,
            sessions: Arc::default(),
        })
    }

    /// Create the tables this store needs if they are missing
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to run schema migration")?;
        }
        log::info!("Lock and branch tables are up to date");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lock_from_row(row: &PgRow) -> Result<Lock> {
    let scope: String = row.get("scope");
    let scope = LockScope::parse(&scope).with_context(|| format!("Unknown lock scope: {}", scope))?;
    let key: String = row.get("resource_key");
    let resource_key = ResourceKey::from_storage(scope, &key)
        .with_context(|| format!("Malformed resource key: {}", key))?;
    let lock_type: String = row.get("lock_type");
    let state: String = row.get("state");
    let ttl_seconds: i64 = row.get("ttl_seconds");

    Ok(Lock {
        id: row.get("id"),
        resource_key,
        lock_type: LockType::parse(&lock_type)
            .with_context(|| format!("Unknown lock type: {}", lock_type))?,
        holder_id: row.get("holder_id"),
        session_id: row.get("session_id"),
        acquired_at: row.get("acquired_at"),
        ttl_seconds: u64::try_from(ttl_seconds).unwrap_or(0),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        state: LockState::parse(&state).unwrap_or(LockState::Active),
    })
}

fn locks_from_rows(rows: Vec<PgRow>) -> Result<Vec<Lock>> {
    rows.iter().map(lock_from_row).collect()
}

fn with_state(mut locks: Vec<Lock>, state: LockState) -> Vec<Lock> {
    for lock in &mut locks {
        lock.state = state;
    }
    locks
}

fn branch_from_row(row: &PgRow) -> Result<Branch> {
    let status: String = row.get("status");
    let Json(protection_rules): Json<Vec<ProtectionRule>> = row.get("protection_rules");
    let commits_ahead: i32 = row.get("commits_ahead");
    let commits_behind: i32 = row.get("commits_behind");

    Ok(Branch {
        name: row.get("name"),
        from_branch: row.get("from_branch"),
        head_commit_hash: row.get("head_commit_hash"),
        status: BranchStatus::parse(&status)
            .with_context(|| format!("Unknown branch status: {}", status))?,
        protection_rules,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        last_modified: row.get("last_modified"),
        commits_ahead: u32::try_from(commits_ahead).unwrap_or(0),
        commits_behind: u32::try_from(commits_behind).unwrap_or(0),
        has_pending_changes: row.get("has_pending_changes"),
    })
}

fn proposal_from_row(row: &PgRow) -> Result<ChangeProposal> {
    let status: String = row.get("status");
    let Json(diff_stats): Json<DiffStats> = row.get("diff_stats");
    let Json(conflicts): Json<Vec<Conflict>> = row.get("conflicts");
    let Json(approvals): Json<Vec<Approval>> = row.get("approvals");
    let Json(resolutions): Json<Resolutions> = row.get("resolutions");

    Ok(ChangeProposal {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        source_branch: row.get("source_branch"),
        target_branch: row.get("target_branch"),
        status: ProposalStatus::parse(&status)
            .with_context(|| format!("Unknown proposal status: {}", status))?,
        diff_stats,
        conflicts,
        approvals,
        resolutions,
        merge_commit_hash: row.get("merge_commit_hash"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait::async_trait]
impl LockStore for PostgresStore {
    async fn try_acquire(&self, candidate: Lock, now: DateTime<Utc>) -> Result<AcquireOutcome> {
        let branch = candidate.resource_key.branch_name().to_string();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start lock transaction")?;

        // Serializes acquisitions per branch across every process sharing the table
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&branch)
            .execute(&mut *tx)
            .await
            .context("Failed to take branch advisory lock")?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM locks WHERE branch = $1 ORDER BY acquired_at",
            LOCK_COLUMNS
        ))
        .bind(&branch)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to read branch locks")?;

        let (stale, live): (Vec<Lock>, Vec<Lock>) = locks_from_rows(rows)?
            .into_iter()
            .filter(|held| held.conflicts_with(&candidate.resource_key, candidate.lock_type))
            .partition(|held| held.heartbeat_expired(now));

        if let Some(blocker) = live.into_iter().next() {
            tx.commit().await.context("Failed to finish lock transaction")?;
            return Ok(AcquireOutcome::Blocked(blocker));
        }

        if !stale.is_empty() {
            let stale_ids: Vec<String> = stale.iter().map(|lock| lock.id.clone()).collect();
            sqlx::query("DELETE FROM locks WHERE id = ANY($1)")
                .bind(&stale_ids)
                .execute(&mut *tx)
                .await
                .context("Failed to evict stale locks")?;
        }

        sqlx::query(
            r#"
            INSERT INTO locks (id, branch, scope, resource_key, lock_type, holder_id, session_id, acquired_at, ttl_seconds, last_heartbeat_at, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&candidate.id)
        .bind(&branch)
        .bind(candidate.scope().as_str())
        .bind(candidate.resource_key.storage_key())
        .bind(candidate.lock_type.as_str())
        .bind(&candidate.holder_id)
        .bind(&candidate.session_id)
        .bind(candidate.acquired_at)
        .bind(i64::try_from(candidate.ttl_seconds).unwrap_or(i64::MAX))
        .bind(candidate.last_heartbeat_at)
        .bind(candidate.state.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to insert lock")?;

        tx.commit().await.context("Failed to commit lock")?;

        Ok(AcquireOutcome::Acquired {
            lock: candidate,
            evicted: with_state(stale, LockState::Expired),
        })
    }

    async fn release(&self, lock_id: &Id) -> Result<Option<Lock>> {
        let row = sqlx::query(&format!(
            "DELETE FROM locks WHERE id = $1 RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to release lock")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut lock = lock_from_row(&row)?;
        lock.state = LockState::Released;
        Ok(Some(lock))
    }

    async fn get_lock(&self, lock_id: &Id) -> Result<Option<Lock>> {
        let row = sqlx::query(&format!("SELECT {} FROM locks WHERE id = $1", LOCK_COLUMNS))
            .bind(lock_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch lock")?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn find_overlapping(&self, key: &ResourceKey) -> Result<Vec<Lock>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM locks WHERE branch = $1 ORDER BY acquired_at",
            LOCK_COLUMNS
        ))
        .bind(key.branch_name())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branch locks")?;

        Ok(locks_from_rows(rows)?
            .into_iter()
            .filter(|lock| lock.resource_key.overlaps(key))
            .collect())
    }

    async fn renew(&self, lock_id: &Id, now: DateTime<Utc>) -> Result<Option<Lock>> {
        let row = sqlx::query(&format!(
            "UPDATE locks SET last_heartbeat_at = $2 WHERE id = $1 RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(lock_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to renew lock")?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn attach_session(&self, session_id: &Id) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to reserve a connection for the session")?;
        // Shared mode so a hash collision between two live sessions never blocks
        sqlx::query("SELECT pg_advisory_lock_shared($1, hashtext($2))")
            .bind(SESSION_LOCK_NAMESPACE)
            .bind(session_id)
            .execute(&mut *conn)
            .await
            .context("Failed to take session advisory lock")?;

        self.sessions.0.lock().insert(session_id.clone(), conn);
        Ok(())
    }

    async fn detach_session(&self, session_id: &Id) -> Result<()> {
        let conn = self.sessions.0.lock().remove(session_id);
        let Some(mut conn) = conn else {
            return Ok(());
        };

        let unlocked = sqlx::query("SELECT pg_advisory_unlock_shared($1, hashtext($2))")
            .bind(SESSION_LOCK_NAMESPACE)
            .bind(session_id)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // Closing the connection drops the advisory lock with it
            drop(conn.detach());
            return Err(e).context("Failed to release session advisory lock");
        }
        Ok(())
    }

    async fn list_reclaimable(
        &self,
        now: DateTime<Utc>,
        max_lifetime: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<Lock>> {
        // A session lock lives in pg_locks as (classid, objid, objsubid = 2),
        // with both keys stored as unsigned oids
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM locks
            WHERE last_heartbeat_at + ttl_seconds * INTERVAL '1 second' < $1
               OR acquired_at < $2
               OR (session_id IS NOT NULL AND NOT EXISTS (
                    SELECT 1 FROM pg_locks l
                    WHERE l.locktype = 'advisory'
                      AND l.granted
                      AND l.database = (SELECT oid FROM pg_database WHERE datname = current_database())
                      AND l.classid::text::bigint = $4
                      AND l.objid::text::bigint = (hashtext(locks.session_id)::bigint & 4294967295)
                      AND l.objsubid = 2
               ))
            ORDER BY last_heartbeat_at
            LIMIT $3
            "#,
            LOCK_COLUMNS
        ))
        .bind(now)
        .bind(now - max_lifetime)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::from(SESSION_LOCK_NAMESPACE))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expired locks")?;

        locks_from_rows(rows)
    }

    async fn reclaim(&self, lock: &Lock) -> Result<bool> {
        let result = sqlx::query("DELETE FROM locks WHERE id = $1 AND last_heartbeat_at = $2")
            .bind(&lock.id)
            .bind(lock.last_heartbeat_at)
            .execute(&self.pool)
            .await
            .context("Failed to reclaim lock")?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_session(&self, session_id: &Id) -> Result<Vec<Lock>> {
        let rows = sqlx::query(&format!(
            "DELETE FROM locks WHERE session_id = $1 RETURNING {}",
            LOCK_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to release session locks")?;

        Ok(with_state(locks_from_rows(rows)?, LockState::Released))
    }

    async fn list_locks(&self) -> Result<Vec<Lock>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM locks ORDER BY acquired_at",
            LOCK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list locks")?;

        locks_from_rows(rows)
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn get_branch(&self, name: &str) -> Result<Option<Branch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM branches WHERE name = $1",
            BRANCH_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch branch")?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn list_branches(&self) -> Result<Vec<Branch>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM branches ORDER BY created_at, name",
            BRANCH_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list branches")?;

        rows.iter().map(branch_from_row).collect()
    }

    async fn insert_branch(&self, branch: Branch) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO branches (name, from_branch, head_commit_hash, status, protection_rules, created_by, created_at, last_modified, commits_ahead, commits_behind, has_pending_changes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&branch.name)
        .bind(&branch.from_branch)
        .bind(&branch.head_commit_hash)
        .bind(branch.status.as_str())
        .bind(Json(&branch.protection_rules))
        .bind(&branch.created_by)
        .bind(branch.created_at)
        .bind(branch.last_modified)
        .bind(i32::try_from(branch.commits_ahead).unwrap_or(i32::MAX))
        .bind(i32::try_from(branch.commits_behind).unwrap_or(i32::MAX))
        .bind(branch.has_pending_changes)
        .execute(&self.pool)
        .await
        .context("Failed to insert branch")?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_head(&self, name: &str, head_commit_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE branches SET head_commit_hash = $2, last_modified = $3 WHERE name = $1",
        )
        .bind(name)
        .bind(head_commit_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update branch head")?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set_status(
        &self,
        name: &str,
        expected: BranchStatus,
        status: BranchStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE branches SET status = $3, last_modified = $4 WHERE name = $1 AND status = $2",
        )
        .bind(name)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update branch status")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_branch(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM branches WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("Failed to delete branch")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ProposalStore for PostgresStore {
    async fn get_proposal(&self, id: &Id) -> Result<Option<ChangeProposal>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM change_proposals WHERE id = $1",
            PROPOSAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch proposal")?;

        row.as_ref().map(proposal_from_row).transpose()
    }

    async fn list_proposals(&self) -> Result<Vec<ChangeProposal>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM change_proposals ORDER BY created_at",
            PROPOSAL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list proposals")?;

        rows.iter().map(proposal_from_row).collect()
    }

    async fn insert_proposal(&self, proposal: ChangeProposal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO change_proposals (id, title, description, source_branch, target_branch, status, diff_stats, conflicts, approvals, resolutions, merge_commit_hash, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&proposal.id)
        .bind(&proposal.title)
        .bind(&proposal.description)
        .bind(&proposal.source_branch)
        .bind(&proposal.target_branch)
        .bind(proposal.status.as_str())
        .bind(Json(&proposal.diff_stats))
        .bind(Json(&proposal.conflicts))
        .bind(Json(&proposal.approvals))
        .bind(Json(&proposal.resolutions))
        .bind(&proposal.merge_commit_hash)
        .bind(&proposal.created_by)
        .bind(proposal.created_at)
        .bind(proposal.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert proposal")?;

        Ok(())
    }

    async fn update_proposal(
        &self,
        proposal: ChangeProposal,
        expected_status: ProposalStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE change_proposals SET
                title = $2,
                description = $3,
                status = $4,
                diff_stats = $5,
                conflicts = $6,
                approvals = $7,
                resolutions = $8,
                merge_commit_hash = $9,
                updated_at = $10
            WHERE id = $1 AND status = $11 AND updated_at = $12
            "#,
        )
        .bind(&proposal.id)
        .bind(&proposal.title)
        .bind(&proposal.description)
        .bind(proposal.status.as_str())
        .bind(Json(&proposal.diff_stats))
        .bind(Json(&proposal.conflicts))
        .bind(Json(&proposal.approvals))
        .bind(Json(&proposal.resolutions))
        .bind(&proposal.merge_commit_hash)
        .bind(proposal.updated_at)
        .bind(expected_status.as_str())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to update proposal")?;

        Ok(result.rows_affected() == 1)
    }
}
