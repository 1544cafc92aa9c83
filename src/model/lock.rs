use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::model::{generate_id, Id};

/// Granularity a lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockScope {
    Branch,
    ResourceType,
    Resource,
}

impl LockScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockScope::Branch => "BRANCH",
            LockScope::ResourceType => "RESOURCE_TYPE",
            LockScope::Resource => "RESOURCE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BRANCH" => Some(LockScope::Branch),
            "RESOURCE_TYPE" => Some(LockScope::ResourceType),
            "RESOURCE" => Some(LockScope::Resource),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Indexing,
    Maintenance,
    Migration,
    Backup,
    Manual,
}

/// Pairwise compatibility, rows and columns in `LockType::ALL` order.
/// Adding a lock type means adding one row and one column here.
const COMPATIBILITY: [[bool; 5]; 5] = [
    // INDEXING  MAINTENANCE  MIGRATION  BACKUP  MANUAL
    [true, true, false, true, false],  // INDEXING
    [true, true, false, true, false],  // MAINTENANCE
    [false, false, false, false, false], // MIGRATION
    [true, true, false, true, false],  // BACKUP
    [false, false, false, false, false], // MANUAL
];

impl LockType {
    pub const ALL: [LockType; 5] = [
        LockType::Indexing,
        LockType::Maintenance,
        LockType::Migration,
        LockType::Backup,
        LockType::Manual,
    ];

    fn index(self) -> usize {
        match self {
            LockType::Indexing => 0,
            LockType::Maintenance => 1,
            LockType::Migration => 2,
            LockType::Backup => 3,
            LockType::Manual => 4,
        }
    }

    /// Whether a lock of this type may be held alongside `other` on an overlapping key
    pub fn is_compatible_with(self, other: LockType) -> bool {
        COMPATIBILITY[self.index()][other.index()]
    }

    /// Exclusive types conflict with every other type, themselves included
    pub fn is_exclusive(self) -> bool {
        LockType::ALL
            .iter()
            .all(|other| !self.is_compatible_with(*other))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Indexing => "INDEXING",
            LockType::Maintenance => "MAINTENANCE",
            LockType::Migration => "MIGRATION",
            LockType::Backup => "BACKUP",
            LockType::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        LockType::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TYPE_MARKER: &str = "/type:";
const RESOURCE_MARKER: &str = "/resource:";

/// What a lock covers. The scope is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKey {
    Branch {
        branch: String,
    },
    ResourceType {
        branch: String,
        resource_type: String,
    },
    Resource {
        branch: String,
        resource_id: String,
    },
}

impl ResourceKey {
    pub fn branch(name: impl Into<String>) -> Self {
        ResourceKey::Branch {
            branch: name.into(),
        }
    }

    pub fn resource_type(branch: impl Into<String>, resource_type: impl Into<String>) -> Self {
        ResourceKey::ResourceType {
            branch: branch.into(),
            resource_type: resource_type.into(),
        }
    }

    pub fn resource(branch: impl Into<String>, resource_id: impl Into<String>) -> Self {
        ResourceKey::Resource {
            branch: branch.into(),
            resource_id: resource_id.into(),
        }
    }

    pub fn scope(&self) -> LockScope {
        match self {
            ResourceKey::Branch { .. } => LockScope::Branch,
            ResourceKey::ResourceType { .. } => LockScope::ResourceType,
            ResourceKey::Resource { .. } => LockScope::Resource,
        }
    }

    pub fn branch_name(&self) -> &str {
        match self {
            ResourceKey::Branch { branch }
            | ResourceKey::ResourceType { branch, .. }
            | ResourceKey::Resource { branch, .. } => branch,
        }
    }

    /// Keys overlap when they share a branch and either one covers the whole
    /// branch or both name exactly the same thing.
    pub fn overlaps(&self, other: &ResourceKey) -> bool {
        if self.branch_name() != other.branch_name() {
            return false;
        }
        self.scope() == LockScope::Branch || other.scope() == LockScope::Branch || self == other
    }

    /// Stable string form used as the `resource_key` column
    pub fn storage_key(&self) -> String {
        match self {
            ResourceKey::Branch { branch } => branch.clone(),
            ResourceKey::ResourceType {
                branch,
                resource_type,
            } => format!("{}{}{}", branch, TYPE_MARKER, resource_type),
            ResourceKey::Resource {
                branch,
                resource_id,
            } => format!("{}{}{}", branch, RESOURCE_MARKER, resource_id),
        }
    }

    pub fn from_storage(scope: LockScope, key: &str) -> Option<Self> {
        match scope {
            LockScope::Branch => Some(ResourceKey::branch(key)),
            LockScope::ResourceType => key
                .rsplit_once(TYPE_MARKER)
                .map(|(branch, resource_type)| ResourceKey::resource_type(branch, resource_type)),
            LockScope::Resource => key
                .rsplit_once(RESOURCE_MARKER)
                .map(|(branch, resource_id)| ResourceKey::resource(branch, resource_id)),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope().as_str(), self.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Active,
    Expired,
    Released,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Active => "ACTIVE",
            LockState::Expired => "EXPIRED",
            LockState::Released => "RELEASED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(LockState::Active),
            "EXPIRED" => Some(LockState::Expired),
            "RELEASED" => Some(LockState::Released),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub id: Id,
    pub resource_key: ResourceKey,
    pub lock_type: LockType,
    pub holder_id: String,
    /// Holder session; every lock of a session is released when the session ends
    pub session_id: Option<Id>,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub state: LockState,
}

impl Lock {
    pub fn new(request: &LockRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_id(),
            resource_key: request.resource_key.clone(),
            lock_type: request.lock_type,
            holder_id: request.holder_id.clone(),
            session_id: request.session_id.clone(),
            acquired_at: now,
            ttl_seconds: request.ttl_seconds,
            last_heartbeat_at: now,
            state: LockState::Active,
        }
    }

    pub fn scope(&self) -> LockScope {
        self.resource_key.scope()
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX / 1000))
    }

    /// Would a request for `lock_type` on `key` be blocked by this lock?
    pub fn conflicts_with(&self, key: &ResourceKey, lock_type: LockType) -> bool {
        self.resource_key.overlaps(key) && !self.lock_type.is_compatible_with(lock_type)
    }

    pub fn heartbeat_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat_at > self.ttl()
    }

    pub fn lifetime_exceeded(&self, now: DateTime<Utc>, max_lifetime: chrono::Duration) -> bool {
        now - self.acquired_at > max_lifetime
    }

    pub fn is_reclaimable(&self, now: DateTime<Utc>, max_lifetime: chrono::Duration) -> bool {
        self.heartbeat_expired(now) || self.lifetime_exceeded(now, max_lifetime)
    }

    pub fn handle(&self) -> LockHandle {
        LockHandle {
            lock_id: self.id.clone(),
            resource_key: self.resource_key.clone(),
            lock_type: self.lock_type,
            holder_id: self.holder_id.clone(),
            ttl_seconds: self.ttl_seconds,
        }
    }
}

/// Returned to the holder on acquisition; all further calls go through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_id: Id,
    pub resource_key: ResourceKey,
    pub lock_type: LockType,
    pub holder_id: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub resource_key: ResourceKey,
    pub lock_type: LockType,
    pub holder_id: String,
    pub ttl_seconds: u64,
    /// Zero means a single attempt
    pub acquire_timeout: Duration,
    pub session_id: Option<Id>,
}

impl LockRequest {
    pub fn new(resource_key: ResourceKey, lock_type: LockType, holder_id: impl Into<String>) -> Self {
        Self {
            resource_key,
            lock_type,
            holder_id: holder_id.into(),
            ttl_seconds: 30,
            acquire_timeout: Duration::ZERO,
            session_id: None,
        }
    }

    pub fn with_ttl_secs(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn in_session(mut self, session_id: impl Into<Id>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
