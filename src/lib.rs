pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use config::AppConfig;
pub use error::{BranchLockError, Result};

pub use logic::{
    BranchOperations, CleanupReaper, CreateBranchRequest, CreateProposalRequest, LockCoordinator,
    LockSession, MergeRequest, RebaseRequest, ReaperHandle,
};

// Export all model types
pub use model::*;

pub use store::{
    DocumentStore, LockStore, MemoryDocumentStore, MemoryStore, PostgresStore, Store,
};
