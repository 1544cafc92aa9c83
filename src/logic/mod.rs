pub mod branch_ops;
pub mod branch_state;
pub mod diff;
pub mod heartbeat;
pub mod lock_coordinator;
pub mod merge;
pub mod reaper;

pub use branch_ops::{
    BranchOperations, CreateBranchRequest, CreateProposalRequest, MergeRequest, RebaseRequest,
};
pub use branch_state::BranchStateManager;
pub use diff::{DiffEngine, Side};
pub use heartbeat::{HeartbeatHealth, HeartbeatMonitor, KeepAlive};
pub use lock_coordinator::{
    CoordinatorSettings, LockCoordinator, LockReleaseListener, LockSession, ReleaseStatus,
};
pub use merge::{MergeExecutor, MergePlan};
pub use reaper::{CleanupReaper, ReapReport, ReaperHandle, ReaperSettings};
