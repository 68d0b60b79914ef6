//! Planner worktree synchronization.

mod lock;
mod service;
mod state;

pub use lock::{SyncLockGuard, SyncLockInfo, SyncLocker};
pub use service::{PlannerSyncService, SyncCore, SyncOutcome, SyncTrigger};
pub use state::{SyncState, FAILURE_WARN_THRESHOLD, RESULT_DIRTY, RESULT_FAILED, RESULT_SYNCED};
