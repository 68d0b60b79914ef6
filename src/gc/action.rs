//! Reconciliation actions as inspectable values.
//!
//! Scanners emit these; nothing is mutated until the invoking layer applies
//! them. Keeping actions as plain data makes dry-run output a straight dump
//! of the pending list.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::lifecycle::{PrState, WorkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleHookReason {
    LeaseExpired,
    HeartbeatStale,
    ProcessDead,
    MissingHeartbeat,
}

impl fmt::Display for StaleHookReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StaleHookReason::LeaseExpired => "lease expired",
            StaleHookReason::HeartbeatStale => "heartbeat stale",
            StaleHookReason::ProcessDead => "owning process not running",
            StaleHookReason::MissingHeartbeat => "no heartbeat recorded",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GcAction {
    /// Release an agent's epic hook and reopen the epic.
    ReleaseStaleHook {
        agent_id: String,
        epic_id: String,
        reason: StaleHookReason,
    },
    /// Remove a worktree whose epic no longer resolves in the issue store.
    RemoveOrphanWorktree {
        epic_id: String,
        path: PathBuf,
        dirty: bool,
    },
    /// Drop a mapping file whose epic is gone and whose worktrees are too.
    RemoveStaleMapping { epic_id: String },
    /// Delete a resolved epic's branches and worktrees. Only emitted once
    /// every listed branch is proven integrated into the parent.
    PruneEpicArtifacts {
        epic_id: String,
        parent_branch: String,
        worktrees: Vec<PathBuf>,
        branches: Vec<String>,
        delete_remote: bool,
    },
    /// Rewrite legacy labels (and backfill status fields) to the canonical
    /// scheme. `tombstone` closes a record whose metadata already says its
    /// PR merged.
    NormalizeStatus {
        issue_id: String,
        set_status: Option<WorkStatus>,
        set_pr_state: Option<PrState>,
        add_labels: Vec<String>,
        remove_labels: Vec<String>,
        tombstone: bool,
    },
    /// Clear an expired queue claim, leaving the message itself in place.
    ExpireQueueClaim {
        message_id: String,
        claimed_by: Option<String>,
    },
    /// Close a channel message past its expiry or retention window.
    CloseExpiredMessage { message_id: String, reason: String },
}

impl GcAction {
    /// Actions that delete git state need confirmation or `--yes`.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            GcAction::RemoveOrphanWorktree { .. } | GcAction::PruneEpicArtifacts { .. }
        )
    }

    /// One-line summary for listings and confirmation prompts.
    pub fn describe(&self) -> String {
        match self {
            GcAction::ReleaseStaleHook {
                agent_id,
                epic_id,
                reason,
            } => format!("release {}'s hook on {} ({})", agent_id, epic_id, reason),
            GcAction::RemoveOrphanWorktree { epic_id, path, dirty } => {
                let suffix = if *dirty { " [DIRTY]" } else { "" };
                format!(
                    "remove orphan worktree {} (epic {} unresolvable){}",
                    path.display(),
                    epic_id,
                    suffix
                )
            }
            GcAction::RemoveStaleMapping { epic_id } => {
                format!("remove stale mapping for vanished epic {}", epic_id)
            }
            GcAction::PruneEpicArtifacts {
                epic_id,
                parent_branch,
                worktrees,
                branches,
                ..
            } => format!(
                "prune epic {}: {} branch(es), {} worktree(s), all proven in {}",
                epic_id,
                branches.len(),
                worktrees.len(),
                parent_branch
            ),
            GcAction::NormalizeStatus {
                issue_id,
                tombstone,
                add_labels,
                remove_labels,
                ..
            } => {
                if *tombstone {
                    format!("close tombstone {} (PR already merged)", issue_id)
                } else {
                    format!(
                        "normalize labels on {} (+{} -{})",
                        issue_id,
                        add_labels.len(),
                        remove_labels.len()
                    )
                }
            }
            GcAction::ExpireQueueClaim {
                message_id,
                claimed_by,
            } => format!(
                "expire queue claim on {} (held by {})",
                message_id,
                claimed_by.as_deref().unwrap_or("unknown")
            ),
            GcAction::CloseExpiredMessage { message_id, reason } => {
                format!("close expired message {} ({})", message_id, reason)
            }
        }
    }
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
