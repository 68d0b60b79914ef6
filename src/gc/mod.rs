//! Reconciliation: scanners that detect drift between the issue store, the
//! ref graph, and the filesystem, and typed actions to repair it.

mod action;
mod engine;
mod hooks;
mod labels;
mod messages;
mod prune;
mod worktrees;

pub use action::{GcAction, StaleHookReason};
pub use engine::{ApplyResult, GcApplySummary, GcEngine, GcReport};
pub use messages::{
    KEY_CLAIMED_AT, KEY_CLAIMED_BY, KEY_MESSAGE_EXPIRES_AT, LABEL_CHANNEL, LABEL_QUEUE,
};
