//! Branch integration engine.
//!
//! Lands a root branch into its parent under compare-and-swap ref updates
//! and proves integration even across history rewrites. The engine moves
//! refs; deciding what the proof means for issue state is the caller's job.

mod engine;
mod signal;

pub use engine::{IntegrationEngine, IntegrationOutcome, NoOpReason};
pub use signal::{ChangesetRefs, Evidence, IntegrationSignal};

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How history is shaped when a root branch lands in its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Rebase root onto parent, then fast-forward parent to the new head.
    #[default]
    Rebase,
    /// Merge root into parent with a merge commit.
    Merge,
    /// Collapse root into a single authored commit on parent.
    Squash,
}

impl HistoryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rebase => "rebase",
            Self::Merge => "merge",
            Self::Squash => "squash",
        }
    }
}

impl fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
