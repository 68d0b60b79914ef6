//! Bridge between canonical statuses and the legacy `cs:*` label scheme.
//!
//! Older tooling tracked changeset state purely through labels. The bridge
//! resolves any mix of canonical status and legacy labels into one canonical
//! view plus the label rewrite that makes the record self-consistent. It is
//! a pure function over its inputs; callers decide whether to apply the
//! rewrite.

use super::status::{PrState, WorkStatus};

pub const LABEL_READY: &str = "cs:ready";
pub const LABEL_IN_PROGRESS: &str = "cs:in_progress";
pub const LABEL_BLOCKED: &str = "cs:blocked";
pub const LABEL_MERGED: &str = "cs:merged";
pub const LABEL_ABANDONED: &str = "cs:abandoned";

/// Most specific first, terminal outcomes ahead of live ones. Derivation
/// picks the first present label.
pub const LEGACY_LABELS: [&str; 5] = [
    LABEL_MERGED,
    LABEL_ABANDONED,
    LABEL_BLOCKED,
    LABEL_IN_PROGRESS,
    LABEL_READY,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeResolution {
    /// The canonical status after resolution.
    pub status: WorkStatus,
    /// Status was derived from labels and must be written back.
    pub backfill_status: bool,
    /// PR outcome implied by a terminal label, to be recorded alongside the
    /// backfilled status.
    pub backfill_pr_state: Option<PrState>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl BridgeResolution {
    pub fn is_noop(&self) -> bool {
        !self.backfill_status && self.add_labels.is_empty() && self.remove_labels.is_empty()
    }
}

/// The single legacy label a canonical status maps to. `deferred` predates
/// nothing in the legacy scheme and maps to no label at all.
pub fn legacy_label_for(status: WorkStatus, pr_state: Option<PrState>) -> Option<&'static str> {
    match status {
        WorkStatus::Open => Some(LABEL_READY),
        WorkStatus::InProgress => Some(LABEL_IN_PROGRESS),
        WorkStatus::Blocked => Some(LABEL_BLOCKED),
        WorkStatus::Deferred => None,
        WorkStatus::Closed => match pr_state {
            Some(PrState::Abandoned) => Some(LABEL_ABANDONED),
            _ => Some(LABEL_MERGED),
        },
    }
}

fn derive_from_labels(labels: &[String]) -> (WorkStatus, Option<PrState>) {
    for candidate in LEGACY_LABELS {
        if labels.iter().any(|l| l == candidate) {
            return match candidate {
                LABEL_MERGED => (WorkStatus::Closed, Some(PrState::Merged)),
                LABEL_ABANDONED => (WorkStatus::Closed, Some(PrState::Abandoned)),
                LABEL_BLOCKED => (WorkStatus::Blocked, None),
                LABEL_IN_PROGRESS => (WorkStatus::InProgress, None),
                _ => (WorkStatus::Open, None),
            };
        }
    }
    (WorkStatus::Open, None)
}

/// Resolve status and labels into one canonical view.
///
/// When a status is present it is authoritative and the label set is
/// rewritten to match it exactly. When absent, the most specific legacy
/// label present decides, and the derived status is backfilled so
/// derivation happens at most once per record. Total over all inputs.
pub fn resolve(
    status: Option<WorkStatus>,
    labels: &[String],
    pr_state: Option<PrState>,
) -> BridgeResolution {
    let (resolved, backfill_status, backfill_pr_state) = match status {
        Some(s) => (s, false, None),
        None => {
            let (derived, implied_pr) = derive_from_labels(labels);
            (derived, true, implied_pr)
        }
    };

    let target = legacy_label_for(resolved, pr_state.or(backfill_pr_state));

    let mut add_labels = Vec::new();
    if let Some(target) = target {
        if !labels.iter().any(|l| l == target) {
            add_labels.push(target.to_string());
        }
    }

    let remove_labels: Vec<String> = labels
        .iter()
        .filter(|l| LEGACY_LABELS.contains(&l.as_str()) && Some(l.as_str()) != target)
        .cloned()
        .collect();

    BridgeResolution {
        status: resolved,
        backfill_status,
        backfill_pr_state,
        add_labels,
        remove_labels,
    }
}
