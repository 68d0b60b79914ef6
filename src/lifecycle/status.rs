use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical lifecycle status shared by epics and changesets.
///
/// `closed` subsumes both merged and abandoned outcomes; the companion
/// [`PrState`] metadata distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
}

impl WorkStatus {
    pub fn allowed_transitions(&self) -> &'static [WorkStatus] {
        use WorkStatus::*;
        match self {
            Open => &[InProgress, Blocked, Deferred, Closed],
            InProgress => &[Open, Blocked, Deferred, Closed],
            Blocked => &[Open, InProgress, Deferred, Closed],
            Deferred => &[Open, Closed],
            Closed => &[],
        }
    }

    pub fn can_transition_to(&self, target: WorkStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Closed)
    }

    /// Statuses under which an epic accepts (further) claims.
    pub fn is_claimable(&self) -> bool {
        matches!(self, WorkStatus::Open | WorkStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "deferred" => Some(Self::Deferred),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a closed changeset ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Merged,
    Abandoned,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "merged" => Some(Self::Merged),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: WorkStatus,
    pub to: WorkStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl StatusTransition {
    pub fn new(from: WorkStatus, to: WorkStatus, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(WorkStatus::Open.can_transition_to(WorkStatus::InProgress));
        assert!(WorkStatus::InProgress.can_transition_to(WorkStatus::Blocked));
        assert!(WorkStatus::Blocked.can_transition_to(WorkStatus::InProgress));
        assert!(WorkStatus::Deferred.can_transition_to(WorkStatus::Open));
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(WorkStatus::Closed.is_terminal());
        assert!(WorkStatus::Closed.allowed_transitions().is_empty());
        assert!(!WorkStatus::Closed.can_transition_to(WorkStatus::Open));
    }

    #[test]
    fn test_deferred_is_not_claimable() {
        assert!(WorkStatus::Open.is_claimable());
        assert!(WorkStatus::InProgress.is_claimable());
        assert!(!WorkStatus::Deferred.is_claimable());
        assert!(!WorkStatus::Closed.is_claimable());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            WorkStatus::Open,
            WorkStatus::InProgress,
            WorkStatus::Blocked,
            WorkStatus::Deferred,
            WorkStatus::Closed,
        ] {
            assert_eq!(WorkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkStatus::parse("nonsense"), None);
    }
}
