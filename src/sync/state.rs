//! Persistent sync bookkeeping, stored as metadata on the agent's own
//! issue record so it survives restarts without a separate state file.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::issue::{meta_apply, meta_get, IssueRecord};

pub const KEY_LAST_SYNCED_SHA: &str = "planner_sync.last_synced_sha";
pub const KEY_LAST_SYNCED_AT: &str = "planner_sync.last_synced_at";
pub const KEY_LAST_ATTEMPT_AT: &str = "planner_sync.last_attempt_at";
pub const KEY_LAST_RESULT: &str = "planner_sync.last_result";
pub const KEY_DEFAULT_BRANCH: &str = "planner_sync.default_branch";
pub const KEY_CONSECUTIVE_FAILURES: &str = "planner_sync.consecutive_failures";
pub const KEY_DIRTY_SINCE_AT: &str = "planner_sync.dirty_since_at";
pub const KEY_LAST_DIRTY_WARNING_AT: &str = "planner_sync.last_dirty_warning_at";
pub const KEY_LAST_EVENT_ATTEMPT_AT: &str = "planner_sync.last_event_attempt_at";

pub const RESULT_SYNCED: &str = "synced";
pub const RESULT_DIRTY: &str = "dirty";
pub const RESULT_FAILED: &str = "failed";

/// Failure count at which a single escalation warning is emitted.
pub const FAILURE_WARN_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub last_synced_sha: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub default_branch: Option<String>,
    pub consecutive_failures: u32,
    pub dirty_since_at: Option<DateTime<Utc>>,
    pub last_dirty_warning_at: Option<DateTime<Utc>>,
    pub last_event_attempt_at: Option<DateTime<Utc>>,
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|v| v.parse::<DateTime<Utc>>().ok())
}

impl SyncState {
    pub fn from_record(record: &IssueRecord) -> Self {
        let desc = record.description.as_str();
        Self {
            last_synced_sha: meta_get(desc, KEY_LAST_SYNCED_SHA),
            last_synced_at: parse_time(meta_get(desc, KEY_LAST_SYNCED_AT)),
            last_attempt_at: parse_time(meta_get(desc, KEY_LAST_ATTEMPT_AT)),
            last_result: meta_get(desc, KEY_LAST_RESULT),
            default_branch: meta_get(desc, KEY_DEFAULT_BRANCH),
            consecutive_failures: meta_get(desc, KEY_CONSECUTIVE_FAILURES)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            dirty_since_at: parse_time(meta_get(desc, KEY_DIRTY_SINCE_AT)),
            last_dirty_warning_at: parse_time(meta_get(desc, KEY_LAST_DIRTY_WARNING_AT)),
            last_event_attempt_at: parse_time(meta_get(desc, KEY_LAST_EVENT_ATTEMPT_AT)),
        }
    }

    /// Render the state back into a record description, superseding prior
    /// values in place.
    pub fn apply_to(&self, description: &str) -> String {
        let time = |t: &Option<DateTime<Utc>>| t.map(|v| v.to_rfc3339());
        let updates = vec![
            (KEY_LAST_SYNCED_SHA.to_string(), self.last_synced_sha.clone()),
            (KEY_LAST_SYNCED_AT.to_string(), time(&self.last_synced_at)),
            (KEY_LAST_ATTEMPT_AT.to_string(), time(&self.last_attempt_at)),
            (KEY_LAST_RESULT.to_string(), self.last_result.clone()),
            (KEY_DEFAULT_BRANCH.to_string(), self.default_branch.clone()),
            (
                KEY_CONSECUTIVE_FAILURES.to_string(),
                Some(self.consecutive_failures.to_string()),
            ),
            (KEY_DIRTY_SINCE_AT.to_string(), time(&self.dirty_since_at)),
            (
                KEY_LAST_DIRTY_WARNING_AT.to_string(),
                time(&self.last_dirty_warning_at),
            ),
            (
                KEY_LAST_EVENT_ATTEMPT_AT.to_string(),
                time(&self.last_event_attempt_at),
            ),
        ];
        meta_apply(description, &updates)
    }

    /// Delay imposed before the next non-forced attempt may start.
    pub fn backoff(&self) -> Duration {
        match self.consecutive_failures {
            0 | 1 => Duration::ZERO,
            2 => Duration::from_secs(120),
            _ => Duration::from_secs(300),
        }
    }

    /// Remaining backoff at `now`, if any.
    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let backoff = self.backoff();
        if backoff.is_zero() {
            return None;
        }
        let last = self.last_attempt_at?;
        let elapsed = now.signed_duration_since(last).to_std().ok()?;
        if elapsed < backoff {
            Some(backoff - elapsed)
        } else {
            None
        }
    }

    /// True when the current dirty episode has already produced its warning.
    pub fn warned_for_dirty_episode(&self) -> bool {
        match (self.dirty_since_at, self.last_dirty_warning_at) {
            (Some(since), Some(warned)) => warned >= since,
            _ => false,
        }
    }
}
