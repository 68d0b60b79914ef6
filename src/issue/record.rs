//! Issue records and the description metadata side-channel.
//!
//! The issue store keeps structured orchestration state as `key: value`
//! lines inside the free-text description field. Keys are dotted and
//! namespaced (`planner_sync.last_result`, `hook.epic_id`); the helpers
//! here are pure so every consumer rewrites descriptions the same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::WorkStatus;

/// Issue types this crate cares about. Anything else passes through GC
/// normalization untouched.
pub const TYPE_EPIC: &str = "epic";
pub const TYPE_AGENT: &str = "agent";
pub const TYPE_MESSAGE: &str = "message";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, rename = "type")]
    pub issue_type: Option<String>,
    #[serde(default, rename = "dependencies")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IssueRecord {
    /// Canonical status when the raw status field parses as one.
    pub fn work_status(&self) -> Option<WorkStatus> {
        self.status.as_deref().and_then(WorkStatus::parse)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_type(&self, issue_type: &str) -> bool {
        self.issue_type.as_deref() == Some(issue_type)
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        meta_get(&self.description, key)
    }

    pub fn meta_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.meta(key)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Look up a `key: value` line in a description.
pub fn meta_get(description: &str, key: &str) -> Option<String> {
    description.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() == key {
            Some(v.trim().to_string())
        } else {
            None
        }
    })
}

/// Replace or append a `key: value` line, preserving everything else.
pub fn meta_upsert(description: &str, key: &str, value: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;

    for line in description.lines() {
        let is_match = line
            .split_once(':')
            .map(|(k, _)| k.trim() == key)
            .unwrap_or(false);
        if is_match {
            lines.push(format!("{}: {}", key, value));
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !replaced {
        lines.push(format!("{}: {}", key, value));
    }

    lines.join("\n")
}

/// Drop a key's line entirely.
pub fn meta_remove(description: &str, key: &str) -> String {
    description
        .lines()
        .filter(|line| {
            !line
                .split_once(':')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply a batch of upserts/removes in one pass. `None` removes the key.
pub fn meta_apply(description: &str, changes: &[(String, Option<String>)]) -> String {
    let mut out = description.to_string();
    for (key, value) in changes {
        out = match value {
            Some(v) => meta_upsert(&out, key, v),
            None => meta_remove(&out, key),
        };
    }
    out
}
