//! Shared fixtures: an in-memory issue store and throwaway git repositories.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crew_pilot::issue::{IssueFilter, IssueRecord, IssueStore, IssueUpdate};
use crew_pilot::lifecycle::WorkStatus;
use crew_pilot::Result;

/// In-memory [`IssueStore`] that mirrors the CLI's update semantics so the
/// engines under test behave exactly as they do against the real store.
#[derive(Default)]
pub struct FakeIssueStore {
    records: Mutex<BTreeMap<String, IssueRecord>>,
}

impl FakeIssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: IssueRecord) {
        let mut records = self.records.lock().expect("store lock");
        records.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<IssueRecord> {
        self.records.lock().expect("store lock").get(id).cloned()
    }
}

#[async_trait]
impl IssueStore for FakeIssueStore {
    async fn show(&self, id: &str) -> Result<Option<IssueRecord>> {
        Ok(self.get(id))
    }

    async fn list(&self, filter: &IssueFilter) -> Result<Vec<IssueRecord>> {
        let records = self.records.lock().expect("store lock");
        Ok(records
            .values()
            .filter(|r| {
                if !filter.include_closed && r.work_status() == Some(WorkStatus::Closed) {
                    return false;
                }
                filter.label.as_deref().is_none_or(|l| r.has_label(l))
                    && filter
                        .status
                        .as_deref()
                        .is_none_or(|s| r.status.as_deref() == Some(s))
                    && filter
                        .issue_type
                        .as_deref()
                        .is_none_or(|t| r.issue_type.as_deref() == Some(t))
            })
            .cloned()
            .collect())
    }

    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()> {
        let mut records = self.records.lock().expect("store lock");
        let Some(record) = records.get_mut(id) else {
            panic!("update for unknown record {}", id);
        };
        if let Some(status) = update.status {
            record.status = Some(status.as_str().to_string());
        }
        if let Some(assignee) = update.assignee {
            record.assignee = assignee;
        }
        for label in update.add_labels {
            if !record.labels.contains(&label) {
                record.labels.push(label);
            }
        }
        record.labels.retain(|l| !update.remove_labels.contains(l));
        if let Some(notes) = update.append_notes {
            if record.notes.is_empty() {
                record.notes = notes;
            } else {
                record.notes.push('\n');
                record.notes.push_str(&notes);
            }
        }
        if let Some(description) = update.description {
            record.description = description;
        }
        record.updated_at = Some(Utc::now());
        Ok(())
    }
}

/// Minimal record of the given type and status, timestamps set to now.
pub fn record(id: &str, issue_type: &str, status: WorkStatus) -> IssueRecord {
    let now = Utc::now();
    IssueRecord {
        id: id.to_string(),
        title: format!("{} work item", id),
        status: Some(status.as_str().to_string()),
        issue_type: Some(issue_type.to_string()),
        created_at: Some(now),
        updated_at: Some(now),
        ..IssueRecord::default()
    }
}

/// A throwaway git repository with one seed commit on `main`.
pub struct GitRepo {
    dir: TempDir,
}

impl GitRepo {
    pub fn init() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        git(dir.path(), &["init", "-q", "-b", "main"]);
        git(dir.path(), &["config", "user.email", "crew@example.test"]);
        git(dir.path(), &["config", "user.name", "Crew Fixture"]);
        git(dir.path(), &["config", "commit.gpgsign", "false"]);
        let repo = Self { dir };
        repo.commit_file("README.md", "seed\n", "initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` to `name`, commit it, and return the new head sha.
    pub fn commit_file(&self, name: &str, content: &str, message: &str) -> String {
        commit_file_in(self.dir.path(), name, content, message)
    }

    pub fn branch(&self, name: &str) {
        git(self.dir.path(), &["branch", name]);
    }

    pub fn checkout(&self, rev: &str) {
        git(self.dir.path(), &["checkout", "-q", rev]);
    }

    pub fn checkout_new(&self, name: &str) {
        git(self.dir.path(), &["checkout", "-q", "-b", name]);
    }

    pub fn sha(&self, rev: &str) -> String {
        git_stdout(self.dir.path(), &["rev-parse", rev])
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        let refname = format!("refs/heads/{}", name);
        Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &refname])
            .current_dir(self.dir.path())
            .status()
            .expect("run git")
            .success()
    }
}

/// Commit a file inside an arbitrary worktree and return the new head sha.
pub fn commit_file_in(dir: &Path, name: &str, content: &str, message: &str) -> String {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&path, content).expect("write file");
    git(dir, &["add", "--", name]);
    git(dir, &["commit", "-q", "-m", message]);
    git_stdout(dir, &["rev-parse", "HEAD"])
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
