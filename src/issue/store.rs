use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CrewError, Result};
use crate::lifecycle::WorkStatus;

use super::record::IssueRecord;

/// Mutation batch for one issue. Maps 1:1 onto the store CLI's update flags;
/// an empty update is a no-op and never shells out.
#[derive(Debug, Default, Clone)]
pub struct IssueUpdate {
    pub status: Option<WorkStatus>,
    /// `Some(None)` clears the assignee.
    pub assignee: Option<Option<String>>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub append_notes: Option<String>,
    pub description: Option<String>,
}

impl IssueUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(Some(assignee.to_string()));
        self
    }

    pub fn clear_assignee(mut self) -> Self {
        self.assignee = Some(None);
        self
    }

    pub fn add_label(mut self, label: &str) -> Self {
        self.add_labels.push(label.to_string());
        self
    }

    pub fn remove_label(mut self, label: &str) -> Self {
        self.remove_labels.push(label.to_string());
        self
    }

    pub fn append_notes(mut self, notes: &str) -> Self {
        self.append_notes = Some(notes.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assignee.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.append_notes.is_none()
            && self.description.is_none()
    }
}

#[derive(Debug, Default, Clone)]
pub struct IssueFilter {
    pub label: Option<String>,
    pub status: Option<String>,
    pub issue_type: Option<String>,
    /// Include closed records (the CLI hides them by default).
    pub include_closed: bool,
}

impl IssueFilter {
    pub fn all() -> Self {
        Self {
            include_closed: true,
            ..Self::default()
        }
    }

    pub fn by_type(issue_type: &str) -> Self {
        Self {
            issue_type: Some(issue_type.to_string()),
            ..Self::default()
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn include_closed(mut self) -> Self {
        self.include_closed = true;
        self
    }
}

/// Issue store operations the orchestrator needs. The production impl shells
/// out to the configured CLI; tests swap in an in-memory fake.
#[async_trait]
pub trait IssueStore: Send + Sync {
    async fn show(&self, id: &str) -> Result<Option<IssueRecord>>;
    async fn list(&self, filter: &IssueFilter) -> Result<Vec<IssueRecord>>;
    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()>;
}

/// Production issue store: the `bd`-compatible CLI with `--json` output.
pub struct IssueCli {
    bin: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl IssueCli {
    pub fn new(bin: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!(bin = %self.bin, args = ?args, "Running issue store command");

        let child = Command::new(&self.bin)
            .args(args)
            .current_dir(&self.working_dir)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CrewError::DependencyMissing {
                        tool: self.bin.clone(),
                        hint: "Install the issue store CLI or set issues.bin in config.toml."
                            .to_string(),
                    }
                } else {
                    CrewError::Io(e)
                }
            })?,
            Err(_) => {
                return Err(CrewError::external(
                    &self.bin,
                    args,
                    "timeout".to_string(),
                    format!("no response within {}s", self.timeout.as_secs()),
                ));
            }
        };

        Ok(output)
    }

    async fn exec_checked(&self, args: &[String]) -> Result<Output> {
        let output = self.exec(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CrewError::external(
                &self.bin,
                args,
                output.status.to_string(),
                stderr.trim().to_string(),
            ));
        }
        Ok(output)
    }
}

#[async_trait]
impl IssueStore for IssueCli {
    async fn show(&self, id: &str) -> Result<Option<IssueRecord>> {
        let args = vec!["show".to_string(), id.to_string(), "--json".to_string()];
        let output = self.exec(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("not found") {
                return Ok(None);
            }
            return Err(CrewError::external(
                &self.bin,
                &args,
                output.status.to_string(),
                stderr.trim().to_string(),
            ));
        }

        let record: IssueRecord = serde_json::from_slice(&output.stdout)?;
        Ok(Some(record))
    }

    async fn list(&self, filter: &IssueFilter) -> Result<Vec<IssueRecord>> {
        let mut args = vec!["list".to_string(), "--json".to_string()];
        if let Some(label) = &filter.label {
            args.push("--label".to_string());
            args.push(label.clone());
        }
        if let Some(status) = &filter.status {
            args.push("--status".to_string());
            args.push(status.clone());
        }
        if let Some(issue_type) = &filter.issue_type {
            args.push("--type".to_string());
            args.push(issue_type.clone());
        }
        if filter.include_closed {
            args.push("--all".to_string());
        }

        let output = self.exec_checked(&args).await?;
        if output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        let records: Vec<IssueRecord> = serde_json::from_slice(&output.stdout)?;
        Ok(records)
    }

    async fn update(&self, id: &str, update: IssueUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut args = vec!["update".to_string(), id.to_string()];
        if let Some(status) = update.status {
            args.push("--status".to_string());
            args.push(status.as_str().to_string());
        }
        if let Some(assignee) = update.assignee {
            args.push("--assignee".to_string());
            args.push(assignee.unwrap_or_default());
        }
        for label in &update.add_labels {
            args.push("--add-label".to_string());
            args.push(label.clone());
        }
        for label in &update.remove_labels {
            args.push("--remove-label".to_string());
            args.push(label.clone());
        }
        if let Some(notes) = update.append_notes {
            args.push("--append-notes".to_string());
            args.push(notes);
        }
        if let Some(description) = update.description {
            args.push("--description".to_string());
            args.push(description);
        }

        self.exec_checked(&args).await?;
        Ok(())
    }
}
