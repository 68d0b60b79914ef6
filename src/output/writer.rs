use std::io::{self, Write};

use serde::Serialize;

use crate::cli::{EpicView, OutputFormat};
use crate::integrate::IntegrationOutcome;
use crate::lifecycle::resolve_record;

/// Output writer for the machine-readable formats.
///
/// Text rendering belongs to [`Display`](crate::cli::Display); this type
/// emits exactly one JSON object per invocation so output stays parseable
/// by callers piping the CLI.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the configured output format.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Emit a simple message.
    pub fn emit_message(&self, message: &str) {
        match self.format {
            OutputFormat::Text => {
                println!("{}", message);
            }
            OutputFormat::Json => {
                self.write_json(&MessageOutput {
                    message: message.to_string(),
                });
            }
        }
    }

    /// Emit a structured result.
    pub fn emit<T: Serialize>(&self, value: &T) {
        self.write_json(value);
    }

    fn write_json<T: Serialize>(&self, value: &T) {
        if let Ok(json) = serde_json::to_string(value) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct MessageOutput {
    message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutput {
    pub id: String,
    pub agent: String,
    pub kind: String,
    pub status: String,
    pub root_branch: Option<String>,
    pub work_branch: Option<String>,
    pub worktree: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchOutput {
    pub changeset_id: String,
    pub epic_id: String,
    pub branch: String,
    pub created: bool,
    pub worktree: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrateOutput {
    pub id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub outcome: IntegrationOutcome,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpicStatusOutput {
    pub id: String,
    pub title: String,
    pub status: String,
    pub assignee: Option<String>,
    pub root_branch: Option<String>,
    pub worktree: Option<String>,
    pub changesets: Vec<ChangesetStatusOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangesetStatusOutput {
    pub id: String,
    pub title: String,
    pub status: String,
    pub branch: Option<String>,
}

impl From<&EpicView> for EpicStatusOutput {
    fn from(view: &EpicView) -> Self {
        Self {
            id: view.epic.id.clone(),
            title: view.epic.title.clone(),
            status: resolve_record(&view.epic).status.to_string(),
            assignee: view.epic.assignee.clone(),
            root_branch: view.mapping.as_ref().map(|m| m.root_branch.clone()),
            worktree: view.mapping.as_ref().map(|m| m.worktree_path.clone()),
            changesets: view
                .changesets
                .iter()
                .map(|c| ChangesetStatusOutput {
                    id: c.id.clone(),
                    title: c.title.clone(),
                    status: resolve_record(c).status.to_string(),
                    branch: view
                        .mapping
                        .as_ref()
                        .and_then(|m| m.changesets.get(&c.id).cloned()),
                })
                .collect(),
        }
    }
}
