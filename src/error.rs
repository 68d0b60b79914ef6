use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrewError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Required tool not found: {tool}. {hint}")]
    DependencyMissing { tool: String, hint: String },

    #[error("{program} {args} failed ({status}): {stderr}")]
    ExternalCommand {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },

    #[error("Policy blocked: {0}")]
    PolicyBlocked(String),

    #[error("Unexpected state: {0}")]
    UnexpectedState(String),

    #[error("Epic not found: {0}")]
    EpicNotFound(String),

    #[error("Changeset not found: {0}")]
    ChangesetNotFound(String),

    #[error("Mapping file corrupt: {path}: {message}")]
    MappingCorrupt { path: PathBuf, message: String },

    #[error("Invalid status transition: {from} -> {to} (allowed: {allowed})")]
    InvalidTransition {
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Integration of {root} into {parent} failed after retry: {message}")]
    IntegrationFailed {
        root: String,
        parent: String,
        message: String,
    },

    #[error("Worktree error: {message}")]
    Worktree { message: String, path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not in a git repository")]
    NotInGitRepo,

    #[error("Project not initialized. Run 'crew-pilot init' first.")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl CrewError {
    /// Failures a GC sweep reports per object and moves past.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            Self::ExternalCommand { .. } | Self::Io(_) | Self::Worktree { .. }
        )
    }

    pub fn external(program: &str, args: &[String], status: String, stderr: String) -> Self {
        Self::ExternalCommand {
            program: program.to_string(),
            args: args.join(" "),
            status,
            stderr,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrewError>;
