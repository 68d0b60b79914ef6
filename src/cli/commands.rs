use clap::{Parser, Subcommand, ValueEnum};

use crate::integrate::HistoryMode;

#[derive(Parser)]
#[command(name = "crew-pilot")]
#[command(author, version, about = "Git orchestration for autonomous coding agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Output format for CLI results.
/// - Text: Human-readable text output (default)
/// - Json: Single JSON object at completion
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize crew-pilot in the current project
    Init,

    /// Claim an epic or changeset for an agent
    Claim {
        /// Epic or changeset id
        id: String,

        /// Agent id doing the claiming
        #[arg(long, env = "CREW_AGENT")]
        agent: String,

        /// Epic hook lease in seconds
        #[arg(long)]
        lease_secs: Option<u64>,

        /// Parent epic id (when the changeset id does not carry it)
        #[arg(long)]
        epic: Option<String>,
    },

    /// Materialize the work branch for a changeset
    Branch {
        /// Changeset id
        changeset_id: String,

        /// Parent epic id (when the changeset id does not carry it)
        #[arg(long)]
        epic: Option<String>,

        /// Also create a dedicated worktree for the branch
        #[arg(long)]
        worktree: bool,
    },

    /// Integrate a branch into its target and record the proof
    Integrate {
        /// Epic id (root into parent) or changeset id (work into root)
        id: String,

        /// How the landed history should read
        #[arg(long, value_enum)]
        mode: Option<HistoryMode>,

        /// Parent epic id (when the changeset id does not carry it)
        #[arg(long)]
        epic: Option<String>,
    },

    /// Report whether a changeset's work is already landed
    Signal {
        /// Changeset id
        id: String,

        /// Parent epic id (when the changeset id does not carry it)
        #[arg(long)]
        epic: Option<String>,
    },

    /// Synchronize the planner worktree with its upstream
    Sync {
        /// Agent id the sync progress is recorded under
        #[arg(long, env = "CREW_AGENT")]
        agent: String,

        /// Keep running and sync on an interval
        #[arg(long)]
        watch: bool,

        /// Treat this invocation as event-driven (debounced)
        #[arg(long)]
        event: bool,
    },

    /// Reconcile stale hooks, orphan worktrees, and label drift
    Gc {
        /// Show what would be done without doing it
        #[arg(long)]
        dry_run: bool,

        /// Apply every proposed action without prompting
        #[arg(short, long)]
        yes: bool,
    },

    /// Show epics, changesets, and their branch state
    Status {
        /// Epic id (optional, shows all if not specified)
        id: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Edit configuration
    Edit,
    /// Reset to defaults
    Reset,
}
