use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{CrewError, Result};
use crate::integrate::HistoryMode;

/// Hard floor for the periodic sync interval. Configured values below this
/// are raised to it at runtime.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrewConfig {
    pub git: GitConfig,
    pub sync: SyncConfig,
    pub gc: GcConfig,
    pub issues: IssuesConfig,
    pub integration: IntegrationConfig,
}

impl CrewConfig {
    pub async fn load(crew_dir: &Path) -> Result<Self> {
        let config_path = crew_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, crew_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = crew_dir.join("config.toml");
        let content = toml::to_string_pretty(self).map_err(|e| CrewError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.git.default_branch.is_empty() {
            errors.push("git.default_branch must not be empty");
        }
        if self.git.branch_prefix.is_empty() {
            errors.push("git.branch_prefix must not be empty");
        }

        if self.sync.interval_secs == 0 {
            errors.push("sync.interval_secs must be greater than 0");
        }
        if self.sync.lock_ttl_secs == 0 {
            errors.push("sync.lock_ttl_secs must be greater than 0");
        }
        if self.sync.planner_branch.is_empty() {
            errors.push("sync.planner_branch must not be empty");
        }

        if self.gc.stale_hook_secs == 0 {
            errors.push("gc.stale_hook_secs must be greater than 0");
        }
        if self.gc.queue_claim_secs == 0 {
            errors.push("gc.queue_claim_secs must be greater than 0");
        }
        if self.gc.message_retention_secs == 0 {
            errors.push("gc.message_retention_secs must be greater than 0");
        }

        if self.issues.bin.is_empty() {
            errors.push("issues.bin must not be empty");
        }
        if self.issues.timeout_secs == 0 {
            errors.push("issues.timeout_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CrewError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Shared default branch the planner worktree tracks.
    pub default_branch: String,
    /// Prefix for auto-derived epic root branches.
    pub branch_prefix: String,
    /// Push integrated parents to origin when a remote exists.
    pub auto_push: bool,
    /// Directory (relative to the repo root) where epic worktrees live.
    pub worktrees_dir: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_branch: String::from("main"),
            branch_prefix: String::from("crew"),
            auto_push: true,
            worktrees_dir: String::from(".worktrees"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic sync interval in seconds (floor: 300).
    pub interval_secs: u64,
    /// Minimum spacing between event-triggered syncs.
    pub event_debounce_secs: u64,
    /// Heartbeat age after which a sync lock may be stolen.
    pub lock_ttl_secs: u64,
    /// How long the planner tree may stay dirty before the warning fires.
    pub dirty_warn_after_secs: u64,
    /// Branch checked out in the planner worktree.
    pub planner_branch: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            event_debounce_secs: 60,
            lock_ttl_secs: 120,
            dirty_warn_after_secs: 900,
            planner_branch: String::from("planner"),
        }
    }
}

impl SyncConfig {
    /// Configured interval with the floor applied.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_SYNC_INTERVAL_SECS))
    }

    pub fn event_debounce(&self) -> Duration {
        Duration::from_secs(self.event_debounce_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn dirty_warn_after(&self) -> Duration {
        Duration::from_secs(self.dirty_warn_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Heartbeat age after which an epic hook counts as stale.
    pub stale_hook_secs: u64,
    /// Release hooks whose records carry no heartbeat at all.
    pub stale_if_missing_heartbeat: bool,
    /// Age after which an unacknowledged queue claim expires.
    pub queue_claim_secs: u64,
    /// Age after which channel messages are closed.
    pub message_retention_secs: u64,
    /// Delete pruned branches on origin too.
    pub delete_remote_branches: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stale_hook_secs: 1800,
            stale_if_missing_heartbeat: false,
            queue_claim_secs: 3600,
            message_retention_secs: 7 * 24 * 3600,
            delete_remote_branches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuesConfig {
    /// Issue store CLI binary.
    pub bin: String,
    /// Per-invocation timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for IssuesConfig {
    fn default() -> Self {
        Self {
            bin: String::from("bd"),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Default history mode for `integrate` when the caller gives none.
    pub history_mode: HistoryMode,
    /// Require source-side reachability for recorded-sha proof.
    pub strict_signal: bool,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            history_mode: HistoryMode::Rebase,
            strict_signal: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub crew_dir: PathBuf,
    pub mappings_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub worktrees_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: PathBuf, config: &CrewConfig) -> Self {
        let crew_dir = root.join(".crew");

        Self {
            worktrees_dir: root.join(&config.git.worktrees_dir),
            mappings_dir: crew_dir.join("mappings"),
            locks_dir: crew_dir.join("locks"),
            logs_dir: crew_dir.join("logs"),
            crew_dir,
            root,
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        let dirs = [
            &self.crew_dir,
            &self.mappings_dir,
            &self.locks_dir,
            &self.logs_dir,
        ];

        for dir in dirs {
            fs::create_dir_all(dir).await?;
        }

        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.crew_dir.join("config.toml")
    }

    pub fn mapping_file(&self, epic_id: &str) -> PathBuf {
        self.mappings_dir.join(format!("{}.json", epic_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CrewConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_default_branch_rejected() {
        let mut config = CrewConfig::default();
        config.git.default_branch.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn sync_interval_floor_applied() {
        let mut config = CrewConfig::default();
        config.sync.interval_secs = 30;
        assert_eq!(
            config.sync.effective_interval(),
            Duration::from_secs(MIN_SYNC_INTERVAL_SECS)
        );

        config.sync.interval_secs = 900;
        assert_eq!(config.sync.effective_interval(), Duration::from_secs(900));
    }
}
