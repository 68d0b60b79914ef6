use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{CrewConfig, GcConfig, ProjectPaths};
use crate::error::{CrewError, Result};
use crate::git::GitRunner;
use crate::integrate::IntegrationEngine;
use crate::issue::{meta_apply, meta_upsert, IssueStore, IssueUpdate};
use crate::lifecycle::{keys, Lifecycle, WorkStatus};
use crate::mapping::MappingStore;
use crate::sync::SyncLocker;

use super::action::GcAction;
use super::messages::{KEY_CLAIMED_AT, KEY_CLAIMED_BY};

/// Result of a scan pass: the pending actions plus anything the scanners
/// could not evaluate. Scanning never mutates.
#[derive(Debug, Default, Serialize)]
pub struct GcReport {
    pub actions: Vec<GcAction>,
    pub warnings: Vec<String>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(super) fn push(&mut self, action: GcAction) {
        debug!(action = %action, "Scanner proposed action");
        self.actions.push(action);
    }

    pub(super) fn warn_on(&mut self, context: &str, error: &CrewError) {
        warn!(context = %context, error = %error, "Reconciliation scanner hit an error");
        self.warnings.push(format!("{}: {}", context, error));
    }
}

/// What happened to one applied action.
#[derive(Debug)]
pub enum ApplyResult {
    Applied,
    Skipped(String),
}

#[derive(Debug, Default, Serialize)]
pub struct GcApplySummary {
    pub applied: usize,
    pub skipped: Vec<(String, String)>,
    pub failures: Vec<(String, String)>,
}

impl GcApplySummary {
    pub fn clean(&self) -> bool {
        self.skipped.is_empty() && self.failures.is_empty()
    }
}

/// Reconciliation engine: independent scanners produce [`GcAction`]s, and
/// `apply` executes them one at a time. Destructive git work takes a
/// per-epic lock so two reconcilers cannot interleave removals; branch
/// deletion itself additionally sits behind git's own ref locking.
pub struct GcEngine {
    pub(super) store: Arc<dyn IssueStore>,
    pub(super) mappings: MappingStore,
    pub(super) git: GitRunner,
    pub(super) integrator: IntegrationEngine,
    pub(super) lifecycle: Lifecycle,
    pub(super) locker: SyncLocker,
    pub(super) config: GcConfig,
    pub(super) root: PathBuf,
    pub(super) default_branch: String,
    pub(super) strict_signal: bool,
}

impl GcEngine {
    pub fn new(paths: &ProjectPaths, config: &CrewConfig, store: Arc<dyn IssueStore>) -> Self {
        Self {
            git: GitRunner::new(&paths.root),
            integrator: IntegrationEngine::new(GitRunner::new(&paths.root), config.git.auto_push),
            lifecycle: Lifecycle::new(store.clone()),
            mappings: MappingStore::new(&paths.mappings_dir, config.git.clone()),
            locker: SyncLocker::new(&paths.locks_dir, config.sync.lock_ttl()),
            store,
            config: config.gc.clone(),
            root: paths.root.clone(),
            default_branch: config.git.default_branch.clone(),
            strict_signal: config.integration.strict_signal,
        }
    }

    /// Run every scanner. A scanner failing outright is reported and the
    /// rest still run; per-object failures inside a scanner likewise.
    pub async fn scan(&self) -> Result<GcReport> {
        let mut report = GcReport::default();
        let now = Utc::now();

        if let Err(e) = self.scan_stale_hooks(now, &mut report).await {
            report.warn_on("stale-hook scan", &e);
        }
        if let Err(e) = self.scan_orphan_worktrees(&mut report).await {
            report.warn_on("orphan-worktree scan", &e);
        }
        if let Err(e) = self.scan_resolved_epics(&mut report).await {
            report.warn_on("resolved-epic scan", &e);
        }
        if let Err(e) = self.scan_label_drift(&mut report).await {
            report.warn_on("label-normalization scan", &e);
        }
        if let Err(e) = self.scan_messages(now, &mut report).await {
            report.warn_on("message-retention scan", &e);
        }

        info!(
            actions = report.actions.len(),
            warnings = report.warnings.len(),
            "Reconciliation scan complete"
        );
        Ok(report)
    }

    /// Apply actions in order. Reportable failures (external commands, IO,
    /// worktrees) are collected and the sweep continues; anything else
    /// aborts, since it means our own invariants broke.
    pub async fn apply(&self, actions: &[GcAction], force: bool) -> Result<GcApplySummary> {
        let mut summary = GcApplySummary::default();

        for action in actions {
            match self.apply_one(action, force).await {
                Ok(ApplyResult::Applied) => {
                    info!(action = %action, "Applied reconciliation action");
                    summary.applied += 1;
                }
                Ok(ApplyResult::Skipped(reason)) => {
                    warn!(action = %action, reason = %reason, "Skipped reconciliation action");
                    summary.skipped.push((action.describe(), reason));
                }
                Err(e) if e.is_reportable() => {
                    warn!(action = %action, error = %e, "Reconciliation action failed");
                    summary.failures.push((action.describe(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    pub async fn apply_one(&self, action: &GcAction, force: bool) -> Result<ApplyResult> {
        match action {
            GcAction::ReleaseStaleHook { agent_id, .. } => {
                self.lifecycle.release_hook(agent_id).await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::RemoveOrphanWorktree { epic_id, path, dirty } => {
                if *dirty && !force {
                    return Ok(ApplyResult::Skipped(
                        "worktree has uncommitted changes; confirm or pass --yes".into(),
                    ));
                }
                let Some(_guard) = self.locker.try_acquire("gc", Path::new(epic_id)).await? else {
                    return Ok(ApplyResult::Skipped(
                        "another process is reconciling this epic".into(),
                    ));
                };
                self.git.worktree_remove(path, *dirty).await?;
                self.git.worktree_prune().await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::RemoveStaleMapping { epic_id } => {
                self.mappings.remove(epic_id).await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::PruneEpicArtifacts {
                epic_id,
                worktrees,
                branches,
                delete_remote,
                ..
            } => {
                let Some(_guard) = self.locker.try_acquire("gc", Path::new(epic_id)).await? else {
                    return Ok(ApplyResult::Skipped(
                        "another process is reconciling this epic".into(),
                    ));
                };

                // Worktrees first: git refuses to delete a branch that is
                // still checked out somewhere.
                for worktree in worktrees {
                    if !worktree.exists() {
                        continue;
                    }
                    if let Err(e) = self.git.worktree_remove(worktree, force).await {
                        if force {
                            return Err(e);
                        }
                        return Ok(ApplyResult::Skipped(format!(
                            "worktree {} not removable without force: {}",
                            worktree.display(),
                            e
                        )));
                    }
                }
                self.git.worktree_prune().await?;

                for branch in branches {
                    if !self.git.delete_branch(branch).await? {
                        debug!(branch = %branch, "Local branch already absent");
                    }
                }

                if *delete_remote && self.git.remote_exists("origin").await? {
                    for branch in branches {
                        self.git.push_delete("origin", branch).await?;
                    }
                }

                self.mappings.remove(epic_id).await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::NormalizeStatus {
                issue_id,
                set_status,
                set_pr_state,
                add_labels,
                remove_labels,
                tombstone,
            } => {
                let Some(record) = self.store.show(issue_id).await? else {
                    return Ok(ApplyResult::Skipped("record no longer exists".into()));
                };

                let mut update = IssueUpdate::new();
                if let Some(status) = set_status {
                    update = update.status(*status);
                }
                for label in add_labels {
                    update = update.add_label(label);
                }
                for label in remove_labels {
                    update = update.remove_label(label);
                }
                if let Some(pr_state) = set_pr_state {
                    let description =
                        meta_upsert(&record.description, keys::CS_PR_STATE, pr_state.as_str());
                    update = update.description(&description);
                }
                if *tombstone {
                    update = update.append_notes(&format!(
                        "[{}] closed by reconciliation: merged PR recorded",
                        Utc::now().to_rfc3339()
                    ));
                }
                self.store.update(issue_id, update).await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::ExpireQueueClaim { message_id, .. } => {
                let Some(record) = self.store.show(message_id).await? else {
                    return Ok(ApplyResult::Skipped("message no longer exists".into()));
                };
                let description = meta_apply(
                    &record.description,
                    &[
                        (KEY_CLAIMED_BY.to_string(), None),
                        (KEY_CLAIMED_AT.to_string(), None),
                    ],
                );
                self.store
                    .update(message_id, IssueUpdate::new().description(&description))
                    .await?;
                Ok(ApplyResult::Applied)
            }

            GcAction::CloseExpiredMessage { message_id, reason } => {
                let note = format!("[{}] expired: {}", Utc::now().to_rfc3339(), reason);
                self.store
                    .update(
                        message_id,
                        IssueUpdate::new()
                            .status(WorkStatus::Closed)
                            .append_notes(&note),
                    )
                    .await?;
                Ok(ApplyResult::Applied)
            }
        }
    }

    /// A branch counts for pruning when any local or origin-tracking ref
    /// still names it.
    pub(super) async fn branch_known(&self, branch: &str) -> Result<bool> {
        if self
            .git
            .rev_parse(&format!("refs/heads/{}", branch))
            .await?
            .is_some()
        {
            return Ok(true);
        }
        Ok(self
            .git
            .rev_parse(&format!("refs/remotes/origin/{}", branch))
            .await?
            .is_some())
    }

    /// Worktree paths are recorded relative to the repository root.
    pub(super) fn resolve_worktree_path(&self, recorded: &str) -> PathBuf {
        self.root.join(recorded)
    }
}
