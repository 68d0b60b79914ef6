//! Resolved-epic artifact pruning.
//!
//! Once an epic closes, its root branch, changeset branches, worktrees, and
//! mapping file can all go, but only with positive proof: every branch in
//! the prune set must show integrated into the epic's parent branch. One
//! unproven branch vetoes the whole epic.

use std::path::PathBuf;

use tracing::debug;

use crate::error::Result;
use crate::integrate::ChangesetRefs;
use crate::issue::{IssueFilter, IssueRecord, TYPE_EPIC};
use crate::lifecycle::{keys, resolve_record, WorkStatus};
use crate::mapping::WorktreeMapping;

use super::action::GcAction;
use super::engine::{GcEngine, GcReport};

impl GcEngine {
    pub(super) async fn scan_resolved_epics(&self, report: &mut GcReport) -> Result<()> {
        let epics = self
            .store
            .list(&IssueFilter::by_type(TYPE_EPIC).include_closed())
            .await?;

        for epic in epics {
            if resolve_record(&epic).status != WorkStatus::Closed {
                continue;
            }

            let mapping = match self.mappings.load(&epic.id).await {
                Ok(Some(mapping)) => mapping,
                Ok(None) => continue,
                Err(e) => {
                    report.warn_on(&format!("mapping load for {}", epic.id), &e);
                    continue;
                }
            };

            match self.prune_plan(&epic, &mapping, report).await {
                Ok(Some(action)) => report.push(action),
                Ok(None) => {}
                Err(e) => report.warn_on(&format!("prune evaluation for {}", epic.id), &e),
            }
        }
        Ok(())
    }

    /// Build the prune action for one closed epic, or `None` when any
    /// branch in the set lacks integration proof.
    async fn prune_plan(
        &self,
        epic: &IssueRecord,
        mapping: &WorktreeMapping,
        report: &mut GcReport,
    ) -> Result<Option<GcAction>> {
        let parent = epic
            .meta(keys::EPIC_PARENT_BRANCH)
            .unwrap_or_else(|| self.default_branch.clone());

        let mut branches = Vec::new();

        // The root branch's evidence lives on the epic record itself.
        if self.branch_known(&mapping.root_branch).await? {
            let refs = ChangesetRefs::from_record(epic, &mapping.root_branch, &parent);
            let signal = self.integrator.integration_signal(&refs, self.strict_signal).await?;
            if !signal.integrated {
                report.warnings.push(format!(
                    "epic {}: root branch {} not proven integrated into {}; pruning vetoed",
                    epic.id, mapping.root_branch, parent
                ));
                return Ok(None);
            }
            branches.push(mapping.root_branch.clone());
        }

        for (changeset_id, branch) in &mapping.changesets {
            if !self.branch_known(branch).await? {
                debug!(branch = %branch, "Changeset branch already gone everywhere");
                continue;
            }

            let Some(changeset) = self.store.show(changeset_id).await? else {
                report.warnings.push(format!(
                    "epic {}: changeset {} vanished but branch {} remains; pruning vetoed",
                    epic.id, changeset_id, branch
                ));
                return Ok(None);
            };

            let refs = ChangesetRefs::from_record(&changeset, branch, &parent);
            let signal = self.integrator.integration_signal(&refs, self.strict_signal).await?;
            if !signal.integrated {
                report.warnings.push(format!(
                    "epic {}: branch {} not proven integrated into {}; pruning vetoed",
                    epic.id, branch, parent
                ));
                return Ok(None);
            }
            branches.push(branch.clone());
        }

        let mut worktrees: Vec<PathBuf> = Vec::new();
        let mut recorded = vec![mapping.worktree_path.clone()];
        recorded.extend(mapping.changeset_worktrees.values().cloned());
        for path in recorded {
            let resolved = self.resolve_worktree_path(&path);
            if resolved.exists() {
                worktrees.push(resolved);
            }
        }

        Ok(Some(GcAction::PruneEpicArtifacts {
            epic_id: epic.id.clone(),
            parent_branch: parent,
            worktrees,
            branches,
            delete_remote: self.config.delete_remote_branches,
        }))
    }
}
