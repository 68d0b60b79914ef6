//! Orphaned worktree detection: mappings whose epic id no longer resolves
//! in the issue store.

use crate::error::Result;
use crate::git::GitRunner;

use super::action::GcAction;
use super::engine::{GcEngine, GcReport};

impl GcEngine {
    pub(super) async fn scan_orphan_worktrees(&self, report: &mut GcReport) -> Result<()> {
        for mapping in self.mappings.list().await? {
            let epic_id = mapping.epic_id.clone();

            match self.store.show(&epic_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    report.warn_on(&format!("orphan check for {}", epic_id), &e);
                    continue;
                }
            }

            let mut recorded_paths = vec![mapping.worktree_path.clone()];
            recorded_paths.extend(mapping.changeset_worktrees.values().cloned());

            let mut live = 0;
            for recorded in recorded_paths {
                let path = self.resolve_worktree_path(&recorded);
                if !path.exists() {
                    continue;
                }
                live += 1;

                // An unreadable tree is treated as dirty so removal always
                // goes through the confirmation path.
                let dirty = match GitRunner::new(&path).is_dirty().await {
                    Ok(dirty) => dirty,
                    Err(e) => {
                        report.warn_on(&format!("dirty check for {}", path.display()), &e);
                        true
                    }
                };

                report.push(GcAction::RemoveOrphanWorktree {
                    epic_id: epic_id.clone(),
                    path,
                    dirty,
                });
            }

            // Once the last worktree is gone the mapping itself is the
            // remaining orphan.
            if live == 0 {
                report.push(GcAction::RemoveStaleMapping { epic_id });
            }
        }
        Ok(())
    }
}
