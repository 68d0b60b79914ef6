//! Store-wide label/status normalization.
//!
//! Applies the legacy-label bridge to every work record, and closes
//! tombstones: records whose metadata already says a PR merged while the
//! status still reads open.

use crate::error::Result;
use crate::issue::{IssueFilter, TYPE_AGENT, TYPE_MESSAGE};
use crate::lifecycle::{keys, pr_state_of, resolve, resolve_record, PrState, WorkStatus};

use super::action::GcAction;
use super::engine::{GcEngine, GcReport};

impl GcEngine {
    pub(super) async fn scan_label_drift(&self, report: &mut GcReport) -> Result<()> {
        let records = self.store.list(&IssueFilter::all()).await?;

        for record in records {
            if record.is_type(TYPE_AGENT) || record.is_type(TYPE_MESSAGE) {
                continue;
            }

            let resolution = resolve_record(&record);

            let merged_recorded = record.meta(keys::CS_PR_MERGED_AT).is_some()
                || pr_state_of(&record) == Some(PrState::Merged);
            if merged_recorded && resolution.status != WorkStatus::Closed {
                let closed = resolve(
                    Some(WorkStatus::Closed),
                    &record.labels,
                    Some(PrState::Merged),
                );
                report.push(GcAction::NormalizeStatus {
                    issue_id: record.id.clone(),
                    set_status: Some(WorkStatus::Closed),
                    set_pr_state: Some(PrState::Merged),
                    add_labels: closed.add_labels,
                    remove_labels: closed.remove_labels,
                    tombstone: true,
                });
                continue;
            }

            if resolution.is_noop() {
                continue;
            }

            report.push(GcAction::NormalizeStatus {
                issue_id: record.id.clone(),
                set_status: resolution.backfill_status.then_some(resolution.status),
                set_pr_state: resolution.backfill_pr_state,
                add_labels: resolution.add_labels,
                remove_labels: resolution.remove_labels,
                tombstone: false,
            });
        }
        Ok(())
    }
}
