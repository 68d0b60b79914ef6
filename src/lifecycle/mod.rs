//! Lifecycle state machine for epics and changesets.
//!
//! Canonical statuses live in the issue store's status field; the legacy
//! `cs:*` label scheme is bridged on every read and normalized on write.
//! All transitions go through [`Lifecycle`] so dependency checks and note
//! trails stay consistent.

mod bridge;
mod status;

pub use bridge::{
    legacy_label_for, resolve, BridgeResolution, LABEL_ABANDONED, LABEL_BLOCKED, LABEL_IN_PROGRESS,
    LABEL_MERGED, LABEL_READY, LEGACY_LABELS,
};
pub use status::{PrState, StatusTransition, WorkStatus};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{CrewError, Result};
use crate::issue::{IssueRecord, IssueStore, IssueUpdate};

/// Metadata keys this crate writes into issue descriptions.
pub mod keys {
    /// On epic records.
    pub const EPIC_ROOT_BRANCH: &str = "epic.root_branch";
    pub const EPIC_PARENT_BRANCH: &str = "epic.parent_branch";

    /// On changeset records.
    pub const CS_WORK_BRANCH: &str = "changeset.work_branch";
    pub const CS_TARGET_BRANCH: &str = "changeset.target_branch";
    pub const CS_ROOT_BASE: &str = "changeset.root_base";
    pub const CS_PARENT_BASE: &str = "changeset.parent_base";
    pub const CS_INTEGRATED_SHA: &str = "changeset.integrated_sha";
    pub const CS_PR_STATE: &str = "changeset.pr_state";
    pub const CS_PR_MERGED_AT: &str = "changeset.pr_merged_at";

    /// On agent records: the epic hook (claim with heartbeat).
    pub const HOOK_EPIC_ID: &str = "hook.epic_id";
    pub const HOOK_HEARTBEAT_AT: &str = "hook.heartbeat_at";
    pub const HOOK_EXPIRES_AT: &str = "hook.expires_at";
    pub const HOOK_PID: &str = "hook.pid";
    pub const HOOK_HOST: &str = "hook.host";
}

/// Canonical view of a record after running the label bridge.
pub fn resolve_record(record: &IssueRecord) -> BridgeResolution {
    resolve(record.work_status(), &record.labels, pr_state_of(record))
}

pub fn pr_state_of(record: &IssueRecord) -> Option<PrState> {
    record
        .meta(keys::CS_PR_STATE)
        .as_deref()
        .and_then(PrState::parse)
}

/// An epic accepts a claim while open or in progress and either unassigned
/// or already assigned to the caller.
pub fn epic_claimable(record: &IssueRecord, agent_id: &str) -> bool {
    let status = resolve_record(record).status;
    if !status.is_claimable() {
        return false;
    }
    match record.assignee.as_deref() {
        None | Some("") => true,
        Some(assignee) => assignee == agent_id,
    }
}

/// Evidence that a changeset's work landed, for closing it.
#[derive(Debug, Clone)]
pub enum CloseProof {
    /// A sha the integration engine advanced the target to.
    Integrated(String),
    /// An externally reported merged pull request.
    PrMerged,
}

pub struct Lifecycle {
    store: Arc<dyn IssueStore>,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn IssueStore>) -> Self {
        Self { store }
    }

    async fn fetch(&self, id: &str) -> Result<IssueRecord> {
        self.store
            .show(id)
            .await?
            .ok_or_else(|| CrewError::ChangesetNotFound(id.to_string()))
    }

    /// Label rewrite for a status change, folded into `update`.
    fn with_bridge(update: IssueUpdate, record: &IssueRecord, to: WorkStatus) -> IssueUpdate {
        let resolution = resolve(Some(to), &record.labels, pr_state_of(record));
        let mut update = update.status(to);
        for label in resolution.add_labels {
            update = update.add_label(&label);
        }
        for label in resolution.remove_labels {
            update = update.remove_label(&label);
        }
        update
    }

    fn check_transition(record: &IssueRecord, to: WorkStatus) -> Result<WorkStatus> {
        let from = resolve_record(record).status;
        if !from.can_transition_to(to) {
            return Err(CrewError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
                allowed: from
                    .allowed_transitions()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(from)
    }

    /// Claim a changeset for an agent.
    ///
    /// Dependencies are re-fetched and re-verified here, at transition time:
    /// every declared dependency must be closed. An unmet dependency flips
    /// the changeset to blocked (with a note naming the blockers) and the
    /// claim fails.
    pub async fn claim_changeset(&self, changeset_id: &str, agent_id: &str) -> Result<IssueRecord> {
        let record = self.fetch(changeset_id).await?;
        Self::check_transition(&record, WorkStatus::InProgress)?;

        if let Some(assignee) = record.assignee.as_deref() {
            if !assignee.is_empty() && assignee != agent_id {
                return Err(CrewError::PolicyBlocked(format!(
                    "{} is assigned to {}",
                    changeset_id, assignee
                )));
            }
        }

        let mut unmet = Vec::new();
        for dep in &record.deps {
            let dep_status = match self.store.show(dep).await? {
                Some(dep_record) => resolve_record(&dep_record).status,
                None => {
                    return Err(CrewError::UnexpectedState(format!(
                        "{} depends on {}, which does not exist",
                        changeset_id, dep
                    )));
                }
            };
            if !dep_status.is_terminal() {
                unmet.push(dep.clone());
            }
        }

        if !unmet.is_empty() {
            let reason = format!("waiting on {}", unmet.join(", "));
            self.block_changeset(changeset_id, &reason).await?;
            return Err(CrewError::PolicyBlocked(format!(
                "{} has unmet dependencies: {}",
                changeset_id,
                unmet.join(", ")
            )));
        }

        let update = Self::with_bridge(IssueUpdate::new(), &record, WorkStatus::InProgress)
            .assignee(agent_id);
        self.store.update(changeset_id, update).await?;
        info!(changeset = %changeset_id, agent = %agent_id, "Claimed changeset");

        self.fetch(changeset_id).await
    }

    /// Mark a changeset blocked with a timestamped reason appended to its
    /// notes. Notes are append-only; nothing is overwritten. Blocking an
    /// already-blocked changeset just adds the note.
    pub async fn block_changeset(&self, changeset_id: &str, reason: &str) -> Result<()> {
        let record = self.fetch(changeset_id).await?;
        let note = format!("[{}] blocked: {}", Utc::now().to_rfc3339(), reason);

        let update = if resolve_record(&record).status == WorkStatus::Blocked {
            IssueUpdate::new().append_notes(&note)
        } else {
            Self::check_transition(&record, WorkStatus::Blocked)?;
            Self::with_bridge(IssueUpdate::new(), &record, WorkStatus::Blocked).append_notes(&note)
        };
        self.store.update(changeset_id, update).await?;
        debug!(changeset = %changeset_id, reason = %reason, "Blocked changeset");
        Ok(())
    }

    /// Park a changeset without losing it.
    pub async fn defer_changeset(&self, changeset_id: &str, reason: &str) -> Result<()> {
        let record = self.fetch(changeset_id).await?;
        Self::check_transition(&record, WorkStatus::Deferred)?;

        let note = format!("[{}] deferred: {}", Utc::now().to_rfc3339(), reason);
        let update = Self::with_bridge(IssueUpdate::new(), &record, WorkStatus::Deferred)
            .append_notes(&note)
            .clear_assignee();
        self.store.update(changeset_id, update).await?;
        Ok(())
    }

    /// Bring a deferred changeset back into the claimable pool.
    pub async fn undefer_changeset(&self, changeset_id: &str) -> Result<()> {
        let record = self.fetch(changeset_id).await?;
        Self::check_transition(&record, WorkStatus::Open)?;

        let update = Self::with_bridge(IssueUpdate::new(), &record, WorkStatus::Open);
        self.store.update(changeset_id, update).await?;
        Ok(())
    }

    /// Close a changeset on integration proof or a merged-PR signal.
    pub async fn close_changeset(&self, changeset_id: &str, proof: CloseProof) -> Result<()> {
        let record = self.fetch(changeset_id).await?;
        Self::check_transition(&record, WorkStatus::Closed)?;

        let mut description = crate::issue::meta_upsert(
            &record.description,
            keys::CS_PR_STATE,
            PrState::Merged.as_str(),
        );
        match &proof {
            CloseProof::Integrated(sha) => {
                description =
                    crate::issue::meta_upsert(&description, keys::CS_INTEGRATED_SHA, sha);
            }
            CloseProof::PrMerged => {
                description = crate::issue::meta_upsert(
                    &description,
                    keys::CS_PR_MERGED_AT,
                    &Utc::now().to_rfc3339(),
                );
            }
        }

        let update = Self::with_bridge(IssueUpdate::new(), &record, WorkStatus::Closed)
            .description(&description);
        self.store.update(changeset_id, update).await?;
        info!(changeset = %changeset_id, proof = ?proof, "Closed changeset");
        Ok(())
    }

    /// Close a changeset whose work is being dropped.
    pub async fn abandon_changeset(&self, changeset_id: &str, reason: &str) -> Result<()> {
        let record = self.fetch(changeset_id).await?;
        Self::check_transition(&record, WorkStatus::Closed)?;

        let description = crate::issue::meta_upsert(
            &record.description,
            keys::CS_PR_STATE,
            PrState::Abandoned.as_str(),
        );
        let note = format!("[{}] abandoned: {}", Utc::now().to_rfc3339(), reason);

        // The bridge maps closed to the label matching the recorded pr_state,
        // so resolve against the updated description.
        let resolution = resolve(
            Some(WorkStatus::Closed),
            &record.labels,
            Some(PrState::Abandoned),
        );
        let mut update = IssueUpdate::new()
            .status(WorkStatus::Closed)
            .description(&description)
            .append_notes(&note);
        for label in resolution.add_labels {
            update = update.add_label(&label);
        }
        for label in resolution.remove_labels {
            update = update.remove_label(&label);
        }
        self.store.update(changeset_id, update).await?;
        Ok(())
    }

    /// Claim an epic: assign it, move it in progress, and record the hook on
    /// the agent's own record with a fresh heartbeat.
    pub async fn claim_epic(
        &self,
        epic_id: &str,
        agent_id: &str,
        lease: Option<Duration>,
    ) -> Result<IssueRecord> {
        let epic = self
            .store
            .show(epic_id)
            .await?
            .ok_or_else(|| CrewError::EpicNotFound(epic_id.to_string()))?;

        if !epic_claimable(&epic, agent_id) {
            return Err(CrewError::PolicyBlocked(format!(
                "epic {} is not claimable by {} (status {}, assignee {})",
                epic_id,
                agent_id,
                resolve_record(&epic).status,
                epic.assignee.as_deref().unwrap_or("none"),
            )));
        }

        let update = IssueUpdate::new()
            .status(WorkStatus::InProgress)
            .assignee(agent_id);
        self.store.update(epic_id, update).await?;

        if let Some(agent) = self.store.show(agent_id).await? {
            let now = Utc::now();
            let mut description =
                crate::issue::meta_upsert(&agent.description, keys::HOOK_EPIC_ID, epic_id);
            description = crate::issue::meta_upsert(
                &description,
                keys::HOOK_HEARTBEAT_AT,
                &now.to_rfc3339(),
            );
            description = crate::issue::meta_upsert(
                &description,
                keys::HOOK_PID,
                &std::process::id().to_string(),
            );
            description = crate::issue::meta_upsert(
                &description,
                keys::HOOK_HOST,
                &crate::process::hostname(),
            );
            description = match lease {
                Some(lease) => {
                    let expires = now + chrono::Duration::from_std(lease).unwrap_or_default();
                    crate::issue::meta_upsert(
                        &description,
                        keys::HOOK_EXPIRES_AT,
                        &expires.to_rfc3339(),
                    )
                }
                None => crate::issue::meta_remove(&description, keys::HOOK_EXPIRES_AT),
            };
            self.store
                .update(agent_id, IssueUpdate::new().description(&description))
                .await?;
        }

        info!(epic = %epic_id, agent = %agent_id, "Claimed epic");
        self.fetch(epic_id).await
    }

    /// Refresh the hook heartbeat on an agent record.
    pub async fn refresh_hook(&self, agent_id: &str) -> Result<()> {
        let agent = self.fetch(agent_id).await?;
        if agent.meta(keys::HOOK_EPIC_ID).is_none() {
            return Err(CrewError::UnexpectedState(format!(
                "{} holds no epic hook",
                agent_id
            )));
        }
        let description = crate::issue::meta_upsert(
            &agent.description,
            keys::HOOK_HEARTBEAT_AT,
            &Utc::now().to_rfc3339(),
        );
        self.store
            .update(agent_id, IssueUpdate::new().description(&description))
            .await?;
        Ok(())
    }

    /// Drop an agent's epic hook and reopen the epic for other claimants.
    pub async fn release_hook(&self, agent_id: &str) -> Result<Option<String>> {
        let agent = self.fetch(agent_id).await?;
        let Some(epic_id) = agent.meta(keys::HOOK_EPIC_ID) else {
            return Ok(None);
        };

        let description = crate::issue::meta_apply(
            &agent.description,
            &[
                (keys::HOOK_EPIC_ID.to_string(), None),
                (keys::HOOK_HEARTBEAT_AT.to_string(), None),
                (keys::HOOK_EXPIRES_AT.to_string(), None),
                (keys::HOOK_PID.to_string(), None),
                (keys::HOOK_HOST.to_string(), None),
            ],
        );
        self.store
            .update(agent_id, IssueUpdate::new().description(&description))
            .await?;

        if let Some(epic) = self.store.show(&epic_id).await? {
            if !resolve_record(&epic).status.is_terminal() {
                let update = IssueUpdate::new().status(WorkStatus::Open).clear_assignee();
                self.store.update(&epic_id, update).await?;
            }
        }

        info!(epic = %epic_id, agent = %agent_id, "Released epic hook");
        Ok(Some(epic_id))
    }
}
