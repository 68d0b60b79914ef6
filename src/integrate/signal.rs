use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::git::GitRunner;
use crate::issue::IssueRecord;
use crate::lifecycle::{keys, pr_state_of, PrState};

/// The branch coordinates of one changeset, as recorded in the issue store.
#[derive(Debug, Clone)]
pub struct ChangesetRefs {
    pub changeset_id: String,
    /// The branch the agent committed to.
    pub work_branch: String,
    /// The branch the work was supposed to land in.
    pub target_branch: String,
    /// Sha the integration engine advanced the target to, if recorded.
    pub integrated_sha: Option<String>,
    /// The issue record carries an externally asserted merged-PR marker.
    pub pr_merged: bool,
}

impl ChangesetRefs {
    /// Pull the recorded evidence off an issue record.
    pub fn from_record(record: &IssueRecord, work_branch: &str, target_branch: &str) -> Self {
        Self {
            changeset_id: record.id.clone(),
            work_branch: work_branch.to_string(),
            target_branch: target_branch.to_string(),
            integrated_sha: record.meta(keys::CS_INTEGRATED_SHA),
            pr_merged: record.meta(keys::CS_PR_MERGED_AT).is_some()
                || pr_state_of(record) == Some(PrState::Merged),
        }
    }
}

/// Which check proved integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    RecordedSha,
    BranchAncestry,
    PatchEquivalence,
    MergedPr,
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Evidence::RecordedSha => "recorded sha",
            Evidence::BranchAncestry => "branch ancestry",
            Evidence::PatchEquivalence => "patch equivalence",
            Evidence::MergedPr => "merged PR",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationSignal {
    pub integrated: bool,
    /// Head of the target ref the proof was evaluated against.
    pub target_sha: Option<String>,
    pub evidence: Option<Evidence>,
}

impl IntegrationSignal {
    fn not_integrated(target_sha: Option<String>) -> Self {
        Self {
            integrated: false,
            target_sha,
            evidence: None,
        }
    }

    fn proven(target_sha: String, evidence: Evidence) -> Self {
        Self {
            integrated: true,
            target_sha: Some(target_sha),
            evidence: Some(evidence),
        }
    }
}

impl super::IntegrationEngine {
    /// Answer "is this changeset's work already landed?" without trusting
    /// any single piece of evidence, since history may have been rewritten
    /// since the work happened.
    ///
    /// Evidence is consulted in order: a recorded integrated sha that is an
    /// ancestor of the target (in strict mode it must also be reachable from
    /// the work branch, so an unrelated ancestor sha cannot pass), then
    /// direct work-branch ancestry, then patch-equivalence. When the target
    /// ref is missing locally, exactly one fetch of the origin target is
    /// attempted before giving up; never more. A merged-PR marker alone
    /// counts only outside strict mode.
    pub async fn integration_signal(
        &self,
        refs: &ChangesetRefs,
        strict: bool,
    ) -> Result<IntegrationSignal> {
        let git = self.git();

        let mut fetched = false;
        let mut target_sha = resolve_ref(git, &refs.target_branch).await?;

        loop {
            if let Some(target) = &target_sha {
                if let Some(signal) = self.check_evidence(refs, target, strict).await? {
                    return Ok(signal);
                }
                break;
            }

            if fetched || !git.remote_exists("origin").await? {
                break;
            }
            debug!(target = %refs.target_branch, "Target ref missing locally, fetching origin once");
            fetched = true;
            if git.fetch("origin", &refs.target_branch).await.is_err() {
                break;
            }
            target_sha = resolve_ref(git, &refs.target_branch).await?;
        }

        if refs.pr_merged && !strict {
            debug!(changeset = %refs.changeset_id, "Accepting merged-PR marker as proof");
            return Ok(IntegrationSignal {
                integrated: true,
                target_sha,
                evidence: Some(Evidence::MergedPr),
            });
        }

        Ok(IntegrationSignal::not_integrated(target_sha))
    }

    async fn check_evidence(
        &self,
        refs: &ChangesetRefs,
        target_sha: &str,
        strict: bool,
    ) -> Result<Option<IntegrationSignal>> {
        let git = self.git();
        let work = resolve_ref(git, &refs.work_branch).await?;

        if let Some(recorded) = &refs.integrated_sha {
            if git.is_ancestor(recorded, target_sha).await? {
                let source_reachable = match &work {
                    Some(work_sha) => git.is_ancestor(recorded, work_sha).await?,
                    None => false,
                };
                if !strict || source_reachable {
                    return Ok(Some(IntegrationSignal::proven(
                        target_sha.to_string(),
                        Evidence::RecordedSha,
                    )));
                }
                debug!(changeset = %refs.changeset_id, sha = %recorded,
                       "Recorded sha is an ancestor of target but not source-reachable, ignoring");
            }
        }

        if let Some(work_sha) = &work {
            if git.is_ancestor(work_sha, target_sha).await? {
                return Ok(Some(IntegrationSignal::proven(
                    target_sha.to_string(),
                    Evidence::BranchAncestry,
                )));
            }
            if git.fully_applied(work_sha, target_sha).await? {
                return Ok(Some(IntegrationSignal::proven(
                    target_sha.to_string(),
                    Evidence::PatchEquivalence,
                )));
            }
        }

        Ok(None)
    }
}

/// Resolve a branch to a sha, preferring the local head over the remote
/// tracking ref.
async fn resolve_ref(git: &GitRunner, branch: &str) -> Result<Option<String>> {
    if let Some(sha) = git.rev_parse(&format!("refs/heads/{}", branch)).await? {
        return Ok(Some(sha));
    }
    git.rev_parse(&format!("refs/remotes/origin/{}", branch))
        .await
}
