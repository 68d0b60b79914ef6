use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{CrewError, Result};
use crate::git::GitRunner;

use super::HistoryMode;

/// Why an integration attempt had nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// Root is already an ancestor of parent.
    AlreadyAncestor,
    /// Every root commit is already applied on parent patch-wise.
    FullyApplied,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NoOpReason::AlreadyAncestor => "already an ancestor of the target",
            NoOpReason::FullyApplied => "every commit already applied on the target",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationOutcome {
    NoOp(NoOpReason),
    Integrated { sha: String },
}

enum Attempt {
    Done(IntegrationOutcome),
    /// The parent ref moved between read and write, or the push lost.
    Lost(String),
}

/// Integrates one branch into another inside a single checkout.
///
/// The runner must point at a worktree of the repository; rebases run on the
/// root branch checked out there, merges and squashes on a detached HEAD so
/// only the final CAS moves the parent ref.
pub struct IntegrationEngine {
    git: GitRunner,
    auto_push: bool,
}

impl IntegrationEngine {
    pub fn new(git: GitRunner, auto_push: bool) -> Self {
        Self { git, auto_push }
    }

    pub(super) fn git(&self) -> &GitRunner {
        &self.git
    }

    /// Land `root` in `parent` under a 2-attempt retry loop.
    ///
    /// Each attempt reads the parent head first, short-circuits when the work
    /// is already present (ancestry or patch-equivalence), performs the
    /// mode's git operation, then advances the parent ref only if it still
    /// equals the value read at the start. A lost swap or rejected push
    /// resynchronizes the local parent from the remote and retries the whole
    /// sequence exactly once; the second loss is a hard error.
    pub async fn integrate_root_to_parent(
        &self,
        root: &str,
        parent: &str,
        mode: HistoryMode,
    ) -> Result<IntegrationOutcome> {
        if root.trim().is_empty() || parent.trim().is_empty() {
            return Err(CrewError::Validation(
                "root and parent branch names must not be empty".into(),
            ));
        }
        if root == parent {
            return Err(CrewError::Validation(format!(
                "cannot integrate {} into itself",
                root
            )));
        }
        if !self.git.branch_exists(root).await? {
            return Err(CrewError::Validation(format!(
                "root branch {} does not exist",
                root
            )));
        }

        for attempt in 0..2 {
            match self.attempt(root, parent, mode).await? {
                Attempt::Done(outcome) => {
                    if let IntegrationOutcome::Integrated { sha } = &outcome {
                        info!(root = %root, parent = %parent, mode = %mode, sha = %sha,
                              "Integrated root into parent");
                    }
                    return Ok(outcome);
                }
                Attempt::Lost(reason) if attempt == 0 => {
                    warn!(root = %root, parent = %parent, reason = %reason,
                          "Integration attempt lost the ref race, resyncing parent and retrying");
                    self.resync_parent(parent).await?;
                }
                Attempt::Lost(reason) => {
                    return Err(CrewError::IntegrationFailed {
                        root: root.to_string(),
                        parent: parent.to_string(),
                        message: reason,
                    });
                }
            }
        }
        unreachable!("integration retry loop covers both attempts")
    }

    async fn attempt(&self, root: &str, parent: &str, mode: HistoryMode) -> Result<Attempt> {
        let parent_ref = format!("refs/heads/{}", parent);
        let parent_old = self
            .git
            .rev_parse(parent)
            .await?
            .ok_or_else(|| CrewError::Validation(format!("parent branch {} does not exist", parent)))?;

        if self.git.is_ancestor(root, parent).await? {
            debug!(root = %root, parent = %parent, "Root already ancestor of parent");
            return Ok(Attempt::Done(IntegrationOutcome::NoOp(
                NoOpReason::AlreadyAncestor,
            )));
        }
        if self.git.fully_applied(root, parent).await? {
            debug!(root = %root, parent = %parent, "Root already applied patch-wise");
            return Ok(Attempt::Done(IntegrationOutcome::NoOp(
                NoOpReason::FullyApplied,
            )));
        }

        let candidate = match mode {
            HistoryMode::Rebase => {
                self.git.checkout(root).await?;
                self.git.rebase(parent).await?;
                self.git.head_sha().await?
            }
            HistoryMode::Merge => {
                self.git.checkout_detached(&parent_old).await?;
                let message = format!("Merge branch '{}' into {}", root, parent);
                self.git.merge(root, &message).await?;
                self.git.head_sha().await?
            }
            HistoryMode::Squash => {
                self.git.checkout_detached(&parent_old).await?;
                self.git.merge_squash(root).await?;
                let staged = self.git.run(&["diff", "--cached", "--quiet"]).await?;
                if staged.status.success() {
                    // Content already present even though cherry disagreed.
                    self.git.checkout(parent).await?;
                    return Ok(Attempt::Done(IntegrationOutcome::NoOp(
                        NoOpReason::FullyApplied,
                    )));
                }
                self.squash_commit(root, parent).await?;
                self.git.head_sha().await?
            }
        };

        if !self
            .git
            .update_ref_cas(&parent_ref, &candidate, &parent_old)
            .await?
        {
            return Ok(Attempt::Lost(format!(
                "parent ref {} no longer at {}",
                parent, parent_old
            )));
        }

        if self.auto_push && self.git.remote_exists("origin").await? {
            if let Err(e) = self.git.push("origin", parent).await {
                return Ok(Attempt::Lost(format!("push rejected: {}", e)));
            }
        }

        // Leave the worktree on a branch, not a detached candidate.
        if !matches!(mode, HistoryMode::Rebase) {
            self.git.checkout(parent).await?;
        }

        Ok(Attempt::Done(IntegrationOutcome::Integrated {
            sha: candidate,
        }))
    }

    /// Commit the staged squash with a message passed through a temporary
    /// file, never as a command-line literal.
    async fn squash_commit(&self, root: &str, parent: &str) -> Result<()> {
        let root_sha = self.git.rev_parse(root).await?.unwrap_or_default();
        let message = format!(
            "Squash branch '{}' into {}\n\nSource-head: {}\n",
            root, parent, root_sha
        );

        let path = squash_message_path();
        fs::write(&path, &message).await?;
        let result = self.git.commit_from_file(&path).await;
        if let Err(e) = fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Failed to remove squash message file");
        }
        result
    }

    /// Force the local parent ref back to the remote's view before a retry.
    /// Without a remote there is nothing to resync; the retry re-reads the
    /// local ref fresh.
    async fn resync_parent(&self, parent: &str) -> Result<()> {
        if !self.git.remote_exists("origin").await? {
            return Ok(());
        }
        self.git.fetch("origin", parent).await?;
        if let Some(remote_sha) = self
            .git
            .rev_parse(&format!("refs/remotes/origin/{}", parent))
            .await?
        {
            self.git
                .update_ref(&format!("refs/heads/{}", parent), &remote_sha)
                .await?;
            debug!(parent = %parent, sha = %remote_sha, "Resynced parent from origin");
        }
        Ok(())
    }
}

fn squash_message_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "crew-squash-{}-{}.txt",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ))
}
