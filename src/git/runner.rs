use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{CrewError, Result};

/// Async wrapper around the `git` CLI, bound to one repository path.
///
/// Every invocation runs with an explicit `current_dir`; nothing here depends
/// on the process working directory. All ref mutations flow through the
/// plumbing commands so callers can reason about exactly what moved.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Runner for a different checkout of the same repository (a worktree).
    pub fn with_dir(&self, dir: &Path) -> Self {
        Self::new(dir)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            return Err(CrewError::external(
                "git",
                &owned,
                output.status.to_string(),
                stderr.trim().to_string(),
            ));
        }

        Ok(output)
    }

    fn stdout_line(output: &Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Resolve a revision to a sha. `None` when the revision does not exist.
    pub async fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let output = self
            .run(&["rev-parse", "--verify", "--quiet", &format!("{}^{{commit}}", rev)])
            .await?;
        if output.status.success() {
            Ok(Some(Self::stdout_line(&output)))
        } else {
            Ok(None)
        }
    }

    pub async fn head_sha(&self) -> Result<String> {
        let output = self.run_checked(&["rev-parse", "HEAD"]).await?;
        Ok(Self::stdout_line(&output))
    }

    pub async fn current_branch(&self) -> Result<Option<String>> {
        let output = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"]).await?;
        if output.status.success() {
            Ok(Some(Self::stdout_line(&output)))
        } else {
            Ok(None)
        }
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let output = self
            .run(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    /// `status --porcelain` lines; empty means the tree is clean.
    pub async fn status_porcelain(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&["status", "--porcelain"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub async fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain().await?.is_empty())
    }

    pub async fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run_checked(&["fetch", remote, refspec]).await?;
        Ok(())
    }

    pub async fn remote_exists(&self, remote: &str) -> Result<bool> {
        let output = self.run_checked(&["remote"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|l| l.trim() == remote))
    }

    pub async fn checkout(&self, rev: &str) -> Result<()> {
        self.run_checked(&["checkout", rev]).await?;
        Ok(())
    }

    pub async fn checkout_detached(&self, rev: &str) -> Result<()> {
        self.run_checked(&["checkout", "--detach", rev]).await?;
        Ok(())
    }

    pub async fn checkout_new(&self, branch: &str, base: &str) -> Result<()> {
        self.run_checked(&["checkout", "-b", branch, base]).await?;
        Ok(())
    }

    /// Create `branch` at `base` without checking it out.
    pub async fn create_branch(&self, branch: &str, base: &str) -> Result<()> {
        self.run_checked(&["branch", branch, base]).await?;
        Ok(())
    }

    pub async fn reset_hard(&self, rev: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", rev]).await?;
        Ok(())
    }

    /// Rebase the current branch onto `onto`, aborting on conflict so the
    /// tree is left clean either way.
    pub async fn rebase(&self, onto: &str) -> Result<()> {
        let output = self.run(&["rebase", onto]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Err(e) = self.run_checked(&["rebase", "--abort"]).await {
                warn!(error = %e, "Failed to abort conflicted rebase");
            }
            return Err(CrewError::external(
                "git",
                &["rebase".to_string(), onto.to_string()],
                output.status.to_string(),
                stderr,
            ));
        }
        Ok(())
    }

    /// Merge `branch` into HEAD, aborting on conflict.
    pub async fn merge(&self, branch: &str, message: &str) -> Result<()> {
        let output = self.run(&["merge", "--no-ff", "-m", message, branch]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Err(e) = self.run_checked(&["merge", "--abort"]).await {
                warn!(error = %e, "Failed to abort conflicted merge");
            }
            return Err(CrewError::external(
                "git",
                &["merge".to_string(), branch.to_string()],
                output.status.to_string(),
                stderr,
            ));
        }
        Ok(())
    }

    /// Stage `branch`'s changes onto HEAD without committing.
    pub async fn merge_squash(&self, branch: &str) -> Result<()> {
        let output = self.run(&["merge", "--squash", branch]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            self.run(&["reset", "--merge"]).await.ok();
            return Err(CrewError::external(
                "git",
                &["merge".to_string(), "--squash".to_string(), branch.to_string()],
                output.status.to_string(),
                stderr,
            ));
        }
        Ok(())
    }

    /// Commit staged changes with a message read from `path` (`commit -F`).
    pub async fn commit_from_file(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| CrewError::Other("Invalid path encoding".into()))?;
        self.run_checked(&["commit", "-F", path_str]).await?;
        Ok(())
    }

    /// Compare-and-swap ref update. Returns `false` when the ref no longer
    /// equals `old` (the swap lost), without distinguishing other failures;
    /// the caller's retry re-reads the ref and surfaces persistent errors.
    pub async fn update_ref_cas(&self, refname: &str, new: &str, old: &str) -> Result<bool> {
        let output = self.run(&["update-ref", refname, new, old]).await?;
        Ok(output.status.success())
    }

    pub async fn update_ref(&self, refname: &str, new: &str) -> Result<()> {
        self.run_checked(&["update-ref", refname, new]).await?;
        Ok(())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", remote, branch]).await?;
        Ok(())
    }

    pub async fn push_delete(&self, remote: &str, branch: &str) -> Result<bool> {
        let output = self.run(&["push", remote, "--delete", branch]).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Already gone on the remote counts as deleted.
        if stderr.contains("remote ref does not exist") {
            return Ok(false);
        }
        Err(CrewError::external(
            "git",
            &["push".to_string(), "--delete".to_string(), branch.to_string()],
            output.status.to_string(),
            stderr.trim().to_string(),
        ))
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    /// True when `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await?;
        Ok(output.status.success())
    }

    /// Patch-equivalence: every commit on `branch` already applied on
    /// `target`. `git cherry` marks unapplied commits with `+`.
    pub async fn fully_applied(&self, branch: &str, target: &str) -> Result<bool> {
        let output = self.run_checked(&["cherry", target, branch]).await?;
        Ok(!String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|l| l.starts_with('+')))
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| CrewError::Other("Invalid path encoding".into()))?;

        let output = if self.branch_exists(branch).await? {
            self.run(&["worktree", "add", path_str, branch]).await?
        } else {
            self.run(&["worktree", "add", "-b", branch, path_str, base])
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CrewError::Worktree {
                message: stderr.to_string(),
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| CrewError::Other("Invalid path encoding".into()))?;

        let output = if force {
            self.run(&["worktree", "remove", "--force", path_str]).await?
        } else {
            self.run(&["worktree", "remove", path_str]).await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CrewError::Worktree {
                message: stderr.to_string(),
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    pub async fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"]).await?;
        Ok(())
    }
}
