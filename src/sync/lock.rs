//! Mutual exclusion for planner worktree syncs.
//!
//! One heartbeat lock file per (agent, worktree) pair. Contention degrades
//! to skipping the sync round; a lock is stolen only when its heartbeat has
//! gone stale, never on first contact.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLockInfo {
    pub agent_id: String,
    pub worktree: String,
    pub heartbeat_at: DateTime<Utc>,
}

impl SyncLockInfo {
    pub fn new(agent_id: &str, worktree: &Path) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            worktree: worktree.display().to_string(),
            heartbeat_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.heartbeat_at);
        // Negative elapsed means clock skew; allow recovery rather than
        // blocking indefinitely.
        elapsed.to_std().map(|d| d > ttl).unwrap_or(true)
    }
}

/// One lock file per (agent, worktree) pair.
fn lock_file_name(agent_id: &str, worktree: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    agent_id.hash(&mut hasher);
    worktree.hash(&mut hasher);
    format!("{:016x}.lock", hasher.finish())
}

pub struct SyncLocker {
    locks_dir: PathBuf,
    ttl: Duration,
    heartbeat_interval: Duration,
}

impl SyncLocker {
    pub fn new(locks_dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            // Refresh well inside the TTL so a live holder never looks stale.
            heartbeat_interval: ttl / 3,
            ttl,
        }
    }

    pub fn lock_path(&self, agent_id: &str, worktree: &Path) -> PathBuf {
        self.locks_dir.join(lock_file_name(agent_id, worktree))
    }

    pub async fn read(&self, agent_id: &str, worktree: &Path) -> Result<Option<SyncLockInfo>> {
        let path = self.lock_path(agent_id, worktree);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take the lock. `Ok(None)` means a live holder has it and this
    /// round should be skipped.
    pub async fn try_acquire(
        &self,
        agent_id: &str,
        worktree: &Path,
    ) -> Result<Option<SyncLockGuard>> {
        fs::create_dir_all(&self.locks_dir).await?;
        let path = self.lock_path(agent_id, worktree);

        if let Some(existing) = self.read(agent_id, worktree).await? {
            if !existing.is_stale(self.ttl) {
                debug!(agent = %agent_id, holder = %existing.agent_id,
                       "Sync lock held with a fresh heartbeat, skipping");
                return Ok(None);
            }
            info!(agent = %agent_id, holder = %existing.agent_id,
                  heartbeat = %existing.heartbeat_at, "Stealing stale sync lock");
        }

        let info = SyncLockInfo::new(agent_id, worktree);
        let content = serde_json::to_string_pretty(&info)?;
        let temp_path = self
            .locks_dir
            .join(format!("{}.{}.tmp", lock_file_name(agent_id, worktree), std::process::id()));
        fs::write(&temp_path, &content).await?;

        match fs::rename(&temp_path, &path).await {
            Ok(_) => {
                debug!(agent = %agent_id, path = %path.display(), "Sync lock acquired");
                Ok(Some(SyncLockGuard::new(path, self.heartbeat_interval)))
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e.into())
            }
        }
    }
}

/// Holds the lock file, refreshing its heartbeat until dropped.
pub struct SyncLockGuard {
    path: PathBuf,
    shutdown_tx: Option<watch::Sender<bool>>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SyncLockGuard {
    fn new(path: PathBuf, heartbeat_interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let lock_path = path.clone();

        let handle = tokio::spawn(async move {
            Self::heartbeat_loop(lock_path, heartbeat_interval, shutdown_rx).await;
        });

        Self {
            path,
            shutdown_tx: Some(shutdown_tx),
            heartbeat_handle: Some(handle),
        }
    }

    async fn heartbeat_loop(
        lock_path: PathBuf,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = Self::refresh_heartbeat(&lock_path).await {
                        warn!(path = %lock_path.display(), error = %e, "Heartbeat update failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Heartbeat loop shutdown");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh_heartbeat(lock_path: &Path) -> std::io::Result<()> {
        let content = fs::read_to_string(lock_path).await?;
        let mut info: SyncLockInfo = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        info.heartbeat_at = Utc::now();
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let temp_path = lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, &json).await?;
        fs::rename(&temp_path, lock_path).await
    }
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }

        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            if !std::thread::panicking() {
                warn!(path = %self.path.display(), error = %e, "Failed to release sync lock");
            } else {
                eprintln!(
                    "[crew-pilot] Failed to release sync lock {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        let info = SyncLockInfo::new("planner", Path::new("/tmp/wt"));
        assert!(!info.is_stale(Duration::from_secs(120)));
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let mut info = SyncLockInfo::new("planner", Path::new("/tmp/wt"));
        info.heartbeat_at = Utc::now() - chrono::Duration::seconds(600);
        assert!(info.is_stale(Duration::from_secs(120)));
    }

    #[test]
    fn future_heartbeat_counts_as_stale() {
        let mut info = SyncLockInfo::new("planner", Path::new("/tmp/wt"));
        info.heartbeat_at = Utc::now() + chrono::Duration::seconds(600);
        assert!(info.is_stale(Duration::from_secs(120)));
    }

    #[test]
    fn lock_name_depends_on_agent_and_worktree() {
        let a = lock_file_name("planner", Path::new("/repo/.worktrees/planner"));
        let b = lock_file_name("planner", Path::new("/repo/.worktrees/planner"));
        let c = lock_file_name("planner", Path::new("/repo/.worktrees/other"));
        let d = lock_file_name("builder", Path::new("/repo/.worktrees/planner"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
