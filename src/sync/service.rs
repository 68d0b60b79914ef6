//! Planner sync service: keeps the planner worktree fast-forwarded onto the
//! shared default branch.
//!
//! Three triggers feed the same algorithm. Startup syncs are forced; periodic
//! and event-driven syncs respect failure backoff, and event syncs are
//! additionally debounced. A dirty planner tree suspends syncing entirely
//! until a human intervenes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{CrewError, Result};
use crate::git::GitRunner;
use crate::issue::{IssueRecord, IssueStore, IssueUpdate};

use super::lock::SyncLocker;
use super::state::{
    SyncState, FAILURE_WARN_THRESHOLD, RESULT_DIRTY, RESULT_FAILED, RESULT_SYNCED,
};

/// Grace period for the periodic monitor to finish an in-flight sync on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Startup,
    Periodic,
    Event,
}

impl SyncTrigger {
    /// Forced triggers skip backoff and debounce gating.
    pub fn is_forced(&self) -> bool {
        matches!(self, SyncTrigger::Startup)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Event => "event",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced { sha: String },
    Dirty,
    LockHeld,
    Backoff { remaining: Duration },
    Debounced,
    Failed { message: String },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Synced { sha } => write!(f, "synced to {}", sha),
            SyncOutcome::Dirty => write!(f, "skipped: planner tree dirty"),
            SyncOutcome::LockHeld => write!(f, "skipped: sync lock held"),
            SyncOutcome::Backoff { remaining } => {
                write!(f, "skipped: backing off ({}s left)", remaining.as_secs())
            }
            SyncOutcome::Debounced => write!(f, "skipped: within event debounce window"),
            SyncOutcome::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

/// Shared sync machinery, usable from the service monitor and from one-shot
/// CLI invocations alike.
pub struct SyncCore {
    agent_id: String,
    worktree: PathBuf,
    git: GitRunner,
    store: Arc<dyn IssueStore>,
    locker: SyncLocker,
    config: SyncConfig,
    default_branch: String,
}

impl SyncCore {
    pub fn new(
        agent_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        locks_dir: impl Into<PathBuf>,
        store: Arc<dyn IssueStore>,
        config: SyncConfig,
        default_branch: impl Into<String>,
    ) -> Self {
        let worktree = worktree.into();
        let locker = SyncLocker::new(locks_dir, config.lock_ttl());
        Self {
            agent_id: agent_id.into(),
            git: GitRunner::new(&worktree),
            worktree,
            store,
            locker,
            config,
            default_branch: default_branch.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// One full sync attempt. Gating skips return early without touching
    /// git or the recorded state; everything past the lock is an attempt
    /// and gets recorded whether or not it moves the tree.
    pub async fn sync_once(&self, trigger: SyncTrigger) -> Result<SyncOutcome> {
        let record = self
            .store
            .show(&self.agent_id)
            .await?
            .ok_or_else(|| {
                CrewError::UnexpectedState(format!(
                    "agent record '{}' missing from issue store",
                    self.agent_id
                ))
            })?;
        let mut state = SyncState::from_record(&record);
        let now = Utc::now();

        if !trigger.is_forced() {
            if let Some(remaining) = state.backoff_remaining(now) {
                debug!(trigger = %trigger, remaining_secs = remaining.as_secs(),
                       "Sync suppressed by failure backoff");
                return Ok(SyncOutcome::Backoff { remaining });
            }
        }

        if trigger == SyncTrigger::Event
            && let Some(last) = state.last_event_attempt_at
            && now
                .signed_duration_since(last)
                .to_std()
                .map(|d| d < self.config.event_debounce())
                .unwrap_or(false)
        {
            debug!("Event sync debounced");
            return Ok(SyncOutcome::Debounced);
        }

        let Some(_guard) = self
            .locker
            .try_acquire(&self.agent_id, &self.worktree)
            .await?
        else {
            return Ok(SyncOutcome::LockHeld);
        };

        state.last_attempt_at = Some(now);
        state.default_branch = Some(self.default_branch.clone());
        if trigger == SyncTrigger::Event {
            state.last_event_attempt_at = Some(now);
        }

        let dirty = match self.git.is_dirty().await {
            Ok(dirty) => dirty,
            Err(e) => return self.record_failure(&record, state, e).await,
        };

        if dirty {
            let since = *state.dirty_since_at.get_or_insert(now);
            let long_dirty = now
                .signed_duration_since(since)
                .to_std()
                .map(|d| d >= self.config.dirty_warn_after())
                .unwrap_or(false);

            if long_dirty && !state.warned_for_dirty_episode() {
                warn!(
                    worktree = %self.worktree.display(),
                    dirty_since = %since,
                    "Planner worktree has uncommitted changes; sync suspended until it is cleaned"
                );
                state.last_dirty_warning_at = Some(now);
            }

            state.last_result = Some(RESULT_DIRTY.to_string());
            self.persist(&record, &state).await?;
            return Ok(SyncOutcome::Dirty);
        }

        state.dirty_since_at = None;

        match self.fast_forward().await {
            Ok(sha) => {
                info!(trigger = %trigger, sha = %sha, branch = %self.default_branch,
                      "Planner worktree synced");
                state.last_synced_sha = Some(sha.clone());
                state.last_synced_at = Some(now);
                state.consecutive_failures = 0;
                state.last_result = Some(RESULT_SYNCED.to_string());
                self.persist(&record, &state).await?;
                Ok(SyncOutcome::Synced { sha })
            }
            Err(e) => self.record_failure(&record, state, e).await,
        }
    }

    /// Fetch, check out the planner branch, and hard-reset it onto the
    /// freshest default ref available.
    async fn fast_forward(&self) -> Result<String> {
        if self.git.remote_exists("origin").await? {
            self.git.fetch("origin", &self.default_branch).await?;
        }

        let remote_ref = format!("refs/remotes/origin/{}", self.default_branch);
        let local_ref = format!("refs/heads/{}", self.default_branch);
        let target = if self.git.rev_parse(&remote_ref).await?.is_some() {
            remote_ref
        } else if self.git.rev_parse(&local_ref).await?.is_some() {
            local_ref
        } else {
            return Err(CrewError::Validation(format!(
                "default branch '{}' not found locally or on origin",
                self.default_branch
            )));
        };

        let planner = &self.config.planner_branch;
        if self.git.branch_exists(planner).await? {
            self.git.checkout(planner).await?;
        } else {
            self.git.checkout_new(planner, &target).await?;
        }
        self.git.reset_hard(&target).await?;
        self.git.head_sha().await
    }

    async fn record_failure(
        &self,
        record: &IssueRecord,
        mut state: SyncState,
        error: CrewError,
    ) -> Result<SyncOutcome> {
        state.consecutive_failures += 1;
        state.last_result = Some(RESULT_FAILED.to_string());

        if state.consecutive_failures == FAILURE_WARN_THRESHOLD {
            warn!(
                agent = %self.agent_id,
                failures = state.consecutive_failures,
                error = %error,
                "Planner sync keeps failing"
            );
        } else {
            debug!(agent = %self.agent_id, failures = state.consecutive_failures,
                   error = %error, "Planner sync attempt failed");
        }

        self.persist(record, &state).await?;
        Ok(SyncOutcome::Failed {
            message: error.to_string(),
        })
    }

    async fn persist(&self, record: &IssueRecord, state: &SyncState) -> Result<()> {
        let description = state.apply_to(&record.description);
        self.store
            .update(&record.id, IssueUpdate::new().description(&description))
            .await
    }
}

/// Long-running wrapper: startup sync plus a periodic monitor task.
pub struct PlannerSyncService {
    core: Arc<SyncCore>,
    shutdown_tx: watch::Sender<bool>,
    monitor: Option<JoinHandle<()>>,
}

impl PlannerSyncService {
    pub fn new(core: SyncCore) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(core),
            shutdown_tx,
            monitor: None,
        }
    }

    /// Run the forced startup sync, then begin the periodic monitor.
    pub async fn start(&mut self) -> Result<SyncOutcome> {
        let outcome = self.core.sync_once(SyncTrigger::Startup).await?;

        let core = self.core.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.core.config.effective_interval();

        self.monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The startup sync just ran; skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match core.sync_once(SyncTrigger::Periodic).await {
                            Ok(outcome) => debug!(outcome = %outcome, "Periodic planner sync"),
                            Err(e) => warn!(error = %e, "Periodic planner sync errored"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Planner sync monitor stopped");
        }));

        Ok(outcome)
    }

    /// Debounced sync on planner activity.
    pub async fn notify_event(&self) -> Result<SyncOutcome> {
        self.core.sync_once(SyncTrigger::Event).await
    }

    /// Signal the monitor and wait (bounded) for it to wind down.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut handle) = self.monitor.take()
            && tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err()
        {
            warn!("Planner sync monitor did not stop in time; aborting it");
            handle.abort();
        }
    }
}

impl Drop for PlannerSyncService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.monitor.take() {
            handle.abort();
        }
    }
}
