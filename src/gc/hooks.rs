//! Stale hook detection.
//!
//! A hook binds an epic to an agent via metadata on the agent's own record.
//! Hooks are released when the lease expired, the heartbeat aged out, the
//! owning process is verifiably gone, or (behind a config flag) when no
//! heartbeat was ever written.

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::issue::{IssueFilter, IssueRecord, TYPE_AGENT};
use crate::lifecycle::keys;
use crate::process::{hostname, is_process_running};

use super::action::{GcAction, StaleHookReason};
use super::engine::{GcEngine, GcReport};

impl GcEngine {
    pub(super) async fn scan_stale_hooks(
        &self,
        now: DateTime<Utc>,
        report: &mut GcReport,
    ) -> Result<()> {
        let agents = self.store.list(&IssueFilter::by_type(TYPE_AGENT)).await?;
        let window = Duration::seconds(self.config.stale_hook_secs as i64);
        let host = hostname();

        for agent in agents {
            let Some(epic_id) = agent.meta(keys::HOOK_EPIC_ID) else {
                continue;
            };
            if let Some(reason) =
                hook_staleness(&agent, now, window, &host, self.config.stale_if_missing_heartbeat)
            {
                report.push(GcAction::ReleaseStaleHook {
                    agent_id: agent.id.clone(),
                    epic_id,
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// Pure staleness decision for one agent record holding a hook.
fn hook_staleness(
    agent: &IssueRecord,
    now: DateTime<Utc>,
    window: Duration,
    local_host: &str,
    stale_if_missing_heartbeat: bool,
) -> Option<StaleHookReason> {
    // An expired lease releases regardless of heartbeat.
    if let Some(expires) = agent.meta_time(keys::HOOK_EXPIRES_AT)
        && expires <= now
    {
        return Some(StaleHookReason::LeaseExpired);
    }

    match agent.meta_time(keys::HOOK_HEARTBEAT_AT) {
        Some(heartbeat) if now.signed_duration_since(heartbeat) > window => {
            return Some(StaleHookReason::HeartbeatStale);
        }
        Some(_) => {}
        None if stale_if_missing_heartbeat => {
            return Some(StaleHookReason::MissingHeartbeat);
        }
        None => {}
    }

    // Process liveness is only checkable for hooks taken on this host.
    if let Some(pid) = agent.meta(keys::HOOK_PID).and_then(|p| p.parse::<u32>().ok())
        && agent.meta(keys::HOOK_HOST).as_deref() == Some(local_host)
        && !is_process_running(pid)
    {
        return Some(StaleHookReason::ProcessDead);
    }

    None
}
