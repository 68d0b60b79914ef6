//! Reconciliation scanner and apply tests over a real project layout.

mod fixtures;

use std::sync::Arc;

use chrono::Utc;

use crew_pilot::config::{CrewConfig, ProjectPaths};
use crew_pilot::gc::StaleHookReason;
use crew_pilot::issue::{TYPE_AGENT, TYPE_EPIC, TYPE_MESSAGE};
use crew_pilot::lifecycle::{keys, resolve_record, LABEL_IN_PROGRESS, LABEL_MERGED, LABEL_READY};
use crew_pilot::{GcAction, GcEngine, MappingStore, WorkStatus};

use fixtures::{commit_file_in, git, record, FakeIssueStore, GitRepo};

struct GcHarness {
    repo: GitRepo,
    config: CrewConfig,
    paths: ProjectPaths,
    store: Arc<FakeIssueStore>,
}

impl GcHarness {
    async fn new() -> Self {
        let repo = GitRepo::init();
        let config = CrewConfig::default();
        let paths = ProjectPaths::new(repo.path().to_path_buf(), &config);
        paths.ensure_dirs().await.expect("create project dirs");
        Self {
            repo,
            config,
            paths,
            store: Arc::new(FakeIssueStore::new()),
        }
    }

    fn engine(&self) -> GcEngine {
        GcEngine::new(&self.paths, &self.config, self.store.clone())
    }

    fn mappings(&self) -> MappingStore {
        MappingStore::new(&self.paths.mappings_dir, self.config.git.clone())
    }
}

fn hooked_agent(id: &str, epic: &str, heartbeat: chrono::DateTime<Utc>) -> crew_pilot::IssueRecord {
    let mut agent = record(id, TYPE_AGENT, WorkStatus::Open);
    agent.description = format!(
        "hook.epic_id: {}\nhook.heartbeat_at: {}",
        epic,
        heartbeat.to_rfc3339()
    );
    agent
}

#[tokio::test]
async fn test_scan_flags_stale_heartbeat_hooks() {
    let h = GcHarness::new().await;
    let old = Utc::now() - chrono::Duration::hours(2);
    h.store.insert(hooked_agent("agent-1", "E1", old));
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::InProgress));

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(report.actions.iter().any(|a| matches!(
        a,
        GcAction::ReleaseStaleHook {
            agent_id,
            epic_id,
            reason: StaleHookReason::HeartbeatStale,
        } if agent_id == "agent-1" && epic_id == "E1"
    )));
}

#[tokio::test]
async fn test_scan_leaves_fresh_hooks_alone() {
    let h = GcHarness::new().await;
    h.store.insert(hooked_agent("agent-1", "E1", Utc::now()));
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::InProgress));

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::ReleaseStaleHook { .. })));
}

#[tokio::test]
async fn test_expired_lease_overrides_a_fresh_heartbeat() {
    let h = GcHarness::new().await;
    let mut agent = hooked_agent("agent-1", "E1", Utc::now());
    let expired = Utc::now() - chrono::Duration::minutes(1);
    agent.description = format!("{}\nhook.expires_at: {}", agent.description, expired.to_rfc3339());
    h.store.insert(agent);
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::InProgress));

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(report.actions.iter().any(|a| matches!(
        a,
        GcAction::ReleaseStaleHook {
            reason: StaleHookReason::LeaseExpired,
            ..
        }
    )));
}

#[tokio::test]
async fn test_applying_a_hook_release_reopens_the_epic() {
    let h = GcHarness::new().await;
    let old = Utc::now() - chrono::Duration::hours(2);
    h.store.insert(hooked_agent("agent-1", "E1", old));
    let mut epic = record("E1", TYPE_EPIC, WorkStatus::InProgress);
    epic.assignee = Some("agent-1".to_string());
    h.store.insert(epic);

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let releases: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::ReleaseStaleHook { .. }))
        .collect();
    assert_eq!(releases.len(), 1);

    let summary = engine.apply(&releases, false).await.expect("apply succeeds");
    assert_eq!(summary.applied, 1);
    assert!(summary.clean());

    let agent = h.store.get("agent-1").expect("record exists");
    assert_eq!(agent.meta(keys::HOOK_EPIC_ID), None);

    let epic = h.store.get("E1").expect("record exists");
    assert_eq!(resolve_record(&epic).status, WorkStatus::Open);
    assert_eq!(epic.assignee, None);
}

#[tokio::test]
async fn test_scan_flags_clean_orphan_worktrees() {
    let h = GcHarness::new().await;
    h.mappings()
        .ensure_mapping("E9")
        .await
        .expect("mapping created");
    git(
        h.repo.path(),
        &["worktree", "add", "-q", "-b", "crew/E9", ".worktrees/E9", "main"],
    );

    let report = h.engine().scan().await.expect("scan succeeds");
    let expected = h.repo.path().join(".worktrees/E9");
    assert!(report.actions.iter().any(|a| matches!(
        a,
        GcAction::RemoveOrphanWorktree { epic_id, path, dirty: false }
            if epic_id == "E9" && path == &expected
    )));
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::RemoveStaleMapping { .. })));
}

#[tokio::test]
async fn test_live_epics_keep_their_worktrees() {
    let h = GcHarness::new().await;
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::InProgress));
    h.mappings()
        .ensure_mapping("E1")
        .await
        .expect("mapping created");
    git(
        h.repo.path(),
        &["worktree", "add", "-q", "-b", "crew/E1", ".worktrees/E1", "main"],
    );

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::RemoveOrphanWorktree { .. })));
}

#[tokio::test]
async fn test_orphan_sweep_converges_to_a_removed_mapping() {
    let h = GcHarness::new().await;
    h.mappings()
        .ensure_mapping("E9")
        .await
        .expect("mapping created");
    git(
        h.repo.path(),
        &["worktree", "add", "-q", "-b", "crew/E9", ".worktrees/E9", "main"],
    );

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let removals: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::RemoveOrphanWorktree { .. }))
        .collect();
    let summary = engine.apply(&removals, false).await.expect("apply succeeds");
    assert_eq!(summary.applied, 1);
    assert!(!h.repo.path().join(".worktrees/E9").exists());
    // The sweep removes worktrees and mappings, never branches.
    assert!(h.repo.branch_exists("crew/E9"));

    let report = engine.scan().await.expect("rescan succeeds");
    let stale: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::RemoveStaleMapping { epic_id } if epic_id == "E9"))
        .collect();
    assert_eq!(stale.len(), 1);

    engine.apply(&stale, false).await.expect("apply succeeds");
    assert!(!h.paths.mapping_file("E9").exists());
}

#[tokio::test]
async fn test_dirty_orphan_worktrees_need_force() {
    let h = GcHarness::new().await;
    h.mappings()
        .ensure_mapping("E9")
        .await
        .expect("mapping created");
    git(
        h.repo.path(),
        &["worktree", "add", "-q", "-b", "crew/E9", ".worktrees/E9", "main"],
    );
    let worktree = h.repo.path().join(".worktrees/E9");
    std::fs::write(worktree.join("wip.txt"), "uncommitted\n").expect("write file");

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let removals: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::RemoveOrphanWorktree { dirty: true, .. }))
        .collect();
    assert_eq!(removals.len(), 1);

    let summary = engine.apply(&removals, false).await.expect("apply succeeds");
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped.len(), 1);
    assert!(summary.skipped[0].1.contains("confirm or pass --yes"));
    assert!(worktree.exists());

    let summary = engine.apply(&removals, true).await.expect("apply succeeds");
    assert_eq!(summary.applied, 1);
    assert!(!worktree.exists());
}

#[tokio::test]
async fn test_prune_is_vetoed_without_integration_proof() {
    let h = GcHarness::new().await;
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::Closed));
    h.mappings()
        .ensure_mapping("E1")
        .await
        .expect("mapping created");
    h.repo.checkout_new("crew/E1");
    h.repo.commit_file("a.txt", "a\n", "unmerged work");
    h.repo.checkout("main");

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::PruneEpicArtifacts { .. })));
    assert!(report.warnings.iter().any(|w| w.contains("pruning vetoed")));
}

#[tokio::test]
async fn test_prune_is_proposed_once_the_root_is_integrated() {
    let h = GcHarness::new().await;
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::Closed));
    h.mappings()
        .ensure_mapping("E1")
        .await
        .expect("mapping created");
    h.repo.checkout_new("crew/E1");
    h.repo.commit_file("a.txt", "a\n", "epic work");
    h.repo.checkout("main");
    git(h.repo.path(), &["merge", "-q", "--no-ff", "-m", "land epic", "crew/E1"]);

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(report.actions.iter().any(|a| matches!(
        a,
        GcAction::PruneEpicArtifacts { epic_id, parent_branch, branches, .. }
            if epic_id == "E1"
                && parent_branch == "main"
                && branches.contains(&"crew/E1".to_string())
    )));
}

#[tokio::test]
async fn test_applying_a_prune_deletes_branches_worktrees_and_mapping() {
    let h = GcHarness::new().await;
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::Closed));
    h.mappings()
        .ensure_mapping("E1")
        .await
        .expect("mapping created");
    h.repo.checkout_new("crew/E1");
    h.repo.commit_file("a.txt", "a\n", "epic work");
    h.repo.checkout("main");
    git(h.repo.path(), &["merge", "-q", "--no-ff", "-m", "land epic", "crew/E1"]);
    git(
        h.repo.path(),
        &["worktree", "add", "-q", ".worktrees/E1", "crew/E1"],
    );

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let prunes: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::PruneEpicArtifacts { .. }))
        .collect();
    assert_eq!(prunes.len(), 1);

    let summary = engine.apply(&prunes, false).await.expect("apply succeeds");
    assert_eq!(summary.applied, 1);
    assert!(!h.repo.branch_exists("crew/E1"));
    assert!(!h.repo.path().join(".worktrees/E1").exists());
    assert!(!h.paths.mapping_file("E1").exists());
}

#[tokio::test]
async fn test_a_vanished_changeset_with_a_live_branch_vetoes_prune() {
    let h = GcHarness::new().await;
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::Closed));
    let mappings = h.mappings();
    mappings.ensure_mapping("E1").await.expect("mapping created");
    let (branch, _) = mappings
        .ensure_changeset_branch("E1", "E1.CS1")
        .await
        .expect("changeset branch recorded");
    assert_eq!(branch, "crew/E1-CS1");

    // Root integrated, but the recorded changeset branch still exists while
    // its record is gone from the store.
    h.repo.checkout_new("crew/E1");
    h.repo.commit_file("a.txt", "a\n", "epic work");
    h.repo.checkout("main");
    git(h.repo.path(), &["merge", "-q", "--no-ff", "-m", "land epic", "crew/E1"]);
    h.repo.checkout_new(&branch);
    h.repo.commit_file("cs.txt", "cs\n", "stray changeset work");
    h.repo.checkout("main");

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::PruneEpicArtifacts { .. })));
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("vanished") && w.contains("E1.CS1")));
}

#[tokio::test]
async fn test_merged_pr_tombstones_are_closed() {
    let h = GcHarness::new().await;
    let mut cs = record("E1.CS1", "task", WorkStatus::Open);
    cs.description = "changeset.pr_merged_at: 2026-01-10T00:00:00+00:00".to_string();
    h.store.insert(cs);

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let tombstones: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(
            a,
            GcAction::NormalizeStatus { issue_id, tombstone: true, .. } if issue_id == "E1.CS1"
        ))
        .collect();
    assert_eq!(tombstones.len(), 1);

    engine.apply(&tombstones, false).await.expect("apply succeeds");
    let closed = h.store.get("E1.CS1").expect("record exists");
    assert_eq!(resolve_record(&closed).status, WorkStatus::Closed);
    assert!(closed.has_label(LABEL_MERGED));
    assert!(closed.notes.contains("closed by reconciliation"));
    assert_eq!(closed.meta(keys::CS_PR_STATE).as_deref(), Some("merged"));
}

#[tokio::test]
async fn test_label_only_records_get_their_status_backfilled() {
    let h = GcHarness::new().await;
    let mut cs = record("E1.CS1", "task", WorkStatus::Open);
    cs.status = None;
    cs.labels.push(LABEL_IN_PROGRESS.to_string());
    h.store.insert(cs);

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let backfills: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(
            a,
            GcAction::NormalizeStatus {
                issue_id,
                set_status: Some(WorkStatus::InProgress),
                tombstone: false,
                ..
            } if issue_id == "E1.CS1"
        ))
        .collect();
    assert_eq!(backfills.len(), 1);

    engine.apply(&backfills, false).await.expect("apply succeeds");
    let record = h.store.get("E1.CS1").expect("record exists");
    assert_eq!(record.status.as_deref(), Some("in_progress"));
}

#[tokio::test]
async fn test_consistent_records_produce_no_normalization() {
    let h = GcHarness::new().await;
    let mut cs = record("E1.CS1", "task", WorkStatus::Open);
    cs.labels.push(LABEL_READY.to_string());
    h.store.insert(cs);

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::NormalizeStatus { .. })));
}

#[tokio::test]
async fn test_expired_queue_claims_are_cleared_without_closing() {
    let h = GcHarness::new().await;
    let mut msg = record("M1", TYPE_MESSAGE, WorkStatus::Open);
    msg.labels.push("msg:queue".to_string());
    let claimed = Utc::now() - chrono::Duration::hours(2);
    msg.description = format!(
        "claim.claimed_by: agent-2\nclaim.claimed_at: {}",
        claimed.to_rfc3339()
    );
    h.store.insert(msg);

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let expiries: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(
            a,
            GcAction::ExpireQueueClaim { message_id, claimed_by }
                if message_id == "M1" && claimed_by.as_deref() == Some("agent-2")
        ))
        .collect();
    assert_eq!(expiries.len(), 1);

    engine.apply(&expiries, false).await.expect("apply succeeds");
    let msg = h.store.get("M1").expect("record exists");
    assert_eq!(msg.meta("claim.claimed_by"), None);
    assert_eq!(msg.meta("claim.claimed_at"), None);
    assert_ne!(resolve_record(&msg).status, WorkStatus::Closed);
}

#[tokio::test]
async fn test_fresh_queue_claims_survive() {
    let h = GcHarness::new().await;
    let mut msg = record("M1", TYPE_MESSAGE, WorkStatus::Open);
    msg.labels.push("msg:queue".to_string());
    let claimed = Utc::now() - chrono::Duration::minutes(10);
    msg.description = format!(
        "claim.claimed_by: agent-2\nclaim.claimed_at: {}",
        claimed.to_rfc3339()
    );
    h.store.insert(msg);

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report
        .actions
        .iter()
        .any(|a| matches!(a, GcAction::ExpireQueueClaim { .. })));
}

#[tokio::test]
async fn test_old_channel_messages_are_closed() {
    let h = GcHarness::new().await;
    let mut msg = record("M2", TYPE_MESSAGE, WorkStatus::Open);
    msg.labels.push("msg:channel".to_string());
    msg.created_at = Some(Utc::now() - chrono::Duration::days(8));
    h.store.insert(msg);

    let engine = h.engine();
    let report = engine.scan().await.expect("scan succeeds");
    let closes: Vec<_> = report
        .actions
        .into_iter()
        .filter(|a| matches!(a, GcAction::CloseExpiredMessage { message_id, .. } if message_id == "M2"))
        .collect();
    assert_eq!(closes.len(), 1);

    engine.apply(&closes, false).await.expect("apply succeeds");
    let msg = h.store.get("M2").expect("record exists");
    assert_eq!(resolve_record(&msg).status, WorkStatus::Closed);
    assert!(msg.notes.contains("expired:"));
}

#[tokio::test]
async fn test_scanning_never_mutates_anything() {
    let h = GcHarness::new().await;
    let old = Utc::now() - chrono::Duration::hours(2);
    h.store.insert(hooked_agent("agent-1", "E1", old));
    h.store.insert(record("E1", TYPE_EPIC, WorkStatus::InProgress));
    h.mappings()
        .ensure_mapping("E9")
        .await
        .expect("mapping created");
    git(
        h.repo.path(),
        &["worktree", "add", "-q", "-b", "crew/E9", ".worktrees/E9", "main"],
    );
    commit_file_in(
        &h.repo.path().join(".worktrees/E9"),
        "work.txt",
        "w\n",
        "worktree commit",
    );

    let report = h.engine().scan().await.expect("scan succeeds");
    assert!(!report.is_empty());

    let agent = h.store.get("agent-1").expect("record exists");
    assert_eq!(agent.meta(keys::HOOK_EPIC_ID).as_deref(), Some("E1"));
    assert!(h.repo.path().join(".worktrees/E9").exists());
    assert!(h.paths.mapping_file("E9").exists());
}
