//! Planner worktree sync tests: gating, dirty suspension, and fast-forwards.

mod fixtures;

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use crew_pilot::config::SyncConfig;
use crew_pilot::issue::TYPE_AGENT;
use crew_pilot::sync::{SyncLocker, SyncState, SyncTrigger, RESULT_DIRTY, RESULT_SYNCED};
use crew_pilot::{CrewError, SyncCore, SyncOutcome, WorkStatus};

use fixtures::{record, FakeIssueStore, GitRepo};

fn planner_core(repo: &GitRepo, locks: &TempDir, store: Arc<FakeIssueStore>) -> SyncCore {
    SyncCore::new(
        "planner",
        repo.path(),
        locks.path(),
        store,
        SyncConfig::default(),
        "main",
    )
}

fn seed_agent(store: &FakeIssueStore) {
    store.insert(record("planner", TYPE_AGENT, WorkStatus::Open));
}

fn agent_state(store: &FakeIssueStore) -> SyncState {
    SyncState::from_record(&store.get("planner").expect("agent record exists"))
}

#[tokio::test]
async fn test_startup_sync_creates_and_advances_the_planner_branch() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);

    let core = planner_core(&repo, &locks, store.clone());
    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync succeeds");

    let SyncOutcome::Synced { sha } = outcome else {
        panic!("expected a sync, got {:?}", outcome);
    };
    assert_eq!(sha, repo.sha("main"));
    assert!(repo.branch_exists("planner"));
    assert_eq!(repo.sha("planner"), sha);

    let state = agent_state(&store);
    assert_eq!(state.last_result.as_deref(), Some(RESULT_SYNCED));
    assert_eq!(state.last_synced_sha.as_deref(), Some(sha.as_str()));
    assert_eq!(state.default_branch.as_deref(), Some("main"));
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_planner_branch_follows_new_commits() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    let core = planner_core(&repo, &locks, store.clone());

    core.sync_once(SyncTrigger::Startup)
        .await
        .expect("first sync succeeds");

    repo.checkout("main");
    let advanced = repo.commit_file("plan.md", "v2\n", "advance main");

    let outcome = core
        .sync_once(SyncTrigger::Periodic)
        .await
        .expect("second sync succeeds");
    assert_eq!(outcome, SyncOutcome::Synced { sha: advanced.clone() });
    assert_eq!(repo.sha("planner"), advanced);
}

#[tokio::test]
async fn test_missing_agent_record_is_unexpected_state() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());

    let core = planner_core(&repo, &locks, store);
    let err = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect_err("sync must fail");
    assert!(matches!(err, CrewError::UnexpectedState(_)));
}

#[tokio::test]
async fn test_dirty_worktree_suspends_the_sync() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    std::fs::write(repo.path().join("scratch.txt"), "uncommitted\n").expect("write file");

    let core = planner_core(&repo, &locks, store.clone());
    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync succeeds");

    assert_eq!(outcome, SyncOutcome::Dirty);
    assert!(!repo.branch_exists("planner"));

    let state = agent_state(&store);
    assert_eq!(state.last_result.as_deref(), Some(RESULT_DIRTY));
    assert!(state.dirty_since_at.is_some());
    // A dirty tree is not a sync failure.
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_cleaning_the_tree_ends_the_dirty_episode() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    let scratch = repo.path().join("scratch.txt");
    std::fs::write(&scratch, "uncommitted\n").expect("write file");

    let core = planner_core(&repo, &locks, store.clone());
    core.sync_once(SyncTrigger::Startup)
        .await
        .expect("dirty sync succeeds");
    assert!(agent_state(&store).dirty_since_at.is_some());

    std::fs::remove_file(&scratch).expect("remove file");
    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("clean sync succeeds");
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));
    assert_eq!(agent_state(&store).dirty_since_at, None);
}

#[tokio::test]
async fn test_sync_failure_is_recorded() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);

    let core = SyncCore::new(
        "planner",
        repo.path(),
        locks.path(),
        store.clone(),
        SyncConfig::default(),
        "ghost",
    );
    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync completes with a failure outcome");

    let SyncOutcome::Failed { message } = outcome else {
        panic!("expected a failure, got {:?}", outcome);
    };
    assert!(message.contains("ghost"));
    assert_eq!(agent_state(&store).consecutive_failures, 1);
}

#[tokio::test]
async fn test_backoff_gates_periodic_syncs_but_not_startup() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    let mut agent = record("planner", TYPE_AGENT, WorkStatus::Open);
    agent.description = format!(
        "planner_sync.consecutive_failures: 2\nplanner_sync.last_attempt_at: {}",
        Utc::now().to_rfc3339()
    );
    store.insert(agent);
    let core = planner_core(&repo, &locks, store.clone());

    let gated = core
        .sync_once(SyncTrigger::Periodic)
        .await
        .expect("sync completes");
    assert!(matches!(gated, SyncOutcome::Backoff { .. }));

    let forced = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync completes");
    assert!(matches!(forced, SyncOutcome::Synced { .. }));
}

#[tokio::test]
async fn test_a_success_resets_the_failure_count() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    let mut agent = record("planner", TYPE_AGENT, WorkStatus::Open);
    let stale_attempt = Utc::now() - chrono::Duration::minutes(30);
    agent.description = format!(
        "planner_sync.consecutive_failures: 2\nplanner_sync.last_attempt_at: {}",
        stale_attempt.to_rfc3339()
    );
    store.insert(agent);
    let core = planner_core(&repo, &locks, store.clone());

    let outcome = core
        .sync_once(SyncTrigger::Periodic)
        .await
        .expect("sync succeeds");
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));
    assert_eq!(agent_state(&store).consecutive_failures, 0);
}

#[tokio::test]
async fn test_event_syncs_are_debounced() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    let mut agent = record("planner", TYPE_AGENT, WorkStatus::Open);
    agent.description = format!(
        "planner_sync.last_event_attempt_at: {}",
        Utc::now().to_rfc3339()
    );
    store.insert(agent);
    let core = planner_core(&repo, &locks, store.clone());

    let outcome = core
        .sync_once(SyncTrigger::Event)
        .await
        .expect("sync completes");
    assert_eq!(outcome, SyncOutcome::Debounced);
}

#[tokio::test]
async fn test_event_syncs_record_their_attempt_time() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    let core = planner_core(&repo, &locks, store.clone());

    let outcome = core
        .sync_once(SyncTrigger::Event)
        .await
        .expect("sync succeeds");
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));
    assert!(agent_state(&store).last_event_attempt_at.is_some());
}

#[tokio::test]
async fn test_a_held_lock_skips_the_round() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    let core = planner_core(&repo, &locks, store.clone());

    let config = SyncConfig::default();
    let locker = SyncLocker::new(locks.path(), config.lock_ttl());
    let guard = locker
        .try_acquire("planner", repo.path())
        .await
        .expect("lock acquires")
        .expect("lock is free");

    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync completes");
    assert_eq!(outcome, SyncOutcome::LockHeld);

    drop(guard);
    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync succeeds");
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));
}

#[tokio::test]
async fn test_sync_prefers_the_origin_ref_over_the_local_branch() {
    let repo = GitRepo::init();
    let locks = TempDir::new().expect("create temp dir");
    let origin = TempDir::new().expect("create temp dir");
    fixtures::git(origin.path(), &["init", "-q", "--bare", "-b", "main"]);
    let url = origin.path().to_str().expect("utf8 path").to_string();
    fixtures::git(repo.path(), &["remote", "add", "origin", &url]);

    let ahead = repo.commit_file("plan.md", "v2\n", "advance main");
    fixtures::git(repo.path(), &["push", "-q", "origin", "main"]);
    fixtures::git(repo.path(), &["reset", "-q", "--hard", "HEAD~1"]);
    assert_ne!(repo.sha("main"), ahead);

    let store = Arc::new(FakeIssueStore::new());
    seed_agent(&store);
    let core = planner_core(&repo, &locks, store);

    let outcome = core
        .sync_once(SyncTrigger::Startup)
        .await
        .expect("sync succeeds");
    assert_eq!(outcome, SyncOutcome::Synced { sha: ahead.clone() });
    assert_eq!(repo.sha("planner"), ahead);
}
