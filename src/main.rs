use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crew_pilot::cli::{Cli, Commands, ConfigAction, Display, EpicView, OutputFormat};
use crew_pilot::config::{CrewConfig, ProjectPaths};
use crew_pilot::error::{CrewError, Result};
use crew_pilot::gc::{ApplyResult, GcApplySummary, GcEngine};
use crew_pilot::git::GitRunner;
use crew_pilot::integrate::{
    ChangesetRefs, Evidence, HistoryMode, IntegrationEngine, IntegrationOutcome, IntegrationSignal,
};
use crew_pilot::issue::{
    meta_apply, IssueCli, IssueFilter, IssueRecord, IssueStore, IssueUpdate, TYPE_AGENT, TYPE_EPIC,
    TYPE_MESSAGE,
};
use crew_pilot::lifecycle::{keys, resolve_record, CloseProof, Lifecycle};
use crew_pilot::mapping::{changeset_branch_name, MappingStore, WorktreeMapping};
use crew_pilot::output::{
    BranchOutput, ClaimOutput, EpicStatusOutput, IntegrateOutput, OutputWriter,
};
use crew_pilot::sync::{PlannerSyncService, SyncCore, SyncOutcome, SyncTrigger};

/// Context for command output handling.
struct OutputContext<'a> {
    display: &'a Display,
    writer: &'a OutputWriter,
}

impl OutputContext<'_> {
    fn json(&self) -> bool {
        self.writer.format() == OutputFormat::Json
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("crew_pilot=debug")
    } else {
        EnvFilter::new("crew_pilot=info")
    };

    // Logs go to stderr so `--output json` keeps stdout parseable.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let writer = OutputWriter::new(cli.output);
    let out = OutputContext {
        display: &display,
        writer: &writer,
    };

    match cli.command {
        Commands::Init => cmd_init(&out).await,
        Commands::Claim {
            id,
            agent,
            lease_secs,
            epic,
        } => cmd_claim(&out, &id, &agent, lease_secs, epic.as_deref()).await,
        Commands::Branch {
            changeset_id,
            epic,
            worktree,
        } => cmd_branch(&out, &changeset_id, epic.as_deref(), worktree).await,
        Commands::Integrate { id, mode, epic } => {
            cmd_integrate(&out, &id, mode, epic.as_deref()).await
        }
        Commands::Signal { id, epic } => cmd_signal(&out, &id, epic.as_deref()).await,
        Commands::Sync {
            agent,
            watch,
            event,
        } => cmd_sync(&out, &agent, watch, event).await,
        Commands::Gc { dry_run, yes } => cmd_gc(&out, dry_run, yes).await,
        Commands::Status { id } => cmd_status(&out, id.as_deref()).await,
        Commands::Config { action } => cmd_config(&out, action).await,
    }
}

async fn cmd_init(out: &OutputContext<'_>) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::default();
    let paths = ProjectPaths::new(root, &config);

    if paths.config_file().exists() {
        if out.json() {
            out.writer.emit_message("already initialized");
        } else {
            out.display
                .print_warning("Already initialized; existing configuration left in place.");
        }
        return Ok(());
    }

    paths.ensure_dirs().await?;
    config.save(&paths.crew_dir).await?;

    if out.json() {
        out.writer.emit_message("initialized");
    } else {
        out.display.print_success("Initialized crew-pilot.");
        out.display
            .print_info(&format!("Configuration: {}", paths.config_file().display()));
        out.display
            .print_info(&format!("Mappings: {}", paths.mappings_dir.display()));
    }
    Ok(())
}

async fn cmd_claim(
    out: &OutputContext<'_>,
    id: &str,
    agent: &str,
    lease_secs: Option<u64>,
    epic: Option<&str>,
) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let lifecycle = Lifecycle::new(store.clone());
    let mappings = MappingStore::new(&paths.mappings_dir, config.git.clone());
    mappings.init().await?;
    let git = GitRunner::new(&paths.root);

    let record = store.show(id).await?;
    let as_epic = epic.is_none() && record.as_ref().is_some_and(|r| r.is_type(TYPE_EPIC));

    if as_epic {
        let lease = lease_secs.map(Duration::from_secs);
        let epic_record = lifecycle.claim_epic(id, agent, lease).await?;
        let mapping =
            materialize_epic(&store, &mappings, &git, &config, &epic_record, &paths.root).await?;

        if out.json() {
            out.writer.emit(&ClaimOutput {
                id: id.to_string(),
                agent: agent.to_string(),
                kind: "epic".to_string(),
                status: resolve_record(&epic_record).status.to_string(),
                root_branch: Some(mapping.root_branch),
                work_branch: None,
                worktree: Some(mapping.worktree_path),
            });
        } else {
            out.display
                .print_success(&format!("Claimed epic {} for {}", id, agent));
            out.display
                .print_info(&format!("Root branch: {}", mapping.root_branch));
            out.display
                .print_info(&format!("Worktree: {}", mapping.worktree_path));
        }
        return Ok(());
    }

    let epic_id = epic_of(id, epic)?;
    let claimed = lifecycle.claim_changeset(id, agent).await?;
    let m = materialize_changeset(
        &store, &mappings, &git, &config, &epic_id, id, false, &paths.root,
    )
    .await?;

    if out.json() {
        out.writer.emit(&ClaimOutput {
            id: id.to_string(),
            agent: agent.to_string(),
            kind: "changeset".to_string(),
            status: resolve_record(&claimed).status.to_string(),
            root_branch: None,
            work_branch: Some(m.branch),
            worktree: m.worktree,
        });
    } else {
        out.display
            .print_success(&format!("Claimed changeset {} for {}", id, agent));
        out.display.print_info(&format!("Work branch: {}", m.branch));
    }
    Ok(())
}

async fn cmd_branch(
    out: &OutputContext<'_>,
    changeset_id: &str,
    epic: Option<&str>,
    worktree: bool,
) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let mappings = MappingStore::new(&paths.mappings_dir, config.git.clone());
    mappings.init().await?;
    let git = GitRunner::new(&paths.root);

    let epic_id = epic_of(changeset_id, epic)?;
    let m = materialize_changeset(
        &store,
        &mappings,
        &git,
        &config,
        &epic_id,
        changeset_id,
        worktree,
        &paths.root,
    )
    .await?;

    if out.json() {
        out.writer.emit(&BranchOutput {
            changeset_id: changeset_id.to_string(),
            epic_id,
            branch: m.branch,
            created: m.created,
            worktree: m.worktree,
        });
    } else {
        if m.created {
            out.display
                .print_success(&format!("Created branch {}", m.branch));
        } else {
            out.display
                .print_info(&format!("Branch {} already exists", m.branch));
        }
        if let Some(path) = &m.worktree {
            out.display.print_info(&format!("Worktree: {}", path));
        }
    }
    Ok(())
}

async fn cmd_integrate(
    out: &OutputContext<'_>,
    id: &str,
    mode: Option<HistoryMode>,
    epic: Option<&str>,
) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let lifecycle = Lifecycle::new(store.clone());
    let mappings = MappingStore::new(&paths.mappings_dir, config.git.clone());
    let mode = mode.unwrap_or(config.integration.history_mode);
    let strict = config.integration.strict_signal;

    let record = store
        .show(id)
        .await?
        .ok_or_else(|| CrewError::ChangesetNotFound(id.to_string()))?;

    if epic.is_none() && record.is_type(TYPE_EPIC) {
        return integrate_epic(out, &config, &paths, &store, &lifecycle, &mappings, &record, mode, strict)
            .await;
    }

    // Changeset: land the work branch on the epic root.
    let epic_id = epic_of(id, epic)?;
    let mapping = mappings.load(&epic_id).await?.ok_or_else(|| {
        CrewError::UnexpectedState(format!(
            "epic {} has no worktree mapping; claim or branch first",
            epic_id
        ))
    })?;

    let work = record
        .meta(keys::CS_WORK_BRANCH)
        .or_else(|| mapping.changesets.get(id).cloned())
        .unwrap_or_else(|| changeset_branch_name(&mapping.root_branch, &epic_id, id));
    let target = record
        .meta(keys::CS_TARGET_BRANCH)
        .unwrap_or_else(|| mapping.root_branch.clone());

    // The work branch may be checked out in its own worktree; run there so
    // the rebase does not fight a second checkout of the same branch.
    let worktree = mapping
        .changeset_worktrees
        .get(id)
        .map(|p| paths.root.join(p))
        .filter(|p| p.exists())
        .unwrap_or_else(|| paths.root.join(&mapping.worktree_path));
    if !worktree.exists() {
        return Err(CrewError::Worktree {
            message: format!("no worktree for {}; claim the epic first", epic_id),
            path: worktree,
        });
    }

    let engine = IntegrationEngine::new(GitRunner::new(&worktree), config.git.auto_push);
    let outcome = engine.integrate_root_to_parent(&work, &target, mode).await?;

    let proof = match &outcome {
        IntegrationOutcome::Integrated { sha } => Some(CloseProof::Integrated(sha.clone())),
        IntegrationOutcome::NoOp(_) => {
            let refs = ChangesetRefs::from_record(&record, &work, &target);
            close_proof(&engine.integration_signal(&refs, strict).await?)
        }
    };

    let mut closed = false;
    if let Some(proof) = proof
        && !resolve_record(&record).status.is_terminal()
    {
        lifecycle.close_changeset(id, proof).await?;
        closed = true;
    }

    if out.json() {
        out.writer.emit(&IntegrateOutput {
            id: id.to_string(),
            source_branch: work,
            target_branch: target,
            outcome,
            closed,
        });
    } else {
        match &outcome {
            IntegrationOutcome::Integrated { sha } => out
                .display
                .print_success(&format!("Integrated {} into {} at {}", work, target, sha)),
            IntegrationOutcome::NoOp(reason) => out
                .display
                .print_info(&format!("Nothing to integrate: {}", reason)),
        }
        if closed {
            out.display.print_success(&format!("Closed changeset {}", id));
        }
    }
    Ok(())
}

/// Land an epic's root branch in its parent, then close the epic when the
/// proof holds and no changeset is still open.
#[allow(clippy::too_many_arguments)]
async fn integrate_epic(
    out: &OutputContext<'_>,
    config: &CrewConfig,
    paths: &ProjectPaths,
    store: &Arc<dyn IssueStore>,
    lifecycle: &Lifecycle,
    mappings: &MappingStore,
    record: &IssueRecord,
    mode: HistoryMode,
    strict: bool,
) -> Result<()> {
    let id = record.id.as_str();
    let mapping = mappings.load(id).await?.ok_or_else(|| {
        CrewError::UnexpectedState(format!("epic {} has no worktree mapping; claim it first", id))
    })?;
    let parent = record
        .meta(keys::EPIC_PARENT_BRANCH)
        .unwrap_or_else(|| config.git.default_branch.clone());

    let worktree = paths.root.join(&mapping.worktree_path);
    if !worktree.exists() {
        return Err(CrewError::Worktree {
            message: format!("epic worktree missing; claim {} to recreate it", id),
            path: worktree,
        });
    }

    let engine = IntegrationEngine::new(GitRunner::new(&worktree), config.git.auto_push);
    let outcome = engine
        .integrate_root_to_parent(&mapping.root_branch, &parent, mode)
        .await?;

    let proof = match &outcome {
        IntegrationOutcome::Integrated { sha } => {
            // The root branch's proof lives on the epic record itself, the
            // same place the prune scanner reads it from.
            let changes = vec![
                (keys::CS_TARGET_BRANCH.to_string(), Some(parent.clone())),
                (keys::CS_INTEGRATED_SHA.to_string(), Some(sha.clone())),
            ];
            let description = meta_apply(&record.description, &changes);
            if description != record.description {
                store
                    .update(id, IssueUpdate::new().description(&description))
                    .await?;
            }
            Some(CloseProof::Integrated(sha.clone()))
        }
        IntegrationOutcome::NoOp(_) => {
            let refs = ChangesetRefs::from_record(record, &mapping.root_branch, &parent);
            close_proof(&engine.integration_signal(&refs, strict).await?)
        }
    };

    let all = store.list(&IssueFilter::all()).await?;
    let open: Vec<String> = changesets_of(id, Some(&mapping), &all)
        .iter()
        .filter(|r| !resolve_record(r).status.is_terminal())
        .map(|r| r.id.clone())
        .collect();

    let mut closed = false;
    if let Some(proof) = proof
        && open.is_empty()
        && !resolve_record(record).status.is_terminal()
    {
        lifecycle.close_changeset(id, proof).await?;
        closed = true;
    }

    if out.json() {
        out.writer.emit(&IntegrateOutput {
            id: id.to_string(),
            source_branch: mapping.root_branch,
            target_branch: parent,
            outcome,
            closed,
        });
    } else {
        match &outcome {
            IntegrationOutcome::Integrated { sha } => out.display.print_success(&format!(
                "Integrated {} into {} at {}",
                mapping.root_branch, parent, sha
            )),
            IntegrationOutcome::NoOp(reason) => out
                .display
                .print_info(&format!("Nothing to integrate: {}", reason)),
        }
        if closed {
            out.display.print_success(&format!("Closed epic {}", id));
        } else if !open.is_empty() {
            out.display
                .print_info(&format!("{} changeset(s) still open", open.len()));
        }
    }
    Ok(())
}

async fn cmd_signal(out: &OutputContext<'_>, id: &str, epic: Option<&str>) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let mappings = MappingStore::new(&paths.mappings_dir, config.git.clone());

    let epic_id = epic_of(id, epic)?;
    let record = store
        .show(id)
        .await?
        .ok_or_else(|| CrewError::ChangesetNotFound(id.to_string()))?;

    // Reconstruct refs without writing anything; signal stays read-only.
    let mapping = mappings.load(&epic_id).await?;
    let epic_record = store.show(&epic_id).await?;
    let root_branch = mapping
        .as_ref()
        .map(|m| m.root_branch.clone())
        .or_else(|| {
            epic_record
                .as_ref()
                .and_then(|e| e.meta(keys::EPIC_ROOT_BRANCH))
        })
        .unwrap_or_else(|| mappings.default_root_branch(&epic_id));
    let work = record
        .meta(keys::CS_WORK_BRANCH)
        .or_else(|| mapping.as_ref().and_then(|m| m.changesets.get(id).cloned()))
        .unwrap_or_else(|| changeset_branch_name(&root_branch, &epic_id, id));
    let target = record
        .meta(keys::CS_TARGET_BRANCH)
        .unwrap_or_else(|| root_branch.clone());

    let engine = IntegrationEngine::new(GitRunner::new(&paths.root), config.git.auto_push);
    let refs = ChangesetRefs::from_record(&record, &work, &target);
    let signal = engine
        .integration_signal(&refs, config.integration.strict_signal)
        .await?;

    if out.json() {
        out.writer.emit(&signal);
    } else if signal.integrated {
        let evidence = signal
            .evidence
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        out.display.print_success(&format!(
            "{} is integrated into {} ({})",
            id, target, evidence
        ));
    } else {
        out.display
            .print_info(&format!("No integration evidence for {} in {}", id, target));
    }
    Ok(())
}

async fn cmd_sync(out: &OutputContext<'_>, agent: &str, watch: bool, event: bool) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let core = SyncCore::new(
        agent,
        &paths.root,
        &paths.locks_dir,
        store,
        config.sync.clone(),
        config.git.default_branch.clone(),
    );

    if watch {
        let mut service = PlannerSyncService::new(core);
        let outcome = service.start().await?;
        if out.json() {
            out.writer.emit(&outcome);
        } else {
            report_sync_outcome(out.display, &outcome);
            out.display.print_info("Watching; press Ctrl-C to stop.");
        }

        tokio::signal::ctrl_c().await?;
        service.stop().await;
        if !out.json() {
            out.display.print_info("Sync monitor stopped.");
        }
        return Ok(());
    }

    let trigger = if event {
        SyncTrigger::Event
    } else {
        SyncTrigger::Startup
    };
    let outcome = core.sync_once(trigger).await?;

    if out.json() {
        out.writer.emit(&outcome);
    } else {
        report_sync_outcome(out.display, &outcome);
    }
    Ok(())
}

async fn cmd_gc(out: &OutputContext<'_>, dry_run: bool, yes: bool) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let engine = GcEngine::new(&paths, &config, store);
    let report = engine.scan().await?;

    if out.json() {
        out.writer.emit(&report);
    } else {
        out.display.print_gc_report(&report);
    }

    if dry_run || report.is_empty() {
        return Ok(());
    }

    if yes {
        let summary = engine.apply(&report.actions, true).await?;
        if out.json() {
            out.writer.emit(&summary);
        } else {
            out.display.print_gc_summary(&summary);
        }
        return Ok(());
    }

    // Prompting makes no sense on a JSON stream; without --yes such a run
    // stays a dry run.
    if out.json() {
        return Ok(());
    }

    let mut summary = GcApplySummary::default();
    for action in &report.actions {
        if !out
            .display
            .confirm(&format!("Apply: {}?", action.describe()))?
        {
            summary
                .skipped
                .push((action.describe(), "declined".to_string()));
            continue;
        }
        match engine.apply_one(action, true).await {
            Ok(ApplyResult::Applied) => summary.applied += 1,
            Ok(ApplyResult::Skipped(reason)) => summary.skipped.push((action.describe(), reason)),
            Err(e) if e.is_reportable() => {
                summary.failures.push((action.describe(), e.to_string()))
            }
            Err(e) => return Err(e),
        }
    }
    out.display.print_gc_summary(&summary);
    Ok(())
}

async fn cmd_status(out: &OutputContext<'_>, id: Option<&str>) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    let store = issue_store(&config, &paths);
    let mappings = MappingStore::new(&paths.mappings_dir, config.git.clone());
    let all = store.list(&IssueFilter::all()).await?;

    if let Some(id) = id {
        let epic = store
            .show(id)
            .await?
            .ok_or_else(|| CrewError::EpicNotFound(id.to_string()))?;
        if !epic.is_type(TYPE_EPIC) {
            return Err(CrewError::Validation(format!("{} is not an epic", id)));
        }
        let mapping = mappings.load(id).await?;
        let changesets = changesets_of(id, mapping.as_ref(), &all);
        let view = EpicView {
            epic,
            mapping,
            changesets,
        };

        if out.json() {
            out.writer.emit(&EpicStatusOutput::from(&view));
        } else {
            out.display.print_epic_detail(&view);
        }
        return Ok(());
    }

    let epics = store
        .list(&IssueFilter::by_type(TYPE_EPIC).include_closed())
        .await?;
    let mut views = Vec::with_capacity(epics.len());
    for epic in epics {
        let mapping = mappings.load(&epic.id).await?;
        let changesets = changesets_of(&epic.id, mapping.as_ref(), &all);
        views.push(EpicView {
            epic,
            mapping,
            changesets,
        });
    }

    if out.json() {
        let statuses: Vec<EpicStatusOutput> = views.iter().map(EpicStatusOutput::from).collect();
        out.writer.emit(&statuses);
    } else {
        out.display.print_header("Crew Status");
        out.display.print_epics_table(&views);
    }
    Ok(())
}

async fn cmd_config(out: &OutputContext<'_>, action: ConfigAction) -> Result<()> {
    let root = find_project_root()?;
    let config = CrewConfig::load(&root.join(".crew")).await?;
    let paths = ProjectPaths::new(root, &config);
    ensure_initialized(&paths)?;

    match action {
        ConfigAction::Show => {
            if out.json() {
                out.writer.emit(&config);
            } else {
                let rendered = toml::to_string_pretty(&config)
                    .map_err(|e| CrewError::Config(e.to_string()))?;
                println!("{}", rendered);
            }
        }
        ConfigAction::Edit => {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vim".to_string());
            let status = tokio::process::Command::new(&editor)
                .arg(paths.config_file())
                .status()
                .await?;
            if !status.success() {
                return Err(CrewError::Config(format!(
                    "editor {} exited with {}",
                    editor, status
                )));
            }
            // Reload so validation errors surface now, not on the next run.
            CrewConfig::load(&paths.crew_dir).await?;
            out.display.print_success("Configuration updated.");
        }
        ConfigAction::Reset => {
            CrewConfig::default().save(&paths.crew_dir).await?;
            out.display.print_success("Configuration reset to defaults.");
        }
    }
    Ok(())
}

/// Root branch and worktree for one epic, created where missing and the
/// settled names written back onto the epic record.
async fn materialize_epic(
    store: &Arc<dyn IssueStore>,
    mappings: &MappingStore,
    git: &GitRunner,
    config: &CrewConfig,
    epic: &IssueRecord,
    repo_root: &Path,
) -> Result<WorktreeMapping> {
    let root_branch = epic
        .meta(keys::EPIC_ROOT_BRANCH)
        .unwrap_or_else(|| mappings.default_root_branch(&epic.id));
    let mapping = mappings
        .ensure_mapping_with_root(&epic.id, &root_branch)
        .await?;
    let parent = epic
        .meta(keys::EPIC_PARENT_BRANCH)
        .unwrap_or_else(|| config.git.default_branch.clone());

    // An existing mapping's root branch wins over a stale record key.
    let changes = vec![
        (
            keys::EPIC_ROOT_BRANCH.to_string(),
            Some(mapping.root_branch.clone()),
        ),
        (keys::EPIC_PARENT_BRANCH.to_string(), Some(parent.clone())),
    ];
    let description = meta_apply(&epic.description, &changes);
    if description != epic.description {
        store
            .update(&epic.id, IssueUpdate::new().description(&description))
            .await?;
    }

    let worktree = repo_root.join(&mapping.worktree_path);
    if !worktree.exists() {
        git.worktree_add(&worktree, &mapping.root_branch, &parent)
            .await?;
    }

    Ok(mapping)
}

struct ChangesetMaterialization {
    branch: String,
    created: bool,
    worktree: Option<String>,
}

/// Work branch (and optional worktree) for one changeset. Base SHAs are
/// recorded only when the branch is created here; re-running never rewrites
/// them.
#[allow(clippy::too_many_arguments)]
async fn materialize_changeset(
    store: &Arc<dyn IssueStore>,
    mappings: &MappingStore,
    git: &GitRunner,
    config: &CrewConfig,
    epic_id: &str,
    changeset_id: &str,
    with_worktree: bool,
    repo_root: &Path,
) -> Result<ChangesetMaterialization> {
    let epic = store
        .show(epic_id)
        .await?
        .ok_or_else(|| CrewError::EpicNotFound(epic_id.to_string()))?;
    let record = store
        .show(changeset_id)
        .await?
        .ok_or_else(|| CrewError::ChangesetNotFound(changeset_id.to_string()))?;

    let root_branch = epic
        .meta(keys::EPIC_ROOT_BRANCH)
        .unwrap_or_else(|| mappings.default_root_branch(epic_id));
    mappings
        .ensure_mapping_with_root(epic_id, &root_branch)
        .await?;
    let parent = epic
        .meta(keys::EPIC_PARENT_BRANCH)
        .unwrap_or_else(|| config.git.default_branch.clone());

    let (branch, mapping) = mappings
        .ensure_changeset_branch(epic_id, changeset_id)
        .await?;

    if !git.branch_exists(&mapping.root_branch).await? {
        git.create_branch(&mapping.root_branch, &parent).await?;
    }
    let created = !git.branch_exists(&branch).await?;
    if created {
        git.create_branch(&branch, &mapping.root_branch).await?;
    }

    let mut changes = vec![
        (keys::CS_WORK_BRANCH.to_string(), Some(branch.clone())),
        (
            keys::CS_TARGET_BRANCH.to_string(),
            Some(mapping.root_branch.clone()),
        ),
    ];
    if created {
        changes.push((
            keys::CS_ROOT_BASE.to_string(),
            git.rev_parse(&mapping.root_branch).await?,
        ));
        changes.push((
            keys::CS_PARENT_BASE.to_string(),
            git.rev_parse(&parent).await?,
        ));
    }
    let description = meta_apply(&record.description, &changes);
    if description != record.description {
        store
            .update(changeset_id, IssueUpdate::new().description(&description))
            .await?;
    }

    let worktree = if with_worktree {
        let (path, _) = mappings
            .ensure_changeset_worktree(epic_id, changeset_id)
            .await?;
        let abs = repo_root.join(&path);
        if !abs.exists() {
            git.worktree_add(&abs, &branch, &mapping.root_branch).await?;
        }
        Some(path)
    } else {
        None
    };

    Ok(ChangesetMaterialization {
        branch,
        created,
        worktree,
    })
}

fn find_project_root() -> Result<PathBuf> {
    let mut dir = std::env::current_dir()?;
    loop {
        if dir.join(".git").exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(CrewError::NotInGitRepo);
        }
    }
}

fn ensure_initialized(paths: &ProjectPaths) -> Result<()> {
    if !paths.crew_dir.exists() {
        return Err(CrewError::NotInitialized);
    }
    Ok(())
}

fn issue_store(config: &CrewConfig, paths: &ProjectPaths) -> Arc<dyn IssueStore> {
    Arc::new(IssueCli::new(
        config.issues.bin.as_str(),
        &paths.root,
        Duration::from_secs(config.issues.timeout_secs),
    ))
}

/// Epic id for a changeset: the explicit flag, else the `<epic>.<suffix>`
/// id convention.
fn epic_of(changeset_id: &str, epic: Option<&str>) -> Result<String> {
    if let Some(epic) = epic {
        return Ok(epic.to_string());
    }
    if let Some((prefix, suffix)) = changeset_id.split_once('.')
        && !prefix.is_empty()
        && !suffix.is_empty()
    {
        return Ok(prefix.to_string());
    }
    Err(CrewError::Validation(format!(
        "cannot derive the epic from changeset id {:?}; pass --epic",
        changeset_id
    )))
}

/// Changeset records belonging to an epic: id-qualified ones plus anything
/// the mapping tracks a branch for.
fn changesets_of(
    epic_id: &str,
    mapping: Option<&WorktreeMapping>,
    records: &[IssueRecord],
) -> Vec<IssueRecord> {
    let qualified = format!("{}.", epic_id);
    records
        .iter()
        .filter(|r| !r.is_type(TYPE_EPIC) && !r.is_type(TYPE_AGENT) && !r.is_type(TYPE_MESSAGE))
        .filter(|r| {
            r.id.starts_with(&qualified) || mapping.is_some_and(|m| m.changesets.contains_key(&r.id))
        })
        .cloned()
        .collect()
}

fn close_proof(signal: &IntegrationSignal) -> Option<CloseProof> {
    if !signal.integrated {
        return None;
    }
    match (&signal.evidence, &signal.target_sha) {
        (Some(Evidence::MergedPr), _) | (_, None) => Some(CloseProof::PrMerged),
        (_, Some(sha)) => Some(CloseProof::Integrated(sha.clone())),
    }
}

fn report_sync_outcome(display: &Display, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Synced { .. } => display.print_success(&outcome.to_string()),
        SyncOutcome::Failed { .. } => display.print_error(&outcome.to_string()),
        _ => display.print_info(&outcome.to_string()),
    }
}
