//! epicflow - dependency-aware epic orchestration CLI
//!
//! The `epicflow` command manages the epic registry of a git repository and
//! drives units of work through the engine.
//!
//! ## Commands
//!
//! - `create`, `list`, `show`, `status`, `rollback`, `block`, `unblock`:
//!   registry bookkeeping
//! - `next`, `classify`: dry runs of selection and the parallelism check
//! - `run-next`, `run`, `resume`, `abort`: execution
//! - `graph`, `workspaces`, `mirror-flush`: inspection and maintenance
//!
//! Exit codes: 0 success, 1 blocked on a merge conflict (resumable with
//! `epicflow resume`), 2 any other failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use epicflow_core::{
    init_tracing, render_dot, render_text, Engine, EngineError, GitCli,
    RunOutcome, SelectionVerdict, StateLayout, EXIT_FAILURE, EXIT_OK,
};
use epicflow_registry::{Priority, UnitDraft, UnitFilter, UnitMutation, UnitStatus, WorkUnit};
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "epicflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware epic orchestration over git worktrees", long_about = None)]
struct Cli {
    /// Repository root
    #[arg(long, global = true, env = "EPICFLOW_REPO", default_value = ".")]
    repo: PathBuf,

    /// State directory (default: <repo>/.epicflow)
    #[arg(long, global = true, env = "EPICFLOW_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state directory in a git repository
    Init {
        /// Project name recorded in the registry (default: repo directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Register a new epic
    Create {
        title: String,

        #[arg(short, long, default_value = "medium")]
        priority: Priority,

        /// Tag to attach (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,

        /// Unit that must be implemented first (repeatable)
        #[arg(short, long)]
        blocked_by: Vec<String>,
    },

    /// List epics
    List {
        #[arg(long)]
        status: Option<UnitStatus>,

        #[arg(long)]
        priority: Option<Priority>,

        #[arg(long)]
        tag: Option<String>,
    },

    /// Show one epic
    Show { id: String },

    /// Move an epic forward in its lifecycle
    Status { id: String, status: UnitStatus },

    /// Return an epic to defined
    Rollback { id: String },

    /// Add a blocked_by edge
    Block {
        id: String,
        /// Unit that must be implemented first
        #[arg(long)]
        by: String,
    },

    /// Remove a blocked_by edge
    Unblock {
        id: String,
        #[arg(long)]
        by: String,
    },

    /// Show which epic would run next
    Next {
        /// Explain the verdict for every ready epic
        #[arg(long)]
        explain: bool,
    },

    /// Decide whether an epic's tasks can run in parallel
    Classify {
        id: String,

        /// Task breakdown file (default: <state>/tasks/<id>.json)
        #[arg(long)]
        tasks: Option<PathBuf>,

        #[arg(long)]
        min_files: Option<usize>,

        #[arg(long)]
        min_domains: Option<usize>,

        #[arg(long)]
        max_overlap: Option<f64>,
    },

    /// Run the highest-priority ready epic
    RunNext {
        #[arg(long)]
        tasks: Option<PathBuf>,
    },

    /// Run one epic
    Run {
        id: String,

        #[arg(long)]
        tasks: Option<PathBuf>,
    },

    /// Continue a merge stopped by a conflict
    Resume { id: String },

    /// Print the dependency graph
    Graph {
        /// Graphviz DOT instead of text
        #[arg(long)]
        dot: bool,
    },

    /// List workspaces
    Workspaces {
        /// Only workspaces of this epic
        id: Option<String>,
    },

    /// Clean up an epic's workspaces and discard its unfinished merge
    Abort { id: String },

    /// Retry queued issue-mirror notifications
    MirrorFlush,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match dispatch(cli).await {
        Ok(()) => ExitCode::from(EXIT_OK as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            let engine_err = err.downcast_ref::<EngineError>();
            if let Some(hint) = engine_err.and_then(EngineError::remediation) {
                eprintln!("hint: {hint}");
            }
            let code = engine_err.map_or(EXIT_FAILURE, EngineError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let layout = layout(&cli.repo, cli.state_dir.clone())?;
    debug!(state_dir = %layout.state_dir().display(), "resolved state directory");
    let json = cli.json;

    match cli.command {
        Commands::Init { name } => cmd_init(&layout, name.as_deref(), json),
        Commands::Create {
            title,
            priority,
            tag,
            blocked_by,
        } => cmd_create(&open(layout)?, title, priority, tag, blocked_by, json).await,
        Commands::List {
            status,
            priority,
            tag,
        } => {
            let filter = UnitFilter {
                status,
                priority,
                tag,
            };
            cmd_list(&open(layout)?, &filter, json)
        }
        Commands::Show { id } => cmd_show(&open(layout)?, &id, json),
        Commands::Status { id, status } => {
            let engine = open(layout)?;
            let unit = engine.set_status(&id, status).await?;
            print_unit_line(&unit, json)
        }
        Commands::Rollback { id } => {
            let engine = open(layout)?;
            let unit = engine.rollback(&id).await?;
            print_unit_line(&unit, json)
        }
        Commands::Block { id, by } => {
            cmd_edge(&open(layout)?, &id, UnitMutation::AddBlocker(by), json)
        }
        Commands::Unblock { id, by } => {
            cmd_edge(&open(layout)?, &id, UnitMutation::RemoveBlocker(by), json)
        }
        Commands::Next { explain } => cmd_next(&open(layout)?, explain, json),
        Commands::Classify {
            id,
            tasks,
            min_files,
            min_domains,
            max_overlap,
        } => {
            let engine = open(layout)?;
            let mut thresholds = engine.config().thresholds;
            if let Some(n) = min_files {
                thresholds.min_files = n;
            }
            if let Some(n) = min_domains {
                thresholds.min_domains = n;
            }
            if let Some(r) = max_overlap {
                anyhow::ensure!(
                    (0.0..=1.0).contains(&r),
                    "--max-overlap must be between 0 and 1, got {r}"
                );
                thresholds.max_overlap = r;
            }
            cmd_classify(&engine.with_thresholds(thresholds), &id, tasks.as_deref(), json)
        }
        Commands::RunNext { tasks } => {
            let outcome = open(layout)?.run_next(tasks.as_deref()).await?;
            print_outcome(&outcome, json)
        }
        Commands::Run { id, tasks } => {
            let outcome = open(layout)?.run_unit(&id, tasks.as_deref()).await?;
            print_outcome(&outcome, json)
        }
        Commands::Resume { id } => {
            let outcome = open(layout)?.resume(&id).await?;
            print_outcome(&outcome, json)
        }
        Commands::Graph { dot } => cmd_graph(&open(layout)?, dot),
        Commands::Workspaces { id } => cmd_workspaces(&open(layout)?, id.as_deref(), json),
        Commands::Abort { id } => cmd_abort(&open(layout)?, &id, json),
        Commands::MirrorFlush => cmd_mirror_flush(&open(layout)?, json).await,
    }
}

fn layout(repo: &Path, state_dir: Option<PathBuf>) -> Result<StateLayout> {
    let repo = std::fs::canonicalize(repo)
        .with_context(|| format!("repository {} not found", repo.display()))?;
    Ok(StateLayout::new(repo, state_dir))
}

fn open(layout: StateLayout) -> Result<Engine> {
    let state_dir = layout.state_dir().to_path_buf();
    Engine::open(layout).with_context(|| format!("failed to open {}", state_dir.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_unit_line(unit: &WorkUnit, json: bool) -> Result<()> {
    if json {
        return print_json(unit);
    }
    println!(
        "{}  {:<11} {:<8} {}",
        unit.id,
        unit.status.as_str(),
        unit.priority.to_string(),
        unit.title
    );
    Ok(())
}

fn cmd_init(layout: &StateLayout, name: Option<&str>, json: bool) -> Result<()> {
    let project_name = match name {
        Some(name) => name.to_string(),
        None => layout
            .repo()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "epicflow".to_string()),
    };
    let config = Engine::init(layout, &project_name, &GitCli::new())?;
    if json {
        return print_json(&config);
    }
    println!(
        "Initialized epicflow state for {} at {}",
        project_name,
        layout.state_dir().display()
    );
    if let Some(branch) = &config.base_branch {
        println!("Base branch: {branch}");
    }
    if config.worker.is_none() {
        println!("Set `worker` in {} before running epics", layout.config_path().display());
    }
    Ok(())
}

async fn cmd_create(
    engine: &Engine,
    title: String,
    priority: Priority,
    tags: Vec<String>,
    blocked_by: Vec<String>,
    json: bool,
) -> Result<()> {
    let mut draft = UnitDraft::new(title).with_priority(priority);
    for tag in tags {
        draft = draft.with_tag(tag);
    }
    for blocker in blocked_by {
        draft = draft.blocked_by(blocker);
    }
    let unit = engine.create_unit(draft).await?;
    if json {
        return print_json(&unit);
    }
    println!("Created {}: {}", unit.id, unit.title);
    if let Some(reference) = &unit.external_ref {
        println!("Tracker: {reference}");
    }
    Ok(())
}

fn cmd_list(engine: &Engine, filter: &UnitFilter, json: bool) -> Result<()> {
    let units = engine.registry().list(filter).map_err(EngineError::from)?;
    if json {
        return print_json(&units);
    }
    if units.is_empty() {
        println!("No epics found");
        return Ok(());
    }
    for unit in &units {
        print_unit_line(unit, false)?;
    }
    Ok(())
}

fn cmd_show(engine: &Engine, id: &str, json: bool) -> Result<()> {
    let unit = engine.registry().get(id).map_err(EngineError::from)?;
    if json {
        return print_json(&unit);
    }
    println!("{}: {}", unit.id, unit.title);
    println!("Status:   {}", unit.status);
    println!("Priority: {}", unit.priority);
    println!("Created:  {}", unit.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if !unit.tags.is_empty() {
        let tags: Vec<&str> = unit.tags.iter().map(String::as_str).collect();
        println!("Tags:     {}", tags.join(", "));
    }
    if !unit.dependencies.blocked_by.is_empty() {
        let ids: Vec<&str> = unit.dependencies.blocked_by.iter().map(String::as_str).collect();
        println!("Blocked by: {}", ids.join(", "));
    }
    if !unit.dependencies.blocks.is_empty() {
        let ids: Vec<&str> = unit.dependencies.blocks.iter().map(String::as_str).collect();
        println!("Blocks:     {}", ids.join(", "));
    }
    if let Some(reference) = &unit.external_ref {
        println!("Tracker:  {reference}");
    }
    if let Some(exec) = &unit.execution {
        println!(
            "Executed: {}, {} created, {} modified",
            exec.mode, exec.files_created, exec.files_modified
        );
    }
    Ok(())
}

fn cmd_edge(engine: &Engine, id: &str, mutation: UnitMutation, json: bool) -> Result<()> {
    let unit = engine
        .registry()
        .update(id, mutation)
        .map_err(EngineError::from)?;
    if json {
        return print_json(&unit);
    }
    let ids: Vec<&str> = unit.dependencies.blocked_by.iter().map(String::as_str).collect();
    if ids.is_empty() {
        println!("{} has no blockers", unit.id);
    } else {
        println!("{} blocked by {}", unit.id, ids.join(", "));
    }
    Ok(())
}

fn cmd_next(engine: &Engine, explain: bool, json: bool) -> Result<()> {
    if explain {
        let explanations = engine.explain()?;
        if json {
            return print_json(&explanations);
        }
        if explanations.is_empty() {
            println!("No ready epics");
        }
        for e in &explanations {
            let verdict = match &e.verdict {
                SelectionVerdict::Selected => "selected".to_string(),
                SelectionVerdict::Eligible { position } => {
                    format!("eligible, {position} ahead")
                }
                SelectionVerdict::Blocked { blockers } => {
                    let ids: Vec<&str> = blockers.iter().map(|b| b.id.as_str()).collect();
                    format!("blocked by {}", ids.join(", "))
                }
            };
            println!("{}  {:<8} {}", e.unit_id, e.priority.to_string(), verdict);
        }
        return Ok(());
    }

    let next = engine.select()?;
    if json {
        return print_json(&next);
    }
    match next {
        Some(unit) => print_unit_line(&unit, false),
        None => {
            println!("No ready epics");
            Ok(())
        }
    }
}

fn cmd_classify(engine: &Engine, id: &str, tasks: Option<&Path>, json: bool) -> Result<()> {
    let unit_plan = engine.classify_unit(id, tasks)?;
    if json {
        return print_json(&serde_json::json!({
            "tasks": unit_plan.tasks,
            "plan": unit_plan.plan,
        }));
    }
    let plan = &unit_plan.plan;
    let mode = if plan.viable { "parallel" } else { "sequential" };
    println!("{id}: {mode} ({})", plan.reason);
    for task in &unit_plan.tasks {
        println!("  {:<12} {}", task.domain, task.description);
        for file in &task.files {
            println!("    {file}");
        }
    }
    if !plan.unclassified.is_empty() {
        println!("  unclassified: {}", plan.unclassified.join(", "));
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome, json: bool) -> Result<()> {
    if json {
        return print_json(outcome);
    }
    match outcome {
        RunOutcome::Idle => println!("No ready epics"),
        RunOutcome::Completed(report) => {
            println!(
                "{} implemented ({}): {} files created, {} modified",
                report.unit_id, report.mode, report.files_created, report.files_modified
            );
            if !report.merged.is_empty() {
                println!("Merged: {}", report.merged.join(" -> "));
            }
        }
    }
    Ok(())
}

fn cmd_graph(engine: &Engine, dot: bool) -> Result<()> {
    let units = engine.registry().all().map_err(EngineError::from)?;
    let rendered = if dot {
        render_dot(&units)
    } else {
        render_text(&units)
    }
    .map_err(EngineError::from)?;
    print!("{rendered}");
    Ok(())
}

fn cmd_workspaces(engine: &Engine, id: Option<&str>, json: bool) -> Result<()> {
    let workspaces = engine.supervisor().list(id)?;
    if json {
        return print_json(&workspaces);
    }
    if workspaces.is_empty() {
        println!("No workspaces");
        return Ok(());
    }
    for ws in &workspaces {
        println!(
            "{:<36} {:<10} {:<9} {}",
            ws.name,
            ws.domain,
            ws.status.to_string(),
            ws.path.display()
        );
    }
    Ok(())
}

fn cmd_abort(engine: &Engine, id: &str, json: bool) -> Result<()> {
    let report = engine.abort(id)?;
    if json {
        return print_json(&report);
    }
    println!("Cleaned {} workspace(s)", report.cleaned.len());
    for name in &report.busy {
        println!("Skipped busy workspace {name}");
    }
    Ok(())
}

async fn cmd_mirror_flush(engine: &Engine, json: bool) -> Result<()> {
    let report = engine.flush_mirror().await?;
    if json {
        return print_json(&serde_json::json!({
            "delivered": report.delivered.len(),
            "remaining": report.remaining,
        }));
    }
    println!(
        "Delivered {} event(s), {} still queued",
        report.delivered.len(),
        report.remaining
    );
    Ok(())
}
