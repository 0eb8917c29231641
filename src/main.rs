use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::agent::{Agent, AgentBackend, AgentRouter, EchoAgent};
use swarm::config::Config;
use swarm::core::Task;
use swarm::orchestration::{
    CheckpointManager, CheckpointState, ExecutionResult, Scheduler, SchedulerEvent,
    TokenBudgetManager,
};
use swarm::{swlog, swlog_warn, Error, Result};

/// Swarm - dependency-aware task graph executor for agent workers
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.swarm/swarm.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.swarm/swarm.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a task graph (JSON array of tasks)
    Run {
        /// Path to the graph file
        graph: PathBuf,

        /// Mission id used for checkpoints (generated if omitted)
        #[arg(long)]
        mission: Option<String>,

        /// Continue from the mission's latest checkpoint
        #[arg(long, requires = "mission")]
        resume: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Answer every task with the echo agent instead of running commands
        #[arg(long)]
        dry_run: bool,
    },

    /// List or prune a mission's checkpoints
    Checkpoints {
        mission: String,

        /// Keep only the newest N checkpoints
        #[arg(long, value_name = "N")]
        clean: Option<usize>,
    },

    /// Show token budget usage
    Budget {
        /// Zero the session total
        #[arg(long)]
        reset_session: bool,

        /// Zero the daily total
        #[arg(long)]
        reset_daily: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    swarm::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        Command::Run {
            graph,
            mission,
            resume,
            json,
            dry_run,
        } => {
            let all_ok = rt.block_on(run_graph(&config, &graph, mission, resume, json, dry_run))?;
            if !all_ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Checkpoints { mission, clean } => rt.block_on(run_checkpoints(&config, &mission, clean)),
        Command::Budget {
            reset_session,
            reset_daily,
        } => rt.block_on(run_budget(&config, reset_session, reset_daily)),
    }
}

/// Parse a graph file: a JSON array of tasks.
fn load_graph(path: &Path) -> Result<Vec<Task>> {
    let contents = std::fs::read_to_string(path)?;
    let tasks: Vec<Task> = serde_json::from_str(&contents)?;
    if tasks.is_empty() {
        return Err(Error::Validation(format!(
            "{} contains no tasks",
            path.display()
        )));
    }
    Ok(tasks)
}

fn new_mission_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("mission-{}", &id[..8])
}

/// Returns whether every task succeeded.
async fn run_graph(
    config: &Config,
    graph: &Path,
    mission: Option<String>,
    resume: bool,
    json: bool,
    dry_run: bool,
) -> Result<bool> {
    let tasks = load_graph(graph)?;
    let mission_id = mission.unwrap_or_else(new_mission_id);
    swlog!(
        "Run command: graph={}, mission={}, resume={}, tasks={}",
        graph.display(),
        mission_id,
        resume,
        tasks.len()
    );
    config.ensure_dirs()?;

    let agent: Arc<dyn Agent> = if dry_run {
        Arc::new(AgentBackend::Echo(EchoAgent))
    } else {
        let router = AgentRouter::from_config(config);
        let missing = router.missing_binaries();
        if !missing.is_empty() {
            swlog_warn!("agent commands not found on PATH: {}", missing.join(", "));
            eprintln!("warning: agent commands not found: {}", missing.join(", "));
        }
        Arc::new(router)
    };

    let budget_path = config.budget_path()?;
    let budget = Arc::new(TokenBudgetManager::new(config.engine.budget.clone()));
    budget.load(&budget_path).await?;

    let checkpoints = Arc::new(CheckpointManager::new(config.checkpoint_dir()?));
    let state = if resume {
        match checkpoints.get_latest(&mission_id).await? {
            Some(checkpoint) => {
                if !json {
                    println!(
                        "Resuming {} from {} ({} task(s) done)",
                        mission_id,
                        checkpoint.phase,
                        checkpoint.state.completed_task_ids.len()
                    );
                }
                checkpoint.state
            }
            None => return Err(Error::CheckpointNotFound(mission_id)),
        }
    } else {
        CheckpointState::default()
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !json {
                print_event(&event);
            }
        }
    });

    let scheduler = Scheduler::new(config.engine.clone(), agent)
        .with_budget(Arc::clone(&budget))
        .with_checkpoints(Arc::clone(&checkpoints), &mission_id)
        .with_events(event_tx)
        .with_cancellation(cancel);

    let results = scheduler.resume(tasks, state).await;
    let pool_stats = scheduler.gate().stats();
    let breaker_stats = scheduler.breakers().all_stats();
    // Dropping the scheduler closes the event channel so the printer ends.
    drop(scheduler);
    let _ = printer.await;
    let results = results?;

    if let Err(e) = budget.save(&budget_path).await {
        swlog_warn!("failed to save budget state: {}", e);
    }

    let all_ok = results.iter().all(|r| r.success);
    if json {
        let output = serde_json::json!({
            "mission_id": mission_id,
            "results": results,
            "pool": pool_stats,
            "breakers": breaker_stats,
            "budget": budget.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&mission_id, &results);
        println!(
            "  Pool:        peak {} concurrent, avg wait {:.1}ms, avg run {:.1}ms",
            pool_stats.peak_concurrent, pool_stats.avg_wait_ms, pool_stats.avg_execution_ms
        );
    }
    Ok(all_ok)
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskStarted {
            task_id,
            agent_ref,
            attempt,
        } => {
            if *attempt == 1 {
                println!("  > task {} started ({})", task_id, agent_ref);
            } else {
                println!("  > task {} attempt {} ({})", task_id, attempt, agent_ref);
            }
        }
        SchedulerEvent::TaskRetrying {
            task_id,
            attempt,
            delay,
            error,
        } => println!(
            "  ~ task {} attempt {} failed: {} (retry in {:?})",
            task_id, attempt, error, delay
        ),
        SchedulerEvent::TaskCompleted {
            task_id,
            duration_ms,
        } => println!("  \x1b[32m✓\x1b[0m task {} done in {}ms", task_id, duration_ms),
        SchedulerEvent::TaskFailed {
            task_id,
            kind,
            error,
        } => println!("  \x1b[31m✗\x1b[0m task {} failed [{}]: {}", task_id, kind, error),
        SchedulerEvent::CheckpointWritten {
            checkpoint_id,
            persisted,
            ..
        } => {
            if *persisted {
                println!("  # checkpoint {}", checkpoint_id)
            } else {
                println!("  # checkpoint {} (cache only, write failed)", checkpoint_id)
            }
        }
        SchedulerEvent::Cancelled { undispatched } => {
            println!("  ! cancelled, {} task(s) not started", undispatched)
        }
        SchedulerEvent::TaskStateChanged { .. } | SchedulerEvent::AllTasksComplete { .. } => {}
    }
}

fn print_summary(mission_id: &str, results: &[ExecutionResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    println!();
    println!("  Mission:     {}", mission_id);
    println!(
        "  Tasks:       {} succeeded, {} failed",
        succeeded,
        results.len() - succeeded
    );
    for result in results.iter().filter(|r| !r.success) {
        println!(
            "    task {}: {}",
            result.task_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
}

async fn run_checkpoints(config: &Config, mission: &str, clean: Option<usize>) -> Result<()> {
    let manager = CheckpointManager::new(config.checkpoint_dir()?);
    if let Some(keep) = clean {
        let removed = manager.clean_old(mission, keep).await?;
        println!("Removed {} checkpoint(s) for {}", removed, mission);
    }

    let ids = manager.list_checkpoints(mission).await?;
    if ids.is_empty() {
        println!("No checkpoints for {}", mission);
        return Ok(());
    }
    println!("Checkpoints for {} (newest first):", mission);
    for id in ids {
        match manager.load(&id).await {
            Ok(checkpoint) => println!(
                "  {}  {}  {} done, {} pending",
                checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S"),
                checkpoint.phase,
                checkpoint.state.completed_task_ids.len(),
                checkpoint.state.pending_task_ids.len()
            ),
            Err(e) => println!("  {}  (unreadable: {})", id, e),
        }
    }
    Ok(())
}

async fn run_budget(config: &Config, reset_session: bool, reset_daily: bool) -> Result<()> {
    let path = config.budget_path()?;
    let budget = TokenBudgetManager::new(config.engine.budget.clone());
    budget.load(&path).await?;

    if reset_session {
        budget.reset_session();
    }
    if reset_daily {
        budget.reset_daily();
    }
    if reset_session || reset_daily {
        budget.save(&path).await?;
    }

    let stats = budget.stats();
    println!(
        "Daily:   {:>10} / {:<10} ({:.1}%)",
        stats.daily_used, stats.daily_limit, stats.daily_percent
    );
    println!(
        "Session: {:>10} / {:<10} ({:.1}%)",
        stats.session_used, stats.session_limit, stats.session_percent
    );
    println!("Suggested tier: {}", budget.suggest_model(0));
    Ok(())
}
