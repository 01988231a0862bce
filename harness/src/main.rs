//! Task-execution harness CLI.
//!
//! Works through `.harness/tasks.yaml` one task at a time, committing a git
//! savepoint after each task passes verification. Interrupted runs resume from
//! `.harness/state/run.json`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use harness::core::cancel::CancelToken;
use harness::core::task::{TaskStatus, blocked_count, next_runnable};
use harness::engine::TaskFailedError;
use harness::exit_codes;
use harness::io::backend::{BackendKind, CliBackend};
use harness::io::config::{HarnessConfig, load_config};
use harness::io::git::Git;
use harness::io::paths::HarnessPaths;
use harness::io::run_state::RunStateStore;
use harness::io::task_store::TaskStore;
use harness::logging;
use harness::orchestrator::{Runner, open_run_state};
use harness::preflight::{PreflightOptions, prepare_run};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Drive a coding agent through a task queue with verified git savepoints"
)]
struct Cli {
    /// Run as if started in DIR.
    #[arg(short = 'C', global = true, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work through runnable tasks until none remain or one fails.
    Run(RunArgs),
    /// Print task counts and the persisted run state.
    Status,
    /// Delete the persisted run state.
    Reset,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Attempts per rotation (overrides config).
    #[arg(long)]
    attempts: Option<u32>,
    /// Rotations per task (overrides config).
    #[arg(long)]
    rotations: Option<u32>,
    /// Agent backend (overrides config).
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
    /// Add missing `.harness/.gitignore` entries without asking.
    #[arg(long)]
    yes: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(attempts) = self.attempts {
            config.retry.attempts = attempts;
        }
        if let Some(rotations) = self.rotations {
            config.retry.rotations = rotations;
        }
        if let Some(kind) = self.backend {
            if kind != config.backend.kind {
                // The configured command belongs to the other backend.
                config.backend.command = None;
            }
            config.backend.kind = kind;
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<TaskFailedError>().is_some() {
                exit_codes::TASK_FAILED
            } else {
                exit_codes::ERROR
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let dir = cli.dir.unwrap_or_else(|| PathBuf::from("."));
    let root = Git::new(&dir).repo_root()?;
    debug!(root = %root.display(), "repository root");
    let paths = HarnessPaths::new(&root);
    match cli.command {
        Command::Run(args) => cmd_run(&paths, &args),
        Command::Status => cmd_status(&paths),
        Command::Reset => cmd_reset(&paths),
    }
}

fn cmd_run(paths: &HarnessPaths, args: &RunArgs) -> Result<i32> {
    let mut config = load_config(&paths.config_path)?;
    args.apply(&mut config);
    config.validate()?;

    let store = RunStateStore::new(&paths.run_state_path);
    let (state, fresh_run) = open_run_state(&store)?;
    prepare_run(
        &Git::new(&paths.root),
        paths,
        PreflightOptions {
            fresh_run,
            assume_yes: args.yes,
        },
    )?;
    let mut tasks = TaskStore::load(&paths.tasks_path)?;

    let git = Git::new(&paths.root).with_records(vcs_dir(paths, &state.run_id));
    let backend =
        CliBackend::from_config(&config.backend, &paths.root, config.backend_output_limit_bytes);
    let mut runner = Runner::new(
        paths,
        &config,
        &backend,
        &git,
        store,
        state,
        CancelToken::new(),
    );
    if runner.select_task(&tasks).is_none() {
        println!("nothing to do");
        return Ok(exit_codes::NOTHING_TO_DO);
    }

    let summary = runner.run(&mut tasks)?;
    for id in &summary.completed {
        println!("done {id}");
    }
    if summary.blocked > 0 {
        println!("{} task(s) blocked by failed dependencies", summary.blocked);
    }
    Ok(exit_codes::OK)
}

fn cmd_status(paths: &HarnessPaths) -> Result<i32> {
    let tasks = TaskStore::load(&paths.tasks_path)?;
    let count = |status: TaskStatus| {
        tasks
            .tasks()
            .iter()
            .filter(|task| task.status == status)
            .count()
    };
    println!(
        "tasks: {} todo, {} done, {} failed, {} blocked",
        count(TaskStatus::Todo),
        count(TaskStatus::Done),
        count(TaskStatus::Failed),
        blocked_count(tasks.tasks())
    );
    match next_runnable(tasks.tasks()) {
        Some(task) => println!("next: {} {}", task.id, task.title.trim()),
        None => println!("next: none"),
    }

    match RunStateStore::new(&paths.run_state_path).load()? {
        None => println!("run: none"),
        Some(state) => {
            println!("run: {}", state.run_id);
            match state.active_task_id.as_deref() {
                Some(id) => println!(
                    "active: {id} rotation {} attempt {}",
                    state.rotation, state.attempt
                ),
                None => println!("active: none"),
            }
            if let Some(commit) = state.last_savepoint_commit.as_deref() {
                println!("savepoint: {commit}");
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_reset(paths: &HarnessPaths) -> Result<i32> {
    RunStateStore::new(&paths.run_state_path).clear()?;
    println!("run state cleared");
    Ok(exit_codes::OK)
}

fn vcs_dir(paths: &HarnessPaths, run_id: &str) -> PathBuf {
    paths.runs_dir.join(run_id).join("vcs")
}
