//! Task orchestration: pick the next task, drive it through the retry engine
//! and record the outcome.
//!
//! The order at a task boundary is fixed: task file first, then archive and
//! progress, then the savepoint commit, then run state. A crash between the
//! task-file save and the commit leaves the task `done` on disk with its work
//! uncommitted; the next task's savepoint picks that work up.
//!
//! A task that exhausts its retries is rolled back to the last savepoint, and
//! only its `failed` status and progress entry are committed. That commit
//! becomes the savepoint for the tasks after it.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::checkpoint::{Checkpoints, failure_subject, task_footer};
use crate::core::run_id::generate_run_id;
use crate::core::task::{Task, TaskStatus, blocked_count, next_runnable};
use crate::engine::{AttemptContext, AttemptError, RetryPolicy, TaskFailedError};
use crate::io::artifacts::Artifacts;
use crate::io::backend::Backend;
use crate::io::config::HarnessConfig;
use crate::io::paths::{FAILURE_RECORD_FILES, HarnessPaths};
use crate::io::progress::{append_progress, archive_task};
use crate::io::prompt::{render_implement, render_retry};
use crate::io::run_state::{RunState, RunStateStore};
use crate::io::task_store::TaskStore;
use crate::io::verify::{VerifyError, run_verification};

/// Outcome of one completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: String,
    pub rotation: u32,
    pub attempt: u32,
    pub invocations: u32,
    pub commit: String,
}

/// Outcome of `run` when no task failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: Vec<String>,
    /// `todo` tasks that can never run because a dependency failed.
    pub blocked: usize,
}

/// Load persisted run state, or start a new run. The flag is true for a new run.
pub fn open_run_state(store: &RunStateStore) -> Result<(RunState, bool)> {
    match store.load()? {
        Some(state) => {
            info!(run_id = %state.run_id, active = ?state.active_task_id, "resuming run");
            Ok((state, false))
        }
        None => {
            let state = RunState::new(generate_run_id());
            info!(run_id = %state.run_id, "starting new run");
            Ok((state, true))
        }
    }
}

pub struct Runner<'a, B: Backend + ?Sized, C: Checkpoints + ?Sized> {
    paths: &'a HarnessPaths,
    config: &'a HarnessConfig,
    backend: &'a B,
    checkpoints: &'a C,
    store: RunStateStore,
    state: RunState,
    cancel: CancelToken,
}

impl<'a, B: Backend + ?Sized, C: Checkpoints + ?Sized> Runner<'a, B, C> {
    pub fn new(
        paths: &'a HarnessPaths,
        config: &'a HarnessConfig,
        backend: &'a B,
        checkpoints: &'a C,
        store: RunStateStore,
        state: RunState,
        cancel: CancelToken,
    ) -> Self {
        Self {
            paths,
            config,
            backend,
            checkpoints,
            store,
            state,
            cancel,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Task to work on next: the interrupted one if it is still `todo`,
    /// otherwise the first runnable task in file order.
    pub fn select_task(&self, tasks: &TaskStore) -> Option<String> {
        if let Some(active) = self.state.active_task_id.as_deref() {
            match tasks.get(active).map(|task| task.status) {
                Some(TaskStatus::Todo) => return Some(active.to_string()),
                Some(TaskStatus::Failed) => {
                    warn!(task_id = active, "active task already failed, moving on");
                }
                Some(TaskStatus::Done) => {
                    info!(task_id = active, "active task already done, moving on");
                }
                None => warn!(task_id = active, "active task not in task file"),
            }
        }
        next_runnable(tasks.tasks()).map(|task| task.id.clone())
    }

    /// Run one task to completion or failure.
    #[instrument(skip_all, fields(run_id = %self.state.run_id, task_id = %task_id))]
    pub fn run_task(&mut self, tasks: &mut TaskStore, task_id: &str) -> Result<TaskReport> {
        self.cancel.check()?;
        let mut task = tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown task id: {task_id}"))?;

        let artifacts = Artifacts::create(&self.paths.runs_dir, &self.state.run_id)?;
        self.state.artifact_root_path = Some(artifacts.root().to_path_buf());

        let policy = RetryPolicy::new(self.config.retry.attempts, self.config.retry.rotations)?;
        let snapshot = task.clone();
        let mut attempts = AttemptRunner {
            backend: self.backend,
            config: self.config,
            workdir: &self.paths.root,
            artifacts: &artifacts,
            cancel: &self.cancel,
            task: &snapshot,
            last_failure: None,
        };
        let outcome = policy.execute(
            &mut self.state,
            &self.store,
            self.checkpoints,
            &mut task,
            |ctx| attempts.run(ctx),
        );

        let success = match outcome {
            Ok(success) => success,
            Err(err) => {
                if err.downcast_ref::<TaskFailedError>().is_some() {
                    self.record_failure(tasks, task_id)
                        .with_context(|| format!("record failure of task {task_id}"))?;
                }
                return Err(err);
            }
        };

        tasks.set_status(task_id, TaskStatus::Done)?;
        tasks.save()?;
        let done = tasks
            .get(task_id)
            .ok_or_else(|| anyhow!("unknown task id: {task_id}"))?;
        archive_task(&self.paths.archive_dir, done)?;
        append_progress(&self.paths.progress_path, done)?;

        let commit = self
            .checkpoints
            .create_savepoint(&done.commit_message, &task_footer(task_id))
            .with_context(|| format!("savepoint for task {task_id}"))?;
        self.state.last_savepoint_commit = Some(commit.clone());
        self.state.clear_active();
        if next_runnable(tasks.tasks()).is_none() {
            self.store.clear()?;
        } else {
            self.store.save(&self.state)?;
        }
        info!(
            commit = %commit,
            rotation = success.rotation,
            attempt = success.attempt,
            "task done"
        );
        Ok(TaskReport {
            task_id: task_id.to_string(),
            rotation: success.rotation,
            attempt: success.attempt,
            invocations: success.invocations,
            commit,
        })
    }

    /// Run tasks in order until none is runnable or one fails.
    #[instrument(skip_all, fields(run_id = %self.state.run_id))]
    pub fn run(&mut self, tasks: &mut TaskStore) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            self.cancel.check()?;
            let Some(task_id) = self.select_task(tasks) else {
                break;
            };
            let report = self.run_task(tasks, &task_id)?;
            summary.completed.push(report.task_id);
        }
        self.store.clear()?;
        summary.blocked = blocked_count(tasks.tasks());
        if summary.blocked > 0 {
            warn!(blocked = summary.blocked, "tasks blocked by failed dependencies");
        }
        info!(completed = summary.completed.len(), "run finished");
        Ok(summary)
    }

    /// Discard the failed task's edits and commit only its `failed` status and
    /// progress entry. The run state keeps the task active.
    fn record_failure(&mut self, tasks: &mut TaskStore, task_id: &str) -> Result<()> {
        let savepoint = self
            .state
            .last_savepoint_commit
            .clone()
            .ok_or_else(|| anyhow!("no savepoint recorded for task {task_id}"))?;
        self.checkpoints
            .rollback(&savepoint)
            .with_context(|| format!("roll back to savepoint {savepoint}"))?;

        tasks.set_status(task_id, TaskStatus::Failed)?;
        tasks.save()?;
        if let Some(task) = tasks.get(task_id) {
            append_progress(&self.paths.progress_path, task)?;
        }
        let commit = self.checkpoints.create_savepoint_of(
            &failure_subject(task_id),
            &task_footer(task_id),
            &FAILURE_RECORD_FILES,
        )?;
        warn!(commit = %commit, "task failed, status committed");
        self.state.last_savepoint_commit = Some(commit);
        self.store.save(&self.state)
    }
}

/// Per-task attempt callback state.
struct AttemptRunner<'r, B: Backend + ?Sized> {
    backend: &'r B,
    config: &'r HarnessConfig,
    workdir: &'r Path,
    artifacts: &'r Artifacts,
    cancel: &'r CancelToken,
    task: &'r Task,
    /// Output of the previous failed attempt, fed into the retry prompt.
    last_failure: Option<String>,
}

impl<B: Backend + ?Sized> AttemptRunner<'_, B> {
    fn run(&mut self, ctx: &mut AttemptContext) -> Result<(), AttemptError> {
        let (rotation, attempt) = (ctx.rotation, ctx.attempt);
        let stem = self.artifacts.attempt_stem(rotation, attempt);
        let session_id = match &ctx.session_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .backend
                    .start_session()
                    .map_err(AttemptError::recoverable)?;
                ctx.session_id = Some(id.clone());
                id
            }
        };

        let prompt = match &self.last_failure {
            Some(failure) => render_retry(self.task, rotation, attempt, failure),
            None => render_implement(self.task),
        }
        .map_err(AttemptError::fatal)?;
        self.artifacts
            .write_file("prompts", &format!("{stem}.md"), prompt.as_bytes())
            .map_err(AttemptError::fatal)?;

        let deadline = self.cancel.child_with_timeout(self.config.attempt_timeout());
        let reply = match self.backend.send(&session_id, &prompt, &deadline) {
            Ok(reply) => reply,
            Err(err) => {
                self.last_failure = Some(format!("{err:#}"));
                return Err(AttemptError::recoverable(err));
            }
        };
        self.artifacts
            .write_file("backend", &format!("{stem}.log"), reply.transcript.as_bytes())
            .map_err(AttemptError::fatal)?;
        if let Err(err) = reply.check(self.backend.name()) {
            self.last_failure = Some(format!("{err}\n\n{}", reply.output));
            return Err(AttemptError::recoverable(err));
        }

        match run_verification(
            self.artifacts,
            &stem,
            self.workdir,
            &self.task.verify,
            &deadline,
            self.config.verify_output_limit_bytes,
        ) {
            Ok(_) => {
                self.last_failure = None;
                Ok(())
            }
            Err(err) => match err.downcast_ref::<VerifyError>() {
                Some(verify) => {
                    let log = fs::read_to_string(&verify.log_path).unwrap_or_default();
                    self.last_failure = Some(format!("{verify}\n\n{log}"));
                    Err(AttemptError::recoverable(err))
                }
                None => Err(AttemptError::fatal(err)),
            },
        }
    }
}
