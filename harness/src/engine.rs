//! Two-level retry state machine for a single task.
//!
//! Attempts within a rotation continue the same backend session so the agent
//! keeps the context of its own failure. When a rotation is exhausted the
//! working tree is rolled back to the last savepoint and the next rotation
//! starts with a fresh session.
//!
//! Run state is persisted after every failed attempt and before the next one
//! starts, so a crash never records an attempt that did not finish.

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::core::checkpoint::Checkpoints;
use crate::core::task::{Task, TaskStatus};
use crate::io::run_state::{RunState, RunStateStore};

/// Retry bounds for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_rotations: u32,
}

/// Handed to the attempt callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptContext {
    pub rotation: u32,
    pub attempt: u32,
    /// Session to continue; `None` means start a fresh one. The callback
    /// stores the handle it used here so the engine can persist it.
    pub session_id: Option<String>,
}

/// Failure reported by an attempt callback.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    /// Counts against the retry budget (backend or verification failure).
    #[error(transparent)]
    Recoverable(anyhow::Error),
    /// Aborts the engine without consuming a retry.
    #[error(transparent)]
    Fatal(anyhow::Error),
}

impl AttemptError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

/// Every rotation was exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id} failed after {rotations} rotations")]
pub struct TaskFailedError {
    pub task_id: String,
    pub rotations: u32,
}

/// Where the task succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSuccess {
    pub rotation: u32,
    pub attempt: u32,
    /// Callback invocations made by this call (not counting earlier processes).
    pub invocations: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_rotations: u32) -> Result<Self> {
        if max_attempts == 0 {
            bail!("max attempts must be >= 1");
        }
        if max_rotations == 0 {
            bail!("max rotations must be >= 1");
        }
        Ok(Self {
            max_attempts,
            max_rotations,
        })
    }

    /// Drive `task` through attempts until one succeeds or every rotation is
    /// exhausted.
    ///
    /// On exhaustion the task is marked `failed` and a [`TaskFailedError`] is
    /// returned. On success the task status is left alone for the caller.
    /// State-store and checkpoint errors propagate immediately.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn execute<C, F>(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
        checkpoints: &C,
        task: &mut Task,
        mut attempt_fn: F,
    ) -> Result<EngineSuccess>
    where
        C: Checkpoints + ?Sized,
        F: FnMut(&mut AttemptContext) -> Result<(), AttemptError>,
    {
        if task.status != TaskStatus::Todo {
            bail!("task {} is {}, only todo tasks can run", task.id, task.status);
        }
        self.begin(state, store, checkpoints, &task.id)?;

        let mut invocations = 0u32;
        loop {
            let mut ctx = AttemptContext {
                rotation: state.rotation,
                attempt: state.attempt,
                session_id: state.backend_session_id.clone(),
            };
            info!(
                rotation = ctx.rotation,
                attempt = ctx.attempt,
                fresh_session = ctx.session_id.is_none(),
                "attempt starting"
            );
            let outcome = attempt_fn(&mut ctx);
            invocations += 1;
            state.backend_session_id = ctx.session_id;

            let err = match outcome {
                Ok(()) => {
                    info!(
                        rotation = state.rotation,
                        attempt = state.attempt,
                        invocations,
                        "attempt succeeded"
                    );
                    return Ok(EngineSuccess {
                        rotation: state.rotation,
                        attempt: state.attempt,
                        invocations,
                    });
                }
                Err(AttemptError::Fatal(err)) => {
                    warn!(err = %err, "attempt aborted");
                    return Err(err);
                }
                Err(AttemptError::Recoverable(err)) => err,
            };
            warn!(
                rotation = state.rotation,
                attempt = state.attempt,
                err = %err,
                "attempt failed"
            );

            if state.attempt < self.max_attempts {
                state.attempt += 1;
                store.save(state)?;
                continue;
            }

            if state.rotation < self.max_rotations {
                let savepoint = state
                    .last_savepoint_commit
                    .clone()
                    .ok_or_else(|| anyhow!("no savepoint recorded for task {}", task.id))?;
                checkpoints
                    .rollback(&savepoint)
                    .with_context(|| format!("roll back to savepoint {savepoint}"))?;
                state.rotation += 1;
                state.attempt = 1;
                state.backend_session_id = None;
                store.save(state)?;
                info!(
                    rotation = state.rotation,
                    savepoint = %savepoint,
                    "rotation exhausted, rolled back"
                );
                continue;
            }

            store.save(state)?;
            task.transition(TaskStatus::Failed)?;
            warn!(rotations = self.max_rotations, "all rotations exhausted");
            return Err(TaskFailedError {
                task_id: task.id.clone(),
                rotations: self.max_rotations,
            }
            .into());
        }
    }

    /// Initialise counters for a new task, or reuse them when resuming.
    fn begin<C: Checkpoints + ?Sized>(
        &self,
        state: &mut RunState,
        store: &RunStateStore,
        checkpoints: &C,
        task_id: &str,
    ) -> Result<()> {
        if state.active_task_id.as_deref() == Some(task_id) {
            self.clamp(state);
            info!(
                rotation = state.rotation,
                attempt = state.attempt,
                "resuming task"
            );
            return Ok(());
        }

        state.active_task_id = Some(task_id.to_string());
        state.rotation = 1;
        state.attempt = 1;
        state.backend_session_id = None;
        if state.last_savepoint_commit.is_none() {
            let head = checkpoints
                .current_commit()
                .context("capture initial savepoint")?;
            info!(commit = %head, "captured initial savepoint");
            state.last_savepoint_commit = Some(head);
        }
        store.save(state)?;
        info!("task started");
        Ok(())
    }

    /// Pull stored counters back inside the bounds (config may have shrunk).
    fn clamp(&self, state: &mut RunState) {
        if state.rotation > self.max_rotations {
            warn!(
                stored = state.rotation,
                max = self.max_rotations,
                "stored rotation beyond bound, resuming at final attempt"
            );
            state.rotation = self.max_rotations;
            state.attempt = self.max_attempts;
        }
        if state.attempt > self.max_attempts {
            warn!(
                stored = state.attempt,
                max = self.max_attempts,
                "stored attempt beyond bound"
            );
            state.attempt = self.max_attempts;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::test_support::{RecordingCheckpoints, task};

    const RUN: &str = "20250102-030405-ab12";

    struct Fixture {
        _temp: tempfile::TempDir,
        store: RunStateStore,
        state: RunState,
        checkpoints: RecordingCheckpoints,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::new(temp.path().join("state").join("run.json"));
        Fixture {
            _temp: temp,
            store,
            state: RunState::new(RUN),
            checkpoints: RecordingCheckpoints::new(),
        }
    }

    fn fail() -> Result<(), AttemptError> {
        Err(AttemptError::recoverable(anyhow!("verify failed")))
    }

    #[test]
    fn immediate_success_uses_one_attempt() {
        let mut fx = fixture();
        let mut t = task("T1");
        let policy = RetryPolicy::new(3, 3).expect("policy");
        let ok = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| Ok(()))
            .expect("success");
        assert_eq!(
            ok,
            EngineSuccess {
                rotation: 1,
                attempt: 1,
                invocations: 1
            }
        );
        assert_eq!(t.status, TaskStatus::Todo);
        assert_eq!(fx.checkpoints.rollbacks(), Vec::<String>::new());
        // Initial savepoint is the commit the task started from.
        assert_eq!(
            fx.state.last_savepoint_commit,
            Some(fx.checkpoints.initial_commit())
        );
    }

    #[test]
    fn succeeds_on_last_possible_attempt_for_many_bounds() {
        for attempts in 1..=3 {
            for rotations in 1..=3 {
                let mut fx = fixture();
                let mut t = task("T1");
                let policy = RetryPolicy::new(attempts, rotations).expect("policy");
                let budget = attempts * rotations;
                let mut calls = 0;
                let ok = policy
                    .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| {
                        calls += 1;
                        if calls < budget { fail() } else { Ok(()) }
                    })
                    .expect("success");
                assert_eq!(ok.invocations, budget);
                assert_eq!((ok.rotation, ok.attempt), (rotations, attempts));
                assert_eq!(
                    fx.checkpoints.rollbacks().len() as u32,
                    rotations - 1,
                    "A={attempts} R={rotations}"
                );
            }
        }
    }

    #[test]
    fn always_failing_marks_task_failed_after_full_budget() {
        let mut fx = fixture();
        let mut t = task("T1");
        let policy = RetryPolicy::new(2, 3).expect("policy");
        let mut calls = 0;
        let err = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| {
                calls += 1;
                fail()
            })
            .unwrap_err();
        assert_eq!(calls, 6);
        assert_eq!(t.status, TaskStatus::Failed);
        let failed = err.downcast_ref::<TaskFailedError>().expect("task failed");
        assert_eq!(failed.task_id, "T1");
        assert_eq!(failed.rotations, 3);
        assert!(err.to_string().contains("T1"));
        // State stays on disk describing the final attempt.
        let saved = fx.store.load().expect("load").expect("state");
        assert_eq!(saved.active_task_id.as_deref(), Some("T1"));
        assert_eq!((saved.rotation, saved.attempt), (3, 2));
    }

    #[test]
    fn two_by_two_rolls_back_once_and_starts_fresh_session() {
        let mut fx = fixture();
        let mut t = task("T1");
        let policy = RetryPolicy::new(2, 2).expect("policy");
        let mut seen: Vec<AttemptContext> = Vec::new();
        let mut next_session = 0;
        let ok = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |ctx| {
                seen.push(ctx.clone());
                if ctx.session_id.is_none() {
                    next_session += 1;
                    ctx.session_id = Some(format!("session-{next_session}"));
                }
                if seen.len() < 4 { fail() } else { Ok(()) }
            })
            .expect("success");
        assert_eq!((ok.rotation, ok.attempt), (2, 2));
        assert_eq!(fx.checkpoints.rollbacks(), vec![fx.checkpoints.initial_commit()]);

        let sessions: Vec<Option<&str>> =
            seen.iter().map(|ctx| ctx.session_id.as_deref()).collect();
        assert_eq!(
            sessions,
            vec![None, Some("session-1"), None, Some("session-2")]
        );
        let counters: Vec<(u32, u32)> = seen.iter().map(|c| (c.rotation, c.attempt)).collect();
        assert_eq!(counters, vec![(1, 1), (1, 2), (2, 1), (2, 2)]);
    }

    #[test]
    fn state_is_saved_before_each_retry() {
        let mut fx = fixture();
        let mut t = task("T1");
        let policy = RetryPolicy::new(3, 1).expect("policy");
        let store = fx.store.clone();
        let mut observed = Vec::new();
        let _ = policy.execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |ctx| {
            let saved = store.load().expect("load").expect("state");
            observed.push((saved.attempt, ctx.attempt));
            if ctx.attempt < 3 { fail() } else { Ok(()) }
        });
        assert_eq!(observed, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn resume_keeps_stored_counters_and_session() {
        let mut fx = fixture();
        fx.state.active_task_id = Some("T1".to_string());
        fx.state.rotation = 2;
        fx.state.attempt = 2;
        fx.state.backend_session_id = Some("session-9".to_string());
        fx.state.last_savepoint_commit = Some("abc1234".to_string());
        let mut t = task("T1");
        let policy = RetryPolicy::new(3, 3).expect("policy");
        let mut first = None;
        policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |ctx| {
                first.get_or_insert_with(|| ctx.clone());
                Ok(())
            })
            .expect("success");
        let first = first.expect("called");
        assert_eq!((first.rotation, first.attempt), (2, 2));
        assert_eq!(first.session_id.as_deref(), Some("session-9"));
        assert_eq!(fx.checkpoints.current_commit_calls(), 0);
    }

    #[test]
    fn resume_beyond_bounds_is_clamped_to_final_attempt() {
        let mut fx = fixture();
        fx.state.active_task_id = Some("T1".to_string());
        fx.state.rotation = 5;
        fx.state.attempt = 4;
        fx.state.last_savepoint_commit = Some("abc1234".to_string());
        let mut t = task("T1");
        let policy = RetryPolicy::new(2, 2).expect("policy");
        let mut calls = 0;
        let err = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| {
                calls += 1;
                fail()
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.downcast_ref::<TaskFailedError>().is_some());
    }

    #[test]
    fn switching_tasks_resets_counters_but_keeps_savepoint() {
        let mut fx = fixture();
        fx.state.active_task_id = Some("T0".to_string());
        fx.state.rotation = 3;
        fx.state.attempt = 2;
        fx.state.backend_session_id = Some("old".to_string());
        fx.state.last_savepoint_commit = Some("abc1234".to_string());
        let mut t = task("T1");
        let policy = RetryPolicy::new(3, 3).expect("policy");
        policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |ctx| {
                assert_eq!((ctx.rotation, ctx.attempt), (1, 1));
                assert_eq!(ctx.session_id, None);
                Ok(())
            })
            .expect("success");
        assert_eq!(fx.state.active_task_id.as_deref(), Some("T1"));
        assert_eq!(fx.state.last_savepoint_commit.as_deref(), Some("abc1234"));
    }

    #[test]
    fn fatal_error_stops_without_consuming_a_retry() {
        let mut fx = fixture();
        let mut t = task("T1");
        let policy = RetryPolicy::new(3, 3).expect("policy");
        let mut calls = 0;
        let err = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| {
                calls += 1;
                Err(AttemptError::fatal(anyhow!("disk full")))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.to_string().contains("disk full"));
        assert_eq!(t.status, TaskStatus::Todo);
        let saved = fx.store.load().expect("load").expect("state");
        assert_eq!((saved.rotation, saved.attempt), (1, 1));
    }

    #[test]
    fn rollback_failure_is_infrastructure_error() {
        let mut fx = fixture();
        fx.checkpoints.fail_rollbacks();
        let mut t = task("T1");
        let policy = RetryPolicy::new(1, 2).expect("policy");
        let err = policy
            .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| fail())
            .unwrap_err();
        assert!(err.downcast_ref::<TaskFailedError>().is_none());
        assert!(format!("{err:#}").contains("roll back to savepoint"));
        assert_eq!(t.status, TaskStatus::Todo);
    }

    #[test]
    fn rejects_non_todo_tasks_and_zero_bounds() {
        let mut fx = fixture();
        let mut t = task("T1");
        t.status = TaskStatus::Done;
        let policy = RetryPolicy::new(1, 1).expect("policy");
        assert!(
            policy
                .execute(&mut fx.state, &fx.store, &fx.checkpoints, &mut t, |_| Ok(()))
                .is_err()
        );
        assert!(RetryPolicy::new(0, 1).is_err());
        assert!(RetryPolicy::new(1, 0).is_err());
    }
}
