//! Task-execution harness driving a coding agent through a queue of tasks.
//!
//! Each task is handed to an agent backend, verified with shell commands and
//! committed as a git savepoint. Failed attempts are retried in the same
//! backend session; an exhausted rotation rolls the tree back to the last
//! savepoint and starts over with a fresh session.
//!
//! - **[`core`]**: Pure logic (task model and selection, run ids, cancellation,
//!   the checkpoint trait). No I/O.
//! - **[`io`]**: Side effects (git, processes, backends, state and task files,
//!   artifacts).
//! - **[`engine`]**: The attempt/rotation state machine for one task.
//! - **[`orchestrator`]**: Task selection and the per-task lifecycle built on
//!   the engine; [`preflight`] checks the repository before a run.

pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod preflight;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
