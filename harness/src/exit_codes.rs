//! Stable exit codes for harness CLI commands.

/// Command succeeded; for `harness run`, every runnable task completed.
pub const OK: i32 = 0;
/// Invalid config, task file, run state or repository, or an infrastructure failure.
pub const ERROR: i32 = 1;
/// `harness run` found no runnable task.
pub const NOTHING_TO_DO: i32 = 2;
/// A task exhausted every rotation and was marked failed.
pub const TASK_FAILED: i32 = 3;
