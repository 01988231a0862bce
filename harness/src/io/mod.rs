//! Side-effecting helpers: filesystem, git, child processes, agent backends.

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod git;
pub mod paths;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod run_state;
pub mod task_store;
pub mod verify;
