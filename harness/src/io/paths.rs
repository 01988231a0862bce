//! Fixed layout of harness-owned files below the repository root.

use std::path::PathBuf;

/// Entries written to `.harness/.gitignore`: per-run scratch never committed.
pub const HARNESS_GITIGNORE: &str = "runs/\nstate/\n";

/// Files committed when a task is marked failed, relative to the repository root.
pub const FAILURE_RECORD_FILES: [&str; 2] = [".harness/tasks.yaml", ".harness/progress.md"];

#[derive(Debug, Clone)]
pub struct HarnessPaths {
    pub root: PathBuf,
    pub harness_dir: PathBuf,
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub tasks_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    pub progress_path: PathBuf,
}

impl HarnessPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let harness_dir = root.join(".harness");
        let state_dir = harness_dir.join("state");
        Self {
            root: root.clone(),
            harness_dir: harness_dir.clone(),
            state_dir: state_dir.clone(),
            runs_dir: harness_dir.join("runs"),
            archive_dir: harness_dir.join("archive"),
            gitignore_path: harness_dir.join(".gitignore"),
            tasks_path: harness_dir.join("tasks.yaml"),
            config_path: harness_dir.join("config.toml"),
            run_state_path: state_dir.join("run.json"),
            progress_path: harness_dir.join("progress.md"),
        }
    }
}
