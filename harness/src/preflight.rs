//! Checks run before any task starts.
//!
//! A fresh run (no run state on disk) requires a clean working tree so the
//! first savepoint only contains harness work. The clean check happens before
//! the harness touches any file itself.

use std::fs;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::io::git::Git;
use crate::io::paths::{HARNESS_GITIGNORE, HarnessPaths};

/// Paths that must never end up in a savepoint commit.
const SCRATCH_PATHS: [&str; 2] = [".harness/runs/", ".harness/state/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightOptions {
    /// No run state exists; enforce the clean-tree rule.
    pub fresh_run: bool,
    /// Write missing ignore rules instead of only warning.
    pub assume_yes: bool,
}

/// Validate the repository and prepare `.harness/` for a run.
pub fn prepare_run(git: &Git, paths: &HarnessPaths, opts: PreflightOptions) -> Result<()> {
    if !paths.tasks_path.is_file() {
        return Err(anyhow!(
            "task file not found: {}",
            paths.tasks_path.display()
        ));
    }
    if opts.fresh_run {
        git.ensure_clean_except_prefixes(&[])
            .context("uncommitted changes detected; commit or stash them before a fresh run")?;
    }

    let missing = missing_ignores(git)?;
    if missing.is_empty() {
        return Ok(());
    }
    if opts.assume_yes {
        ensure_harness_gitignore(paths)?;
        info!(path = %paths.gitignore_path.display(), "added harness ignore rules");
        return Ok(());
    }
    warn!(
        missing = %missing.join(", "),
        "harness scratch paths are not ignored; rerun with --yes to add them"
    );
    Ok(())
}

/// Scratch paths not yet covered by any ignore rule.
pub fn missing_ignores(git: &Git) -> Result<Vec<&'static str>> {
    let mut missing = Vec::new();
    for path in SCRATCH_PATHS {
        // check-ignore needs a path inside the directory to match `dir/` rules.
        if !git.is_ignored(&format!("{path}probe"))? {
            missing.push(path);
        }
    }
    Ok(missing)
}

/// Ensure `.harness/.gitignore` lists every scratch directory.
///
/// Existing lines are preserved; missing entries are appended.
pub fn ensure_harness_gitignore(paths: &HarnessPaths) -> Result<()> {
    fs::create_dir_all(&paths.harness_dir)
        .with_context(|| format!("create directory {}", paths.harness_dir.display()))?;
    let existing = if paths.gitignore_path.exists() {
        fs::read_to_string(&paths.gitignore_path)
            .with_context(|| format!("read {}", paths.gitignore_path.display()))?
    } else {
        String::new()
    };
    let mut out = existing.clone();
    for line in HARNESS_GITIGNORE.lines() {
        if existing.lines().any(|l| l.trim() == line) {
            continue;
        }
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
    }
    if out != existing {
        fs::write(&paths.gitignore_path, out)
            .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn fresh(assume_yes: bool) -> PreflightOptions {
        PreflightOptions {
            fresh_run: true,
            assume_yes,
        }
    }

    #[test]
    fn fresh_run_requires_clean_tree() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks_yaml("version: 1\ntasks: []\n").expect("tasks");
        repo.commit_all("chore: tasks").expect("commit");
        repo.write("stray.txt", "x").expect("write");
        let paths = HarnessPaths::new(repo.path());
        let err = prepare_run(&Git::new(repo.path()), &paths, fresh(true)).unwrap_err();
        assert!(format!("{err:#}").contains("stray.txt"));
        // Nothing was written before the check failed.
        assert!(!paths.gitignore_path.exists());
    }

    #[test]
    fn resumed_run_skips_clean_check() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks_yaml("version: 1\ntasks: []\n").expect("tasks");
        let paths = HarnessPaths::new(repo.path());
        let opts = PreflightOptions {
            fresh_run: false,
            assume_yes: false,
        };
        prepare_run(&Git::new(repo.path()), &paths, opts).expect("resume allowed");
    }

    #[test]
    fn assume_yes_writes_ignore_rules_once() {
        let repo = TestRepo::new().expect("repo");
        repo.write_tasks_yaml("version: 1\ntasks: []\n").expect("tasks");
        repo.commit_all("chore: tasks").expect("commit");
        let git = Git::new(repo.path());
        let paths = HarnessPaths::new(repo.path());
        assert_eq!(missing_ignores(&git).expect("check").len(), 2);

        prepare_run(&git, &paths, fresh(true)).expect("prepare");
        assert!(missing_ignores(&git).expect("check").is_empty());

        ensure_harness_gitignore(&paths).expect("again");
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            HARNESS_GITIGNORE
        );
    }

    #[test]
    fn missing_task_file_is_an_error() {
        let repo = TestRepo::new().expect("repo");
        let paths = HarnessPaths::new(repo.path());
        let err = prepare_run(&Git::new(repo.path()), &paths, fresh(false)).unwrap_err();
        assert!(err.to_string().contains("task file not found"));
    }
}
