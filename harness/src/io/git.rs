//! Git adapter backing savepoints and rollback.
//!
//! The harness never reimplements version control; it shells out to `git`
//! through this small, explicit wrapper.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::checkpoint::{Checkpoints, savepoint_message};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    /// When set, savepoint and rollback transcripts are written here.
    record_dir: Option<PathBuf>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            record_dir: None,
        }
    }

    /// Write `<timestamp>-<op>.log` records of savepoints and rollbacks to `dir`.
    pub fn with_records(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = Some(dir.into());
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Top-level directory of the repository containing `workdir`.
    pub fn repo_root(&self) -> Result<PathBuf> {
        let out = self
            .run_capture(&["rev-parse", "--show-toplevel"])
            .with_context(|| format!("{} is not inside a git repository", self.workdir.display()))?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Full SHA of `HEAD`.
    pub fn head(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let disallowed: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// True if `rel_path` (relative to the workdir) is covered by an ignore rule.
    pub fn is_ignored(&self, rel_path: &str) -> Result<bool> {
        let output = self.run(&["check-ignore", "-q", "--no-index", rel_path])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git check-ignore {rel_path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit everything in the worktree and return the new HEAD.
    ///
    /// Unlike a plain `git commit`, an empty stage is reported as an error so
    /// a savepoint always names a commit containing the task's work.
    #[instrument(skip_all)]
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Stage `paths` only and commit them; unrelated changes stay uncommitted.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub fn commit_paths(&self, message: &str, paths: &[&str]) -> Result<String> {
        let mut args = vec!["add", "-A", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        self.commit_staged(message)
    }

    fn commit_staged(&self, message: &str) -> Result<String> {
        let staged = self.run(&["diff", "--cached", "--quiet"])?;
        if staged.status.success() {
            return Err(anyhow!("nothing to commit for savepoint"));
        }
        let output = self.run_checked(&["commit", "-q", "-m", message])?;
        let sha = self.head()?;
        self.record("savepoint", &format!("commit {sha}\n\n{message}\n"), &output);
        info!(commit = %sha, "savepoint committed");
        Ok(sha)
    }

    /// `git reset --hard <commit>`. Untracked files are kept.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        let output = self.run_checked(&["reset", "--hard", commit])?;
        self.record("rollback", &format!("reset --hard {commit}\n"), &output);
        info!(commit, "rolled back");
        Ok(())
    }

    fn record(&self, op: &str, header: &str, output: &Output) {
        let Some(dir) = &self.record_dir else {
            return;
        };
        let name = format!("{}-{op}.log", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let mut body = header.to_string();
        body.push_str(&String::from_utf8_lossy(&output.stdout));
        body.push_str(&String::from_utf8_lossy(&output.stderr));
        // Records are diagnostics; a failed write must not undo the git operation.
        if let Err(err) = fs::create_dir_all(dir).and_then(|()| fs::write(dir.join(&name), body)) {
            warn!(err = %err, op, "failed to write vcs record");
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Checkpoints for Git {
    fn current_commit(&self) -> Result<String> {
        self.head()
    }

    fn create_savepoint(&self, subject: &str, footer: &str) -> Result<String> {
        self.commit_all(&savepoint_message(subject, footer))
    }

    fn create_savepoint_of(&self, subject: &str, footer: &str, paths: &[&str]) -> Result<String> {
        self.commit_paths(&savepoint_message(subject, footer), paths)
    }

    fn rollback(&self, commit: &str) -> Result<()> {
        self.reset_hard(commit)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::task_footer;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_and_renamed_lines() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(e.code, "??");
        assert_eq!(e.path, "foo.txt");
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn savepoint_commits_tracked_and_untracked_with_footer() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let before = git.current_commit().expect("head");
        repo.write("src/new.rs", "fn main() {}\n").expect("write");

        let sha = git
            .create_savepoint("feat: add main", &task_footer("T1"))
            .expect("savepoint");
        assert_ne!(sha, before);
        assert_eq!(sha, git.head().expect("head"));
        assert!(!git.is_dirty().expect("status"));
        let message = repo.git(&["log", "-1", "--format=%B"]).expect("log");
        assert_eq!(message.trim_end(), "feat: add main\n\nHarness-Task: T1");
    }

    #[test]
    fn savepoint_with_nothing_to_commit_errors() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let err = git.create_savepoint("empty", "Harness-Task: T1").unwrap_err();
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[test]
    fn savepoint_of_paths_leaves_other_changes_uncommitted() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        repo.write(".harness/tasks.yaml", "tasks\n").expect("write");
        repo.write("scratch.txt", "agent leftover\n").expect("write");

        git.create_savepoint_of("chore: bookkeeping", &task_footer("T1"), &[".harness/tasks.yaml"])
            .expect("savepoint");
        let files = repo
            .git(&["show", "--name-only", "--format=", "HEAD"])
            .expect("show");
        assert_eq!(files.trim(), ".harness/tasks.yaml");
        let status = git.status_porcelain().expect("status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].path, "scratch.txt");
        assert_eq!(status[0].code, "??");
    }

    #[test]
    fn rollback_restores_tracked_files_and_keeps_untracked() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        repo.write("tracked.txt", "original\n").expect("write");
        let base = git.create_savepoint("base", "Harness-Task: T0").expect("commit");

        repo.write("tracked.txt", "agent edit\n").expect("write");
        repo.write("scratch.txt", "untracked\n").expect("write");
        git.rollback(&base).expect("rollback");

        assert_eq!(repo.read("tracked.txt").expect("read"), "original\n");
        assert_eq!(repo.read("scratch.txt").expect("read"), "untracked\n");
        assert_eq!(git.current_commit().expect("head"), base);
    }

    #[test]
    fn records_land_in_record_dir() {
        let repo = TestRepo::new().expect("repo");
        let records = repo.path().join(".harness/runs/r/vcs");
        let git = Git::new(repo.path()).with_records(&records);
        let head = git.head().expect("head");
        git.rollback(&head).expect("rollback");
        let names: Vec<String> = fs::read_dir(&records)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("-rollback.log"));
    }

    #[test]
    fn ensure_clean_allows_prefixes() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        repo.write(".harness/tasks.yaml", "x").expect("write");
        git.ensure_clean_except_prefixes(&[".harness/"]).expect("allowed");
        repo.write("dirty.txt", "x").expect("write");
        let err = git.ensure_clean_except_prefixes(&[".harness/"]).unwrap_err();
        assert!(err.to_string().contains("dirty.txt"));
    }
}
