//! Test-only fixtures: task builders, a scratch git repository, a scripted
//! backend and an in-memory checkpoint recorder.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};

use crate::core::cancel::CancelToken;
use crate::core::checkpoint::Checkpoints;
use crate::core::task::{Task, TaskStatus};
use crate::io::backend::{Backend, BackendReply};

/// A deterministic `todo` task with no deps and no verify commands.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        status: TaskStatus::Todo,
        deps: Vec::new(),
        description: format!("{id} description"),
        acceptance: Vec::new(),
        verify: Vec::new(),
        commit_message: format!("feat: {id}"),
    }
}

pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        deps: deps.iter().map(|dep| (*dep).to_string()).collect(),
        ..task(id)
    }
}

/// Scratch git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "-q"])?;
        repo.git(&["config", "user.email", "harness@example.com"])?;
        repo.git(&["config", "user.name", "Harness Test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# scratch\n")?;
        repo.commit_all("initial")?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn write_tasks_yaml(&self, contents: &str) -> Result<()> {
        self.write(".harness/tasks.yaml", contents)
    }

    /// Run git in the repository and return stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Stage everything and commit; returns the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "-q", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(self.git(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim()
            .parse()
            .map_err(|err| anyhow!("parse commit count '{}': {err}", out.trim()))
    }
}

/// One scripted backend turn.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    exit_code: i32,
    output: String,
    writes: Vec<(PathBuf, String)>,
}

impl Turn {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// Text returned as the agent's answer.
    pub fn says(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    /// File the "agent" writes during the turn.
    pub fn writes(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.writes.push((path.into(), contents.to_string()));
        self
    }
}

/// Backend replaying queued [`Turn`]s; an empty queue answers with success.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    turns: RefCell<VecDeque<Turn>>,
    prompts: RefCell<Vec<String>>,
    sessions: RefCell<Vec<String>>,
    started: Cell<u32>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: Turn) {
        self.turns.borrow_mut().push_back(turn);
    }

    /// Prompts received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    /// Session handle used for each prompt, in order.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.borrow().clone()
    }

    pub fn sessions_started(&self) -> u32 {
        self.started.get()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn start_session(&self) -> Result<String> {
        let n = self.started.get() + 1;
        self.started.set(n);
        Ok(format!("scripted-{n}"))
    }

    fn send(&self, session_id: &str, prompt: &str, cancel: &CancelToken) -> Result<BackendReply> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.sessions.borrow_mut().push(session_id.to_string());
        let turn = self.turns.borrow_mut().pop_front().unwrap_or_default();
        for (path, contents) in &turn.writes {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(BackendReply {
            transcript: turn.output.clone(),
            output: turn.output,
            exit_code: Some(turn.exit_code),
            cancelled: cancel.is_cancelled(),
        })
    }
}

/// In-memory [`Checkpoints`] that hands out fake 40-hex commit ids.
#[derive(Debug)]
pub struct RecordingCheckpoints {
    head: RefCell<String>,
    next: Cell<u64>,
    savepoints: RefCell<Vec<(String, String)>>,
    rollbacks: RefCell<Vec<String>>,
    current_commit_calls: Cell<usize>,
    fail_rollbacks: Cell<bool>,
}

impl Default for RecordingCheckpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCheckpoints {
    pub fn new() -> Self {
        Self {
            head: RefCell::new(fake_commit(1)),
            next: Cell::new(2),
            savepoints: RefCell::new(Vec::new()),
            rollbacks: RefCell::new(Vec::new()),
            current_commit_calls: Cell::new(0),
            fail_rollbacks: Cell::new(false),
        }
    }

    /// Commit reported before any savepoint is created.
    pub fn initial_commit(&self) -> String {
        fake_commit(1)
    }

    /// `(subject, footer)` of each savepoint, in order.
    pub fn savepoints(&self) -> Vec<(String, String)> {
        self.savepoints.borrow().clone()
    }

    /// Rollback targets, in order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.borrow().clone()
    }

    pub fn current_commit_calls(&self) -> usize {
        self.current_commit_calls.get()
    }

    /// Make every later rollback fail.
    pub fn fail_rollbacks(&self) {
        self.fail_rollbacks.set(true);
    }
}

impl Checkpoints for RecordingCheckpoints {
    fn current_commit(&self) -> Result<String> {
        self.current_commit_calls
            .set(self.current_commit_calls.get() + 1);
        Ok(self.head.borrow().clone())
    }

    fn create_savepoint(&self, subject: &str, footer: &str) -> Result<String> {
        let n = self.next.get();
        self.next.set(n + 1);
        let commit = fake_commit(n);
        self.savepoints
            .borrow_mut()
            .push((subject.to_string(), footer.to_string()));
        *self.head.borrow_mut() = commit.clone();
        Ok(commit)
    }

    fn create_savepoint_of(&self, subject: &str, footer: &str, _paths: &[&str]) -> Result<String> {
        self.create_savepoint(subject, footer)
    }

    fn rollback(&self, commit: &str) -> Result<()> {
        if self.fail_rollbacks.get() {
            bail!("reset --hard {commit} refused");
        }
        self.rollbacks.borrow_mut().push(commit.to_string());
        *self.head.borrow_mut() = commit.to_string();
        Ok(())
    }
}

fn fake_commit(n: u64) -> String {
    format!("{n:040x}")
}
