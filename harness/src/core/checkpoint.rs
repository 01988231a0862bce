//! Checkpoint abstraction over the version-control backend.
//!
//! The engine and orchestrator depend on this trait rather than on
//! [`crate::io::git::Git`] directly. Tests substitute an in-memory
//! recorder to count rollbacks without a repository.

use anyhow::Result;

pub trait Checkpoints {
    /// Identifier of the commit the working tree currently sits on.
    fn current_commit(&self) -> Result<String>;

    /// Stage everything (tracked and untracked), commit with
    /// `subject\n\nfooter`, and return the new commit id.
    ///
    /// Fails when there is nothing to commit.
    fn create_savepoint(&self, subject: &str, footer: &str) -> Result<String>;

    /// Like [`Checkpoints::create_savepoint`], but stages only `paths`
    /// (relative to the repository root). Other changes stay out of the commit.
    fn create_savepoint_of(&self, subject: &str, footer: &str, paths: &[&str]) -> Result<String>;

    /// Hard-reset tracked files to `commit`. Untracked files are left alone.
    fn rollback(&self, commit: &str) -> Result<()>;
}

/// Footer line tying a savepoint commit to the task that produced it.
pub fn task_footer(task_id: &str) -> String {
    format!("Harness-Task: {task_id}")
}

/// Subject of the commit recording that a task exhausted its retries.
pub fn failure_subject(task_id: &str) -> String {
    format!("chore(harness): mark task {task_id} failed")
}

/// Full commit message for a savepoint.
pub fn savepoint_message(subject: &str, footer: &str) -> String {
    format!("{}\n\n{}", subject.trim(), footer.trim())
}
