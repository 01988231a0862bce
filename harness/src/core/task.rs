//! Task model and the deterministic selection policy.
//!
//! Tasks are created by a human or an external planner and only mutated by the
//! harness through [`Task::transition`], which enforces `todo -> done` and
//! `todo -> failed` as the only legal moves.

use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Informational only; never executed.
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Shell commands gating completion, run in order.
    #[serde(default)]
    pub verify: Vec<String>,
    #[serde(default)]
    pub commit_message: String,
}

impl Task {
    /// Apply a status change, rejecting anything but `todo -> done|failed`.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        match (self.status, next) {
            (TaskStatus::Todo, TaskStatus::Done | TaskStatus::Failed) => {
                self.status = next;
                Ok(())
            }
            (from, to) => Err(anyhow!(
                "illegal status transition for task {}: {from} -> {to}",
                self.id
            )),
        }
    }

    /// Validate fields that do not depend on sibling tasks.
    pub fn validate(&self) -> Result<()> {
        validate_task_id(&self.id)?;
        if self.title.trim().is_empty() {
            return Err(anyhow!("task {}: title is required", self.id));
        }
        if self.status != TaskStatus::Done && self.commit_message.trim().is_empty() {
            return Err(anyhow!(
                "task {}: commit_message is required unless status is done",
                self.id
            ));
        }
        if self.verify.iter().any(|cmd| cmd.trim().is_empty()) {
            return Err(anyhow!("task {}: verify commands must be non-empty", self.id));
        }
        Ok(())
    }
}

/// Task ids end up in commit footers and artifact file names.
pub fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("task id must not be empty"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("task id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Validate a whole task list: per-task rules, unique ids, known deps.
pub fn validate_tasks(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for task in tasks {
        if let Err(err) = task.validate() {
            errors.push(err.to_string());
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id: {}", task.id));
        }
    }
    for task in tasks {
        for dep in &task.deps {
            if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "task {} depends on non-existent task: {dep}",
                    task.id
                ));
            }
            if dep == &task.id {
                errors.push(format!("task {} depends on itself", task.id));
            }
        }
    }
    errors
}

/// First task in file order that is `todo` with every dependency `done`.
pub fn next_runnable(tasks: &[Task]) -> Option<&Task> {
    let status = status_index(tasks);
    tasks.iter().find(|task| is_runnable(task, &status))
}

/// All runnable tasks in file order.
pub fn runnable_tasks(tasks: &[Task]) -> Vec<&Task> {
    let status = status_index(tasks);
    tasks
        .iter()
        .filter(|task| is_runnable(task, &status))
        .collect()
}

/// Number of `todo` tasks with at least one `failed` dependency.
pub fn blocked_count(tasks: &[Task]) -> usize {
    let status = status_index(tasks);
    tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Todo)
        .filter(|task| {
            task.deps
                .iter()
                .any(|dep| status.get(dep.as_str()) == Some(&TaskStatus::Failed))
        })
        .count()
}

fn status_index(tasks: &[Task]) -> HashMap<&str, TaskStatus> {
    tasks
        .iter()
        .map(|task| (task.id.as_str(), task.status))
        .collect()
}

fn is_runnable(task: &Task, status: &HashMap<&str, TaskStatus>) -> bool {
    task.status == TaskStatus::Todo
        && task
            .deps
            .iter()
            .all(|dep| status.get(dep.as_str()) == Some(&TaskStatus::Done))
}
