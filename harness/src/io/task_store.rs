//! Task file load/save (`.harness/tasks.yaml`).
//!
//! Two shapes are accepted, a single task under `task:` or a list under
//! `tasks:`. The shape read is the shape written back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::task::{Task, TaskStatus, validate_tasks};

pub const TASK_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFileShape {
    Single,
    List,
}

#[derive(Debug, Serialize, Deserialize)]
struct SingleTaskFile {
    version: u32,
    task: Task,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskListFile {
    version: u32,
    tasks: Vec<Task>,
}

/// In-memory view of the task file plus where it came from.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    shape: TaskFileShape,
    tasks: Vec<Task>,
}

impl TaskStore {
    /// Load and validate the task file.
    #[instrument(skip_all)]
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
        let store = Self::parse(path, &contents)
            .with_context(|| format!("invalid task file {}", path.display()))?;
        debug!(tasks = store.tasks.len(), shape = ?store.shape, "tasks loaded");
        Ok(store)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(contents).context("parse yaml")?;
        // Pick the shape by key first so field errors name the offending field.
        let (version, shape, tasks) = match (doc.get("task"), doc.get("tasks")) {
            (Some(_), Some(_)) => bail!("task file has both `task` and `tasks`"),
            (Some(_), None) => {
                let file: SingleTaskFile =
                    serde_yaml::from_value(doc).context("parse single-task file")?;
                (file.version, TaskFileShape::Single, vec![file.task])
            }
            (None, Some(_)) => {
                let file: TaskListFile =
                    serde_yaml::from_value(doc).context("parse task list file")?;
                (file.version, TaskFileShape::List, file.tasks)
            }
            (None, None) => bail!("task file needs a `task` or `tasks` key"),
        };
        if version != TASK_FILE_VERSION {
            bail!("unsupported task file version {version} (expected {TASK_FILE_VERSION})");
        }
        let errors = validate_tasks(&tasks);
        if !errors.is_empty() {
            bail!("task validation failed:\n- {}", errors.join("\n- "));
        }
        Ok(Self {
            path: path.to_path_buf(),
            shape,
            tasks,
        })
    }

    /// Build a store in memory; `save` writes it to `path`.
    pub fn from_tasks(path: impl Into<PathBuf>, shape: TaskFileShape, tasks: Vec<Task>) -> Result<Self> {
        if shape == TaskFileShape::Single && tasks.len() != 1 {
            bail!("single-task file must hold exactly one task (got {})", tasks.len());
        }
        let errors = validate_tasks(&tasks);
        if !errors.is_empty() {
            bail!("task validation failed:\n- {}", errors.join("\n- "));
        }
        Ok(Self {
            path: path.into(),
            shape,
            tasks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> TaskFileShape {
        self.shape
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Apply a legal status transition to task `id`.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task id: {id}"))?;
        task.transition(status)
    }

    /// Atomically write the tasks back in their original shape.
    pub fn save(&self) -> Result<()> {
        let buf = match self.shape {
            TaskFileShape::Single => {
                let [task] = self.tasks.as_slice() else {
                    bail!("single-task file must hold exactly one task");
                };
                serde_yaml::to_string(&SingleTaskFile {
                    version: TASK_FILE_VERSION,
                    task: task.clone(),
                })
            }
            TaskFileShape::List => serde_yaml::to_string(&TaskListFile {
                version: TASK_FILE_VERSION,
                tasks: self.tasks.clone(),
            }),
        }
        .context("serialize tasks")?;
        write_atomic(&self.path, &buf)?;
        debug!(path = %self.path.display(), "tasks saved");
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("task file path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp tasks {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace tasks {}", path.display()))?;
    Ok(())
}
