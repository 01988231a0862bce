//! Durable run bookkeeping (`.harness/state/run.json`).
//!
//! The file is the single source of truth for resuming an interrupted run. It
//! is written atomically after every attempt and validated strictly on load:
//! a malformed file is an error, never silently replaced by defaults.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::run_id::validate_run_id;
use crate::core::task::validate_task_id;

const RUN_STATE_SCHEMA: &str = include_str!("../../../schemas/run_state/v1.schema.json");

pub const RUN_STATE_VERSION: u32 = 1;

/// Persisted bookkeeping for the current run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunState {
    pub version: u32,
    pub run_id: String,
    /// Task currently being worked on; `None` means idle.
    pub active_task_id: Option<String>,
    /// 1-based rotation (fresh backend session after a rollback).
    pub rotation: u32,
    /// 1-based attempt within the current rotation.
    pub attempt: u32,
    /// Handle of the backend session to continue; `None` starts a fresh one.
    pub backend_session_id: Option<String>,
    /// Commit at the last task boundary. Rollback target for rotations.
    pub last_savepoint_commit: Option<String>,
    pub artifact_root_path: Option<PathBuf>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            version: RUN_STATE_VERSION,
            run_id: run_id.into(),
            active_task_id: None,
            rotation: 1,
            attempt: 1,
            backend_session_id: None,
            last_savepoint_commit: None,
            artifact_root_path: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active_task_id.is_none()
    }

    /// Return to idle after a task boundary, keeping run id and savepoint.
    pub fn clear_active(&mut self) {
        self.active_task_id = None;
        self.rotation = 1;
        self.attempt = 1;
        self.backend_session_id = None;
    }

    /// Semantic checks beyond the JSON schema.
    pub fn validate(&self) -> Result<()> {
        if self.version != RUN_STATE_VERSION {
            bail!(
                "unsupported run state version {} (expected {RUN_STATE_VERSION})",
                self.version
            );
        }
        validate_run_id(&self.run_id)?;
        if let Some(id) = &self.active_task_id {
            validate_task_id(id).context("active_task_id")?;
        }
        if self.rotation == 0 || self.attempt == 0 {
            bail!(
                "rotation and attempt are 1-based (got rotation={} attempt={})",
                self.rotation,
                self.attempt
            );
        }
        if self.backend_session_id.as_deref().is_some_and(str::is_empty) {
            bail!("backend_session_id must be null or non-empty");
        }
        if self.last_savepoint_commit.as_deref().is_some_and(str::is_empty) {
            bail!("last_savepoint_commit must be null or non-empty");
        }
        Ok(())
    }
}

/// Load/save/clear for the run state file.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no run is in progress.
    #[instrument(skip_all)]
    pub fn load(&self) -> Result<Option<RunState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no run state");
                return Ok(None);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read run state {}", self.path.display()));
            }
        };
        let state = parse_run_state(&contents)
            .with_context(|| format!("invalid run state {}", self.path.display()))?;
        debug!(
            run_id = %state.run_id,
            active_task = ?state.active_task_id,
            rotation = state.rotation,
            attempt = state.attempt,
            "run state loaded"
        );
        Ok(Some(state))
    }

    /// Atomically write run state to disk (temp file + rename).
    pub fn save(&self, state: &RunState) -> Result<()> {
        state.validate().context("refusing to save invalid run state")?;
        debug!(
            run_id = %state.run_id,
            active_task = ?state.active_task_id,
            rotation = state.rotation,
            attempt = state.attempt,
            "saving run state"
        );
        let mut buf = serde_json::to_string_pretty(state).context("serialize run state")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Remove the state file; a missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "run state cleared");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove run state {}", self.path.display())),
        }
    }
}

fn parse_run_state(contents: &str) -> Result<RunState> {
    let value: Value = serde_json::from_str(contents).context("parse json")?;
    validate_schema(&value)?;
    let state: RunState = serde_json::from_value(value).context("deserialize run state")?;
    state.validate()?;
    Ok(state)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(RUN_STATE_SCHEMA).context("parse run state schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile run state schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = "20250102-030405-ab12";

    fn store() -> (tempfile::TempDir, RunStateStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::new(temp.path().join("state").join("run.json"));
        (temp, store)
    }

    #[test]
    fn missing_file_loads_as_none() {
        let (_temp, store) = store();
        assert_eq!(store.load().expect("load"), None);
    }

    #[test]
    fn save_then_load_preserves_every_field() {
        let (_temp, store) = store();
        let state = RunState {
            active_task_id: Some("T1".to_string()),
            rotation: 2,
            attempt: 3,
            backend_session_id: Some("claude-1-2".to_string()),
            last_savepoint_commit: Some("abc1234".to_string()),
            artifact_root_path: Some(PathBuf::from("/tmp/runs").join(RUN)),
            ..RunState::new(RUN)
        };
        store.save(&state).expect("save");
        assert_eq!(store.load().expect("load"), Some(state));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn idle_state_serializes_nulls() {
        let (_temp, store) = store();
        store.save(&RunState::new(RUN)).expect("save");
        let contents = fs::read_to_string(store.path()).expect("read");
        let expected = format!(
            "{{\n  \"version\": 1,\n  \"run_id\": \"{RUN}\",\n  \"active_task_id\": null,\n  \"rotation\": 1,\n  \"attempt\": 1,\n  \"backend_session_id\": null,\n  \"last_savepoint_commit\": null,\n  \"artifact_root_path\": null\n}}\n"
        );
        assert_eq!(contents, expected);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let (_temp, store) = store();
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");

        fs::write(store.path(), "{not json").expect("write");
        assert!(store.load().is_err());

        let mut value = serde_json::to_value(RunState::new(RUN)).expect("value");
        value["surprise"] = Value::Bool(true);
        fs::write(store.path(), value.to_string()).expect("write");
        let err = store.load().unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));

        let mut value = serde_json::to_value(RunState::new(RUN)).expect("value");
        value["attempt"] = Value::from(0);
        fs::write(store.path(), value.to_string()).expect("write");
        assert!(store.load().is_err());
    }

    #[test]
    fn empty_session_string_is_rejected() {
        let mut state = RunState::new(RUN);
        state.backend_session_id = Some(String::new());
        assert!(state.validate().is_err());
    }

    #[test]
    fn clear_removes_file_and_tolerates_absence() {
        let (_temp, store) = store();
        store.save(&RunState::new(RUN)).expect("save");
        store.clear().expect("clear");
        assert!(!store.path().exists());
        store.clear().expect("second clear");
    }

    #[test]
    fn clear_active_keeps_run_and_savepoint() {
        let mut state = RunState {
            active_task_id: Some("T1".to_string()),
            rotation: 3,
            attempt: 2,
            backend_session_id: Some("s".to_string()),
            last_savepoint_commit: Some("abc1234".to_string()),
            ..RunState::new(RUN)
        };
        state.clear_active();
        assert!(state.is_idle());
        assert_eq!((state.rotation, state.attempt), (1, 1));
        assert_eq!(state.backend_session_id, None);
        assert_eq!(state.last_savepoint_commit.as_deref(), Some("abc1234"));
        assert_eq!(state.run_id, RUN);
    }
}
