//! Agent backend abstraction.
//!
//! The [`Backend`] trait decouples the orchestrator from the concrete coding
//! agent CLI. The closed set of supported CLIs is [`BackendKind`]; both are
//! driven by [`CliBackend`]. Tests use a scripted backend that never spawns an
//! agent.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::BackendConfig;
use crate::io::process::run_command;

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Opencode,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Opencode => "opencode",
        }
    }

    /// Executable used when the config does not override it.
    pub fn default_command(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one backend turn. Returned whenever the process ran at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    /// Agent's textual answer (parsed from structured output when available).
    pub output: String,
    /// Raw stdout and stderr, for the artifact log.
    pub transcript: String,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl BackendReply {
    /// Turn a non-successful reply into a [`BackendError`].
    pub fn check(&self, backend: &str) -> Result<(), BackendError> {
        if self.cancelled {
            return Err(BackendError::Cancelled {
                backend: backend.to_string(),
            });
        }
        match self.exit_code {
            Some(0) => Ok(()),
            Some(code) => Err(BackendError::Exit {
                backend: backend.to_string(),
                code,
            }),
            None => Err(BackendError::Signal {
                backend: backend.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend {backend} exited with status {code}")]
    Exit { backend: String, code: i32 },
    #[error("backend {backend} terminated by signal")]
    Signal { backend: String },
    #[error("backend {backend} cancelled")]
    Cancelled { backend: String },
}

/// Abstraction over coding agent backends.
pub trait Backend {
    fn name(&self) -> &str;

    /// Open a new conversation and return its handle.
    fn start_session(&self) -> Result<String>;

    /// Send one prompt within `session_id`.
    ///
    /// Errors are reserved for failing to run the agent at all; a turn that
    /// ran but failed comes back as a reply whose [`BackendReply::check`] fails.
    fn send(&self, session_id: &str, prompt: &str, cancel: &CancelToken) -> Result<BackendReply>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SessionSlot {
    started: bool,
    /// Conversation id reported by the agent itself (opencode only).
    external_id: Option<String>,
}

/// Backend that spawns the agent CLI once per turn, prompt on stdin.
#[derive(Debug)]
pub struct CliBackend {
    kind: BackendKind,
    program: String,
    extra_args: Vec<String>,
    model: Option<String>,
    workdir: PathBuf,
    output_limit_bytes: usize,
    sessions: RefCell<HashMap<String, SessionSlot>>,
}

impl CliBackend {
    pub fn from_config(
        cfg: &BackendConfig,
        workdir: impl Into<PathBuf>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            kind: cfg.kind,
            program: cfg
                .command
                .clone()
                .unwrap_or_else(|| cfg.kind.default_command().to_string()),
            extra_args: cfg.args.clone(),
            model: cfg.model.clone().filter(|m| !m.trim().is_empty()),
            workdir: workdir.into(),
            output_limit_bytes,
            sessions: RefCell::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl Backend for CliBackend {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn start_session(&self) -> Result<String> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{}-{}-{nanos}", self.kind, std::process::id());
        self.sessions
            .borrow_mut()
            .insert(id.clone(), SessionSlot::default());
        debug!(session_id = %id, "backend session started");
        Ok(id)
    }

    #[instrument(skip_all, fields(backend = %self.kind, session_id = %session_id))]
    fn send(&self, session_id: &str, prompt: &str, cancel: &CancelToken) -> Result<BackendReply> {
        // A handle from a previous process (resume after a crash) is not in
        // the map; the agent CLI still holds that conversation, so continue it.
        let slot = self
            .sessions
            .borrow()
            .get(session_id)
            .cloned()
            .unwrap_or_else(|| {
                info!("continuing session from a previous process");
                SessionSlot {
                    started: true,
                    external_id: None,
                }
            });

        let args = build_args(
            self.kind,
            &self.extra_args,
            self.model.as_deref(),
            &slot,
        );
        debug!(program = %self.program, args = ?args, "invoking backend");
        let mut cmd = Command::new(&self.program);
        cmd.args(&args).current_dir(&self.workdir);
        let output = run_command(cmd, Some(prompt.as_bytes()), cancel, self.output_limit_bytes)
            .with_context(|| format!("run backend {}", self.program))?;

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        let (text, external_id) = match self.kind {
            BackendKind::Claude => (stdout.clone(), None),
            BackendKind::Opencode => parse_opencode_output(&stdout),
        };

        // Mark as started even on failure; the CLI may already hold state.
        let mut updated = slot;
        updated.started = true;
        if external_id.is_some() {
            updated.external_id = external_id;
        }
        self.sessions
            .borrow_mut()
            .insert(session_id.to_string(), updated);

        let reply = BackendReply {
            output: if text.trim().is_empty() { stdout.clone() } else { text },
            transcript: format!("=== stdout ===\n{stdout}\n=== stderr ===\n{stderr}"),
            exit_code: output.status.code(),
            cancelled: output.cancelled,
        };
        if let Err(err) = reply.check(self.name()) {
            warn!(err = %err, "backend turn failed");
        }
        Ok(reply)
    }
}

fn build_args(
    kind: BackendKind,
    extra: &[String],
    model: Option<&str>,
    slot: &SessionSlot,
) -> Vec<String> {
    let has = |flag: &str| extra.iter().any(|arg| arg == flag);
    let mut args = Vec::new();
    match kind {
        BackendKind::Claude => {
            args.extend(extra.iter().cloned());
            if !has("-p") && !has("--print") {
                args.push("-p".to_string());
            }
            if !has("--dangerously-skip-permissions") {
                args.push("--dangerously-skip-permissions".to_string());
            }
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if slot.started {
                args.push("--continue".to_string());
            }
        }
        BackendKind::Opencode => {
            if !has("run") {
                args.push("run".to_string());
            }
            args.extend(extra.iter().cloned());
            if !has("--format") {
                args.extend(["--format".to_string(), "json".to_string()]);
            }
            if let Some(model) = model {
                args.extend(["--model".to_string(), model.to_string()]);
            }
            if slot.started {
                match &slot.external_id {
                    Some(id) => args.extend(["--session".to_string(), id.clone()]),
                    None => {
                        warn!("opencode session id unknown, falling back to --continue");
                        args.push("--continue".to_string());
                    }
                }
            }
        }
    }
    args
}

#[derive(Debug, Default, Deserialize)]
struct OpencodeEvent {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "sessionID")]
    session_id: Option<String>,
    #[serde(default)]
    part: Option<OpencodePart>,
}

#[derive(Debug, Default, Deserialize)]
struct OpencodePart {
    #[serde(default)]
    text: Option<String>,
}

/// Extract text parts and the conversation id from opencode's NDJSON stream.
fn parse_opencode_output(stdout: &str) -> (String, Option<String>) {
    let mut texts = Vec::new();
    let mut session_id = None;
    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let Ok(event) = serde_json::from_str::<OpencodeEvent>(line) else {
            continue;
        };
        if session_id.is_none() {
            session_id = event.session_id.filter(|id| !id.is_empty());
        }
        if event.kind != "text" {
            continue;
        }
        if let Some(text) = event.part.and_then(|p| p.text).filter(|t| !t.is_empty()) {
            texts.push(text);
        }
    }
    (texts.join("\n"), session_id)
}
