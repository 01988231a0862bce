//! Ordered shell verification with per-command logs.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::artifacts::Artifacts;
use crate::io::process::{CommandOutput, run_command};

/// Exit code recorded when the process never produced one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// One passed verification command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub log_path: PathBuf,
}

/// Why a verification command did not pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandFailure {
    #[error("exited with status {0}")]
    Exit(i32),
    #[error("terminated by signal")]
    Signal,
    #[error("cancelled")]
    Cancelled,
    #[error("failed to start: {0}")]
    Spawn(String),
}

/// First failing verification command.
#[derive(Debug, Clone, thiserror::Error)]
#[error("verify command `{command}` failed (exit code {exit_code}): {cause}; log: {}", log_path.display())]
pub struct VerifyError {
    pub command: String,
    pub exit_code: i32,
    pub log_path: PathBuf,
    pub cause: CommandFailure,
}

/// Run `commands` in order inside `workdir`, stopping at the first failure.
///
/// Each command runs through `/bin/sh -c` with stderr folded into stdout, and
/// its output lands in the artifact `verify/<group>/NN.log`. A failing
/// command is reported as a [`VerifyError`] wrapped in `anyhow`; errors
/// writing logs are returned as-is.
#[instrument(skip_all, fields(commands = commands.len()))]
pub fn run_verification(
    artifacts: &Artifacts,
    group: &str,
    workdir: &Path,
    commands: &[String],
    cancel: &CancelToken,
    output_limit_bytes: usize,
) -> Result<Vec<VerifyResult>> {
    let mut results = Vec::with_capacity(commands.len());
    for (idx, command) in commands.iter().enumerate() {
        let log_name = format!("{:02}.log", idx + 1);
        let started_at = Utc::now();
        let clock = Instant::now();
        debug!(command = %command, log = %log_name, "running verify command");

        let outcome = if cancel.is_cancelled() {
            Err(CommandFailure::Cancelled)
        } else {
            match run_command(shell(command, workdir), None, cancel, output_limit_bytes) {
                Ok(output) => Ok(output),
                Err(err) if cancel.is_cancelled() => {
                    debug!(err = %err, "verify command not started, token fired");
                    Err(CommandFailure::Cancelled)
                }
                Err(err) => Err(CommandFailure::Spawn(format!("{err:#}"))),
            }
        };
        let duration = clock.elapsed();

        let (log, failure) = match outcome {
            Ok(output) => {
                let failure = classify(&output);
                (render_log(&output), failure)
            }
            Err(failure) => (format!("[{failure}]\n"), Some(failure)),
        };
        let log_path =
            artifacts.write_file("verify", &format!("{group}/{log_name}"), log.as_bytes())?;

        if let Some(cause) = failure {
            let exit_code = match cause {
                CommandFailure::Exit(code) => code,
                _ => UNKNOWN_EXIT_CODE,
            };
            warn!(command = %command, exit_code, cause = %cause, "verify command failed");
            return Err(VerifyError {
                command: command.clone(),
                exit_code,
                log_path,
                cause,
            }
            .into());
        }

        info!(command = %command, elapsed_ms = duration.as_millis() as u64, "verify command passed");
        results.push(VerifyResult {
            command: command.clone(),
            started_at,
            duration,
            log_path,
        });
    }
    Ok(results)
}

fn shell(command: &str, workdir: &Path) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(format!("exec 2>&1\n{command}"))
        .current_dir(workdir);
    cmd
}

fn classify(output: &CommandOutput) -> Option<CommandFailure> {
    if output.cancelled {
        return Some(CommandFailure::Cancelled);
    }
    if output.status.success() {
        return None;
    }
    Some(match output.status.code() {
        Some(code) => CommandFailure::Exit(code),
        None => CommandFailure::Signal,
    })
}

fn render_log(output: &CommandOutput) -> String {
    let mut log = output.stdout_lossy();
    if output.cancelled {
        log.push_str("\n[cancelled]\n");
    }
    log
}
