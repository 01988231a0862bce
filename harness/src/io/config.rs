//! Harness configuration stored under `.harness/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::backend::BackendKind;

/// Harness configuration (TOML).
///
/// Edited by humans; every field is optional and falls back to the defaults
/// below. CLI flags override individual values after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Wall-clock budget for one attempt (backend turn + verification).
    pub attempt_timeout_secs: u64,

    /// Truncate backend stdout/stderr captures beyond this many bytes.
    pub backend_output_limit_bytes: usize,

    /// Truncate each verification log beyond this many bytes.
    pub verify_output_limit_bytes: usize,

    pub retry: RetryConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per rotation.
    pub attempts: u32,
    /// Rotations per task (each after the first starts from a rollback).
    pub rotations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Executable override; defaults to the kind's own binary name.
    pub command: Option<String>,
    /// Extra arguments appended before the kind's own flags.
    pub args: Vec<String>,
    pub model: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            rotations: 3,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Claude,
            command: None,
            args: Vec::new(),
            model: None,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 30 * 60,
            backend_output_limit_bytes: 200_000,
            verify_output_limit_bytes: 200_000,
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.backend_output_limit_bytes == 0 {
            return Err(anyhow!("backend_output_limit_bytes must be > 0"));
        }
        if self.verify_output_limit_bytes == 0 {
            return Err(anyhow!("verify_output_limit_bytes must be > 0"));
        }
        if self.retry.attempts == 0 {
            return Err(anyhow!("retry.attempts must be > 0"));
        }
        if self.retry.rotations == 0 {
            return Err(anyhow!("retry.rotations must be > 0"));
        }
        if self
            .backend
            .command
            .as_deref()
            .is_some_and(|cmd| cmd.trim().is_empty())
        {
            return Err(anyhow!("backend.command must be non-empty when set"));
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
