//! Per-run artifact directories under `.harness/runs/<run-id>/`.
//!
//! Artifacts are write-once diagnostics: prompts sent to the backend, backend
//! transcripts, verification logs and version-control records. Nothing here is
//! read back by the engine, and no file is written twice.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::run_id::validate_run_id;

/// Subdirectories created for every run.
pub const SUBDIRS: [&str; 4] = ["prompts", "backend", "verify", "vcs"];

/// Handle to one run's artifact tree.
#[derive(Debug, Clone)]
pub struct Artifacts {
    root: PathBuf,
}

impl Artifacts {
    /// Create (or reopen) the artifact tree for `run_id` below `runs_dir`.
    #[instrument(skip_all, fields(run_id))]
    pub fn create(runs_dir: &Path, run_id: &str) -> Result<Self> {
        validate_run_id(run_id)?;
        let root = runs_dir.join(run_id);
        for sub in SUBDIRS {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create artifact dir {}", dir.display()))?;
        }
        debug!(root = %root.display(), "artifact tree ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one of [`SUBDIRS`].
    pub fn dir(&self, subdir: &str) -> Result<PathBuf> {
        if !SUBDIRS.contains(&subdir) {
            return Err(anyhow!("unknown artifact subdir '{subdir}'"));
        }
        Ok(self.root.join(subdir))
    }

    /// Stem naming one attempt's artifacts: `<rotation>-<attempt>`.
    ///
    /// A resumed process repeats the interrupted attempt with the same
    /// counters; its artifacts then get `<rotation>-<attempt>.<n>` so the
    /// earlier files are never overwritten.
    pub fn attempt_stem(&self, rotation: u32, attempt: u32) -> String {
        let base = format!("{rotation}-{attempt}");
        let mut stem = base.clone();
        let mut n = 1;
        while self.stem_taken(&stem) {
            n += 1;
            stem = format!("{base}.{n}");
        }
        stem
    }

    fn stem_taken(&self, stem: &str) -> bool {
        SUBDIRS.iter().any(|sub| {
            let Ok(entries) = fs::read_dir(self.root.join(sub)) else {
                return false;
            };
            entries.flatten().any(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix(stem)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
            })
        })
    }

    /// Write `contents` to `<subdir>/<name>` and return the path written.
    ///
    /// `name` may carry one group directory (`1-2/01.log`). Existing files are
    /// never replaced.
    pub fn write_file(&self, subdir: &str, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let parts: Vec<&str> = name.split('/').collect();
        if parts.len() > 2
            || parts
                .iter()
                .any(|part| part.is_empty() || *part == "." || *part == "..")
        {
            return Err(anyhow!("invalid artifact file name '{name}'"));
        }
        let path = self.dir(subdir)?.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create artifact {}", path.display()))?;
        file.write_all(contents)
            .with_context(|| format!("write artifact {}", path.display()))?;
        debug!(path = %path.display(), bytes = contents.len(), "artifact written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN: &str = "20250102-030405-ab12";

    #[test]
    fn creates_all_subdirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        for sub in SUBDIRS {
            assert!(artifacts.root().join(sub).is_dir(), "{sub} missing");
        }
        assert_eq!(artifacts.root(), temp.path().join(RUN));
    }

    #[test]
    fn write_file_lands_in_subdir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        let path = artifacts
            .write_file("prompts", "1-2.md", b"hello")
            .expect("write");
        assert_eq!(path, temp.path().join(RUN).join("prompts").join("1-2.md"));
        assert_eq!(fs::read_to_string(path).expect("read"), "hello");
    }

    #[test]
    fn nested_name_creates_group_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        let path = artifacts.write_file("verify", "2-1/01.log", b"ok").expect("write");
        assert!(path.ends_with("verify/2-1/01.log"));
        assert_eq!(fs::read_to_string(path).expect("read"), "ok");
    }

    #[test]
    fn existing_artifact_is_never_replaced() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        let path = artifacts.write_file("backend", "1-1.log", b"first").expect("write");
        assert!(artifacts.write_file("backend", "1-1.log", b"second").is_err());
        assert_eq!(fs::read_to_string(path).expect("read"), "first");
    }

    #[test]
    fn attempt_stem_moves_past_existing_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        assert_eq!(artifacts.attempt_stem(1, 1), "1-1");
        artifacts.write_file("prompts", "1-1.md", b"").expect("write");
        assert_eq!(artifacts.attempt_stem(1, 1), "1-1.2");
        artifacts.write_file("verify", "1-1.2/01.log", b"").expect("write");
        assert_eq!(artifacts.attempt_stem(1, 1), "1-1.3");
        // 1-10 does not shadow 1-1.
        artifacts.write_file("prompts", "1-10.md", b"").expect("write");
        assert_eq!(artifacts.attempt_stem(1, 10), "1-10.2");
        assert_eq!(artifacts.attempt_stem(2, 1), "2-1");
    }

    #[test]
    fn rejects_unknown_subdir_and_bad_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = Artifacts::create(temp.path(), RUN).expect("create");
        assert!(artifacts.write_file("other", "a.log", b"").is_err());
        assert!(artifacts.write_file("verify", "../a.log", b"").is_err());
        assert!(artifacts.write_file("verify", "a/b/c.log", b"").is_err());
        assert!(artifacts.write_file("verify", "", b"").is_err());
    }

    #[test]
    fn rejects_malformed_run_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(Artifacts::create(temp.path(), "../escape").is_err());
    }
}
