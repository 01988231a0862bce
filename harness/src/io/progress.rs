//! Human-facing run history: `.harness/progress.md` and `.harness/archive/`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::core::task::Task;

const PROGRESS_HEADER: &str = "# Progress\n\n";

/// One line of the progress log.
pub fn progress_entry(at: DateTime<Utc>, task: &Task) -> String {
    format!(
        "- {} {} {} - {}",
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
        task.id,
        task.title.trim(),
        task.status
    )
}

/// Append an entry for `task`'s current status, creating the log if needed.
pub fn append_progress(path: &Path, task: &Task) -> Result<()> {
    append_entry(path, &progress_entry(Utc::now(), task))
}

fn append_entry(path: &Path, entry: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let existing = match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut buf = String::new();
    match existing {
        None => buf.push_str(PROGRESS_HEADER),
        Some(contents) if !contents.is_empty() && !contents.ends_with('\n') => buf.push('\n'),
        Some(_) => {}
    }
    buf.push_str(entry);
    buf.push('\n');
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    debug!(path = %path.display(), entry, "progress appended");
    Ok(())
}

/// Snapshot a completed task as `<archive_dir>/<UTC timestamp>-<id>.yaml`.
pub fn archive_task(archive_dir: &Path, task: &Task) -> Result<PathBuf> {
    archive_task_at(archive_dir, task, Utc::now())
}

fn archive_task_at(archive_dir: &Path, task: &Task, at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir)
        .with_context(|| format!("create directory {}", archive_dir.display()))?;
    let name = format!("{}-{}.yaml", at.format("%Y%m%dT%H%M%SZ"), task.id);
    let path = archive_dir.join(name);
    let buf = serde_yaml::to_string(task).context("serialize archived task")?;
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    debug!(path = %path.display(), "task archived");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskStatus;
    use crate::test_support::task;
    use chrono::TimeZone;

    #[test]
    fn entry_format_is_stable() {
        let mut t = task("T1");
        t.title = "Add parser".to_string();
        t.status = TaskStatus::Done;
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            progress_entry(at, &t),
            "- 2025-01-02T03:04:05Z T1 Add parser - done"
        );
    }

    #[test]
    fn append_creates_header_then_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".harness").join("progress.md");
        append_entry(&path, "- one").expect("first");
        append_entry(&path, "- two").expect("second");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "# Progress\n\n- one\n- two\n"
        );
    }

    #[test]
    fn append_repairs_missing_trailing_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.md");
        fs::write(&path, "# Progress\n\n- hand edited").expect("write");
        append_entry(&path, "- next").expect("append");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "# Progress\n\n- hand edited\n- next\n"
        );
    }

    #[test]
    fn archive_names_file_by_time_and_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut t = task("T9");
        t.status = TaskStatus::Done;
        let at = Utc.with_ymd_and_hms(2025, 6, 7, 8, 9, 10).unwrap();
        let path = archive_task_at(temp.path(), &t, at).expect("archive");
        assert!(path.ends_with("20250607T080910Z-T9.yaml"));
        let back: Task = serde_yaml::from_str(&fs::read_to_string(&path).expect("read"))
            .expect("parse");
        assert_eq!(back, t);
    }
}
