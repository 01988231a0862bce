//! Sortable run identifiers: `YYYYMMDD-HHMMSS-xxxx`.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local, TimeZone};
use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;

const SUFFIX_LEN: usize = 4;

static RUN_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{8}-\d{6}-[a-z0-9]{4}$").expect("run id pattern is valid")
});

/// Generate a new run id from the local clock plus a random suffix.
pub fn generate_run_id() -> String {
    format_run_id(&Local::now(), &random_suffix())
}

/// Check that `id` has the shape produced by [`generate_run_id`].
pub fn validate_run_id(id: &str) -> Result<()> {
    if RUN_ID_RE.is_match(id) {
        return Ok(());
    }
    Err(anyhow!(
        "invalid run id '{id}' (expected YYYYMMDD-HHMMSS-xxxx)"
    ))
}

fn format_run_id<Tz: TimeZone>(at: &DateTime<Tz>, suffix: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}-{suffix}", at.format("%Y%m%d-%H%M%S"))
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
