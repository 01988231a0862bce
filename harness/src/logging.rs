//! Diagnostic tracing for harness runs.
//!
//! Tracing goes to stderr and is not persisted. Durable records of a run live
//! in `.harness/runs/<run-id>/` (see [`crate::io::artifacts`]) and are written
//! regardless of `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "harness=info";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to [`DEFAULT_FILTER`]. Output: stderr, compact.
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug harness run
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
