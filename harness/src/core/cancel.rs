//! Cooperative cancellation shared by every blocking call in a run.
//!
//! A [`CancelToken`] is a shared flag plus an optional deadline. Child tokens
//! share the flag but may carry a tighter deadline, so cancelling the run
//! cancels the in-flight attempt while each attempt still gets its own budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token sharing this token's flag, expiring after `timeout`
    /// (or at the parent's deadline, whichever comes first).
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancelled explicitly or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Error out early if the token has already fired.
    pub fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(anyhow!("cancelled"));
        }
        if self.remaining().is_some_and(|left| left.is_zero()) {
            return Err(anyhow!("cancelled: deadline exceeded"));
        }
        Ok(())
    }
}
