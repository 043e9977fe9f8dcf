use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, RedubError};

/// State of one pipeline run, passed explicitly to every stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub input: PathBuf,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new<P: AsRef<Path>>(input: P) -> Self {
        Self::with_run_id(input, Uuid::new_v4().to_string())
    }

    pub fn with_run_id<P: AsRef<Path>, S: Into<String>>(input: P, run_id: S) -> Self {
        Self {
            run_id: run_id.into(),
            input: input.as_ref().to_path_buf(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token shared with the worker pool; cancelling it aborts the whole run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`RedubError::Cancelled`] once the run has been cancelled.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RedubError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared_with_clones() {
        let ctx = RunContext::with_run_id("input.mp4", "run-1");
        let token = ctx.cancellation_token();
        let clone = ctx.clone();

        assert!(ctx.ensure_active().is_ok());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(ctx.ensure_active(), Err(RedubError::Cancelled)));
    }

    #[test]
    fn test_generated_run_ids_are_unique() {
        let a = RunContext::new("a.mp4");
        let b = RunContext::new("a.mp4");
        assert_ne!(a.run_id, b.run_id);
    }
}
