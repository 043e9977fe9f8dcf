//! Bounded worker pool for per-utterance collaborator calls.
//!
//! Admission blocks on a fixed number of permits, every call runs under a
//! timeout, failed or timed-out calls are retried up to `max_attempts`, and
//! results come back in input order regardless of completion order.

use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RedubError};

/// Result of one pooled task after all attempts.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed { value: T, attempts: u32 },
    Failed { error: RedubError, attempts: u32, timed_out: bool },
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
    max_attempts: u32,
    cancel: CancellationToken,
    show_progress: bool,
}

impl WorkerPool {
    pub fn new(size: usize, max_attempts: u32, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            max_attempts: max_attempts.max(1),
            cancel,
            show_progress: false,
        }
    }

    /// Draw an indicatif bar for each pooled stage
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg:<14} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(label.to_string());
        pb
    }

    /// Run `task` over every item with bounded concurrency.
    ///
    /// Returns `Err(Cancelled)` if the run is cancelled while tasks are
    /// pending; in-flight tasks are aborted.
    pub async fn run<I, T, F, Fut>(
        &self,
        label: &str,
        items: Vec<I>,
        timeout: Duration,
        task: F,
    ) -> Result<Vec<TaskOutcome<T>>>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(RedubError::Cancelled);
        }

        let total = items.len();
        let progress = self.progress_bar(total, label);
        let task = Arc::new(task);
        let mut set = JoinSet::new();

        debug!("{}: scheduling {} tasks on {} workers", label, total, self.size);

        for (index, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| RedubError::Cancelled)?
                }
                _ = self.cancel.cancelled() => {
                    set.abort_all();
                    progress.abandon();
                    return Err(RedubError::Cancelled);
                }
            };

            let task = task.clone();
            let cancel = self.cancel.clone();
            let max_attempts = self.max_attempts;
            let progress = progress.clone();
            set.spawn(async move {
                let _permit = permit;
                let outcome = attempt_with_retries(task.as_ref(), item, timeout, max_attempts, &cancel).await;
                progress.inc(1);
                (index, outcome)
            });
        }

        let mut results: Vec<Option<TaskOutcome<T>>> = (0..total).map(|_| None).collect();
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((index, outcome))) => results[index] = Some(outcome),
                    Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Some(Err(_)) => {
                        set.abort_all();
                        progress.abandon();
                        return Err(RedubError::Cancelled);
                    }
                },
                _ = self.cancel.cancelled() => {
                    set.abort_all();
                    progress.abandon();
                    return Err(RedubError::Cancelled);
                }
            }
        }
        progress.finish_and_clear();

        if self.cancel.is_cancelled() {
            return Err(RedubError::Cancelled);
        }

        Ok(results
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or(TaskOutcome::Failed {
                    error: RedubError::Cancelled,
                    attempts: 0,
                    timed_out: false,
                })
            })
            .collect())
    }
}

async fn attempt_with_retries<I, T, F, Fut>(
    task: &F,
    item: I,
    timeout: Duration,
    max_attempts: u32,
    cancel: &CancellationToken,
) -> TaskOutcome<T>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut timed_out = false;
    let mut last_error = None;

    while attempts < max_attempts {
        attempts += 1;

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, task(item.clone())) => result,
            _ = cancel.cancelled() => {
                return TaskOutcome::Failed { error: RedubError::Cancelled, attempts, timed_out };
            }
        };

        match result {
            Ok(Ok(value)) => return TaskOutcome::Completed { value, attempts },
            Ok(Err(e)) if !e.is_transient() => {
                return TaskOutcome::Failed { error: e, attempts, timed_out };
            }
            Ok(Err(e)) => {
                warn!("Attempt {}/{} failed: {}", attempts, max_attempts, e);
                last_error = Some(e);
            }
            Err(_) => {
                warn!("Attempt {}/{} timed out after {:?}", attempts, max_attempts, timeout);
                timed_out = true;
                last_error = Some(RedubError::Timeout(timeout.as_secs()));
            }
        }
    }

    TaskOutcome::Failed {
        error: last_error.unwrap_or(RedubError::Timeout(timeout.as_secs())),
        attempts,
        timed_out,
    }
}
