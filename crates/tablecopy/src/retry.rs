//! Bounded retry for one unit of work.

use crate::error::{CopyError, Result};
use std::future::Future;
use tracing::error;

/// How a retriable unit of work ended.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The work succeeded, possibly after retries.
    Success,
    /// The work hit an abort signal; it was not retried.
    Aborted(CopyError),
    /// The work failed on every attempt.
    Failed(CopyError),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }

    /// The terminal error, if any.
    pub fn into_error(self) -> Option<CopyError> {
        match self {
            TaskOutcome::Success => None,
            TaskOutcome::Aborted(e) | TaskOutcome::Failed(e) => Some(e),
        }
    }
}

/// Run one unit of work with bounded retries.
///
/// An abort-signal error propagates on first occurrence. Any other failure is
/// retried up to `max_retry_attempts` more times; a permanently failing unit
/// is attempted `max_retry_attempts + 1` times in total. The outcome is
/// reported, never panicked, so the owning worker pool keeps processing other
/// items. The retry count is local to this invocation.
pub async fn run_retriable<F, Fut>(label: &str, max_retry_attempts: u32, mut work: F) -> TaskOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut retry_count = 0u32;
    loop {
        match work().await {
            Ok(()) => return TaskOutcome::Success,
            Err(e) if e.is_abort() => return TaskOutcome::Aborted(e),
            Err(e) => {
                if retry_count < max_retry_attempts {
                    error!(
                        "Retrying failed task for {}. Retry count: {}. Cause: {}",
                        label, retry_count, e
                    );
                    retry_count += 1;
                } else {
                    return TaskOutcome::Failed(e);
                }
            }
        }
    }
}
