//! Bounded reader→writer handoff for one copy item.
//!
//! One pipe serves exactly one item and is discarded after use. Producers are
//! the item's reader tasks; the single consumer is its writer loop. The pipe
//! is FIFO, so a page's batch id at retrieval always matches the batch id the
//! writer later marks complete.

use crate::context::{CopyContext, RunState};
use crate::core::{CopyItem, Page};
use crate::error::{CopyError, Result};
use crate::repository::TaskRepository;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// A message travelling through the pipe. Exactly one `Finished` or `Poison`
/// terminates a pipe.
#[derive(Debug, Clone)]
pub enum PipeMessage {
    /// One batch worth of rows.
    Data(Page),
    /// All reader tasks finished; no more data will arrive.
    Finished,
    /// Terminal error; placed to unblock and fail a waiting consumer.
    Poison(String),
}

struct PipeShared {
    tx: async_channel::Sender<PipeMessage>,
    rx: async_channel::Receiver<PipeMessage>,
    timeout: Duration,
    abort: Mutex<Option<String>>,
    run_state: Arc<RunState>,
    repository: Arc<dyn TaskRepository>,
    migration_id: String,
    node_id: i32,
    pipeline_name: String,
    fail_on_error: bool,
}

/// Bounded handoff queue between one item's readers and its writer.
#[derive(Clone)]
pub struct DataPipe {
    shared: Arc<PipeShared>,
}

impl DataPipe {
    pub fn new(ctx: &CopyContext, item: &CopyItem, repository: Arc<dyn TaskRepository>) -> Self {
        let settings = &ctx.config.migration;
        let (tx, rx) = async_channel::bounded(settings.pipe_capacity);
        Self {
            shared: Arc::new(PipeShared {
                tx,
                rx,
                timeout: Duration::from_secs(settings.pipe_timeout_secs),
                abort: Mutex::new(None),
                run_state: Arc::clone(&ctx.run_state),
                repository,
                migration_id: ctx.migration_id.clone(),
                node_id: ctx.node_id,
                pipeline_name: item.pipeline_name(),
                fail_on_error: settings.fail_on_error,
            }),
        }
    }

    /// Install the abort cause. The first caller wins; later calls are no-ops.
    ///
    /// On the first abort this marks the owning task failed, optionally fails
    /// the whole migration (fail-fast), and best-effort enqueues one Poison so
    /// a blocked consumer wakes up.
    pub async fn request_abort(&self, cause: &CopyError) {
        let message = cause.to_string();
        let first = {
            let mut guard = self
                .shared
                .abort
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if guard.is_none() {
                *guard = Some(message.clone());
                true
            } else {
                false
            }
        };
        if !first {
            return;
        }

        if self.shared.fail_on_error {
            self.shared.run_state.request_abort(message.clone());
            if let Err(e) = self
                .shared
                .repository
                .set_status(
                    &self.shared.migration_id,
                    crate::repository::MigrationProgress::Aborted,
                )
                .await
            {
                warn!("could not abort migration: {}", e);
            }
        }

        if let Err(e) = self
            .shared
            .repository
            .mark_task_failed(
                &self.shared.migration_id,
                self.shared.node_id,
                &self.shared.pipeline_name,
                &message,
            )
            .await
        {
            warn!("could not update error status: {}", e);
        }

        if self.shared.tx.try_send(PipeMessage::Poison(message)).is_err() {
            warn!(
                "could not flush pipe for {} with poison",
                self.shared.pipeline_name
            );
        }
    }

    /// Push a message, blocking up to the pipe timeout.
    pub async fn put(&self, message: PipeMessage) -> Result<()> {
        self.check_aborted().await?;
        match timeout(self.shared.timeout, self.shared.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CopyError::transfer(
                &self.shared.pipeline_name,
                "pipe closed",
            )),
            Err(_) => Err(CopyError::PipeTimeout(
                "cannot put new item in time; raise migration.pipe_timeout_secs or migration.pipe_capacity".into(),
            )),
        }
    }

    /// Pop the next message, blocking up to the pipe timeout.
    pub async fn get(&self) -> Result<PipeMessage> {
        self.check_aborted().await?;
        let message = match timeout(self.shared.timeout, self.shared.rx.recv()).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                return Err(CopyError::transfer(
                    &self.shared.pipeline_name,
                    "pipe closed",
                ))
            }
            Err(_) => {
                return Err(CopyError::PipeTimeout(
                    "cannot get new item in time; raise migration.pipe_timeout_secs or migration.pipe_capacity".into(),
                ))
            }
        };
        self.check_aborted().await?;
        Ok(message)
    }

    /// Whether an abort has been requested for this pipe or the whole run.
    /// Self-aborts when the migration was aborted elsewhere.
    async fn check_aborted(&self) -> Result<()> {
        let local = self
            .shared
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if local.is_none() && self.shared.run_state.is_aborted() {
            self.request_abort(&CopyError::aborted("Migration aborted"))
                .await;
        }
        let aborted = self
            .shared
            .abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match aborted {
            Some(reason) => Err(CopyError::PipeAborted(reason)),
            None => Ok(()),
        }
    }
}
