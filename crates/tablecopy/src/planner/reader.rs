//! Reader tasks: fill one item's pipe from planned batches.

use super::{plan_item, CopyMethod, CopyPlan};
use crate::context::CopyContext;
use crate::core::{CopyItem, SqlValue};
use crate::dialect::{DialectRepository, OffsetQuery, SeekQuery};
use crate::error::{CopyError, Result};
use crate::pipe::{DataPipe, PipeMessage};
use crate::repository::TaskRepository;
use crate::retry::{run_retriable, TaskOutcome};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

/// Plan the item and run its reader tasks, pushing pages into the pipe.
///
/// Returns immediately; the returned handle resolves once the pipe has been
/// terminated with `Finished` or poisoned. One reader task runs per batch,
/// bounded by the reader pool size.
pub fn spawn_readers(
    ctx: &CopyContext,
    dialect: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    pipe: DataPipe,
    item: CopyItem,
) -> JoinHandle<()> {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let plan = match plan_item(&ctx, &dialect, &repository, &item).await {
            Ok(plan) => plan,
            Err(e) => {
                error!("Error preparing reader tasks for {}: {}", item.pipeline_name(), e);
                pipe.request_abort(&e).await;
                return;
            }
        };

        if let Err(e) = run_batches(&ctx, &dialect, &pipe, &item, plan).await {
            pipe.request_abort(&e).await;
        }
    })
}

async fn run_batches(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    pipe: &DataPipe,
    item: &CopyItem,
    plan: CopyPlan,
) -> Result<()> {
    let settings = &ctx.config.migration;
    let semaphore = Arc::new(Semaphore::new(settings.get_reader_workers()));
    let max_retry_attempts = settings.max_retry_attempts;
    let page_size = settings.get_page_size();
    let pipeline = item.pipeline_name();

    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
    let plan = Arc::new(plan);

    for batch in plan.batches.clone() {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CopyError::transfer(&pipeline, "reader pool closed"))?;
        let dialect = Arc::clone(dialect);
        let pipe = pipe.clone();
        let plan = Arc::clone(&plan);
        let table = item.source_table.clone();
        let label = pipeline.clone();

        tasks.spawn(async move {
            let _permit = permit;
            debug!("Reading batch {} of {}", batch.batch_id, label);
            run_retriable(&label, max_retry_attempts, || {
                let dialect = Arc::clone(&dialect);
                let pipe = pipe.clone();
                let plan = Arc::clone(&plan);
                let batch = batch.clone();
                let table = table.clone();
                async move {
                    let page = match plan.method {
                        CopyMethod::Seek => {
                            let column = plan
                                .key_column
                                .clone()
                                .ok_or_else(|| CopyError::Config("seek plan without key".into()))?;
                            dialect
                                .seek_page(&SeekQuery {
                                    table,
                                    column,
                                    lower: Some(SqlValue::from_boundary(&batch.lower)),
                                    upper: batch
                                        .upper
                                        .as_deref()
                                        .map(SqlValue::from_boundary),
                                    page_size,
                                    batch_id: batch.batch_id,
                                })
                                .await?
                        }
                        CopyMethod::Offset => {
                            let offset = batch.lower.parse().map_err(|_| {
                                CopyError::Config(format!(
                                    "invalid offset boundary: {}",
                                    batch.lower
                                ))
                            })?;
                            dialect
                                .offset_page(&OffsetQuery {
                                    table,
                                    order_columns: plan.order_columns.clone(),
                                    offset,
                                    page_size,
                                    batch_id: batch.batch_id,
                                })
                                .await?
                        }
                        CopyMethod::Default => dialect.full_page(&table, batch.batch_id).await?,
                    };
                    pipe.put(PipeMessage::Data(page)).await
                }
            })
            .await
        });
    }

    let mut first_error: Option<CopyError> = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| CopyError::transfer(&pipeline, format!("reader task panicked: {e}")))?;
        if let Some(e) = outcome.into_error() {
            error!("Reader task for {} failed: {}", pipeline, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => pipe.put(PipeMessage::Finished).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyConfig;
    use crate::repository::MemoryTaskRepository;
    use crate::testutil::MockDialect;

    fn context(page_size: usize) -> CopyContext {
        let mut config = CopyConfig::from_yaml(
            "source:\n  url: postgres://s\ntarget:\n  url: postgres://t\ntables:\n  - source: users\n",
        )
        .unwrap();
        config.migration.page_size = Some(page_size);
        config.migration.pipe_timeout_secs = 5;
        config.migration.max_retry_attempts = 1;
        CopyContext::new("m1", Arc::new(config), vec![])
    }

    #[tokio::test]
    async fn readers_produce_all_pages_then_finish() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("PK", 250);
        let item = CopyItem::new("users", "users").with_row_count(250);
        repo.schedule_task("m1", &item, 250, 0).await.unwrap();

        let ctx = context(100);
        let pipe = DataPipe::new(&ctx, &item, repo.clone() as Arc<dyn TaskRepository>);
        let handle = spawn_readers(
            &ctx,
            dialect as Arc<dyn DialectRepository>,
            repo.clone() as Arc<dyn TaskRepository>,
            pipe.clone(),
            item,
        );

        let mut rows = 0usize;
        let mut pages = 0usize;
        loop {
            match pipe.get().await.unwrap() {
                PipeMessage::Data(page) => {
                    pages += 1;
                    rows += page.row_count();
                }
                PipeMessage::Finished => break,
                PipeMessage::Poison(reason) => panic!("unexpected poison: {reason}"),
            }
        }
        handle.await.unwrap();

        assert_eq!(pages, 3);
        assert_eq!(rows, 250);
    }

    #[tokio::test]
    async fn reader_failure_poisons_the_pipe_and_fails_the_task() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        // Offset plan over a column the source does not have: every read
        // attempt fails until the retries run out.
        dialect.seed_source("PK", 10);
        {
            let mut state = dialect.lock();
            state.source_columns[0].name = "code".into();
        }
        dialect.set_unique_columns(&["missing_column"]);
        let item = CopyItem::new("users", "users").with_row_count(10);
        repo.schedule_task("m1", &item, 10, 0).await.unwrap();

        let ctx = context(100);
        let pipe = DataPipe::new(&ctx, &item, repo.clone() as Arc<dyn TaskRepository>);
        let handle = spawn_readers(
            &ctx,
            dialect as Arc<dyn DialectRepository>,
            repo.clone() as Arc<dyn TaskRepository>,
            pipe.clone(),
            item,
        );
        handle.await.unwrap();

        // The consumer observes the abort, and the task row is failed.
        assert!(pipe.get().await.is_err());
        let task = repo
            .find_pipeline("m1", 0, "users->users")
            .await
            .unwrap()
            .unwrap();
        assert!(task.failure);
    }
}
