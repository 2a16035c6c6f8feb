//! Writer strategy: drain one item's pipe and commit batched pages.

use crate::context::CopyContext;
use crate::core::{ColumnMeta, CopyItem, Page, SqlNullType, SqlValue};
use crate::dialect::{BatchRef, DialectRepository, PageCommit};
use crate::error::{CopyError, Result};
use crate::pipe::{DataPipe, PipeMessage};
use crate::repository::TaskRepository;
use crate::retry::run_retriable;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Immutable state shared by the writer workers of one item.
struct WriterContext {
    migration_id: String,
    node_id: i32,
    item: CopyItem,
    /// Source columns to copy, exclusions already applied.
    columns: Vec<ColumnMeta>,
    nullify: HashSet<String>,
    upsert_key: Option<String>,
    /// Cumulative committed row count for the item.
    total_count: AtomicI64,
    run_state: Arc<crate::context::RunState>,
}

/// Drain the pipe for one item, dispatching each page to a bounded writer
/// worker pool, and wait for every outstanding page write before returning.
///
/// At-most-once write semantics hold in incremental (upsert) mode; with plain
/// INSERT they rely on truncate-before-write or an otherwise-empty target,
/// because a page retried after a commit-side failure is re-executed whole.
pub async fn write(
    ctx: &CopyContext,
    source: Arc<dyn DialectRepository>,
    target_dialect: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    pipe: DataPipe,
    item: &CopyItem,
) -> Result<()> {
    let settings = &ctx.config.migration;
    let pipeline = item.pipeline_name();
    let target = item.target_table.clone();

    let excluded: HashSet<String> = settings.excluded_columns_for(&target).into_iter().collect();
    if !excluded.is_empty() {
        info!("Ignoring excluded column(s) for {}: {:?}", target, excluded);
    }
    let nullify: HashSet<String> = settings.nullify_columns_for(&target).into_iter().collect();
    if !nullify.is_empty() {
        info!("Nullify column(s) for {}: {:?}", target, nullify);
    }

    // Column list comes from the source side; values land on the target side.
    let columns: Vec<ColumnMeta> = source
        .column_metadata(&item.source_table)
        .await?
        .into_iter()
        .filter(|c| !excluded.contains(&c.name.to_ascii_lowercase()))
        .collect();
    if columns.is_empty() {
        return Err(CopyError::Config(format!(
            "{pipeline}: source has no columns or all columns excluded"
        )));
    }

    let result = drain_pipe(ctx, &target_dialect, &repository, &pipe, item, columns, nullify).await;

    if let Err(e) = &result {
        pipe.request_abort(e).await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drain_pipe(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    repository: &Arc<dyn TaskRepository>,
    pipe: &DataPipe,
    item: &CopyItem,
    columns: Vec<ColumnMeta>,
    nullify: HashSet<String>,
) -> Result<()> {
    let settings = &ctx.config.migration;
    let pipeline = item.pipeline_name();
    let target = item.target_table.clone();
    let writer_workers = settings.get_writer_workers();
    let max_retry_attempts = settings.max_retry_attempts;

    // Progress continues from the persisted count so a resumed run reports
    // the true cumulative total.
    let previous_count = repository
        .find_pipeline(&ctx.migration_id, ctx.node_id, &pipeline)
        .await?
        .map(|t| t.target_row_count)
        .unwrap_or(0);

    let (page_tx, page_rx) = async_channel::bounded::<Page>(writer_workers * 2);
    // Handed to the workers on first page; once every worker is gone the
    // channel closes and a blocked dispatch fails instead of hanging.
    let mut page_rx = Some(page_rx);
    let mut workers: JoinSet<Result<()>> = JoinSet::new();

    let mut writer_ctx: Option<Arc<WriterContext>> = None;
    let mut indexes_disabled = false;

    let finished = loop {
        let message = match pipe.get().await {
            Ok(message) => message,
            Err(e) => break Err(e),
        };
        match message {
            PipeMessage::Poison(reason) => {
                break Err(CopyError::transfer(
                    &pipeline,
                    format!("poison received; dying. Cause: {reason}"),
                ));
            }
            PipeMessage::Finished => break Ok(()),
            PipeMessage::Data(page) => {
                if writer_ctx.is_none() {
                    let shared = match first_page_setup(
                        ctx,
                        dialect,
                        repository,
                        item,
                        &columns,
                        &nullify,
                        previous_count,
                    )
                    .await
                    {
                        Ok((shared, disabled)) => {
                            indexes_disabled = disabled;
                            shared
                        }
                        Err(e) => break Err(e),
                    };
                    writer_ctx = Some(Arc::clone(&shared));

                    if let Some(page_rx) = page_rx.take() {
                        for _ in 0..writer_workers {
                            workers.spawn(writer_worker(
                                Arc::clone(&shared),
                                Arc::clone(dialect),
                                Arc::clone(repository),
                                pipe.clone(),
                                page_rx.clone(),
                                max_retry_attempts,
                            ));
                        }
                    }
                }
                if !page.is_empty() && page_tx.send(page).await.is_err() {
                    break Err(CopyError::transfer(&pipeline, "writer pool closed"));
                }
            }
        }
    };

    // No more dispatches; let the workers drain and stop.
    drop(page_tx);
    let mut result = finished;
    while let Some(joined) = workers.join_next().await {
        let worker_result = joined
            .map_err(|e| CopyError::transfer(&pipeline, format!("writer task panicked: {e}")))?;
        if let Err(e) = worker_result {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    if indexes_disabled {
        dialect.enable_indexes(&target).await?;
    }

    if let Some(shared) = &writer_ctx {
        repository
            .update_task_progress(
                &ctx.migration_id,
                ctx.node_id,
                &pipeline,
                shared.total_count.load(Ordering::SeqCst),
            )
            .await?;
    }

    result
}

/// First page only: prepare the target, pick the upsert key and build the
/// worker-shared context.
async fn first_page_setup(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    repository: &Arc<dyn TaskRepository>,
    item: &CopyItem,
    columns: &[ColumnMeta],
    nullify: &HashSet<String>,
    previous_count: i64,
) -> Result<(Arc<WriterContext>, bool)> {
    let settings = &ctx.config.migration;
    let pipeline = item.pipeline_name();

    let truncated = prepare_target(ctx, dialect, repository, item).await?;
    let indexes_disabled = toggle_indexes_off(ctx, dialect, &item.target_table).await?;

    let upsert_key = if settings.incremental_enabled {
        Some(determine_upsert_key(columns).ok_or_else(|| {
            CopyError::Config(format!(
                "{pipeline}: incremental mode needs an identifier column like PK or ID"
            ))
        })?)
    } else {
        None
    };

    let shared = Arc::new(WriterContext {
        migration_id: ctx.migration_id.clone(),
        node_id: ctx.node_id,
        item: item.clone(),
        columns: columns.to_vec(),
        nullify: nullify.clone(),
        upsert_key,
        total_count: AtomicI64::new(if truncated { 0 } else { previous_count }),
        run_state: Arc::clone(&ctx.run_state),
    });
    Ok((shared, indexes_disabled))
}

/// One writer worker: commit pages from the queue until it closes.
async fn writer_worker(
    shared: Arc<WriterContext>,
    dialect: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    pipe: DataPipe,
    page_rx: async_channel::Receiver<Page>,
    max_retry_attempts: u32,
) -> Result<()> {
    while let Ok(page) = page_rx.recv().await {
        let outcome = run_retriable(&shared.item.target_table, max_retry_attempts, || {
            process_page(&shared, &dialect, &repository, page.clone())
        })
        .await;
        if let Some(e) = outcome.into_error() {
            pipe.request_abort(&e).await;
            return Err(e);
        }
    }
    Ok(())
}

/// Commit one page: map columns, build the batched statement through the
/// dialect, and delete the batch descriptor in the same transaction.
async fn process_page(
    shared: &WriterContext,
    dialect: &Arc<dyn DialectRepository>,
    repository: &Arc<dyn TaskRepository>,
    page: Page,
) -> Result<()> {
    let pipeline = shared.item.pipeline_name();
    let rows = map_rows(shared, &page)?;
    let row_count = rows.len() as i64;

    let written = dialect
        .commit_page(PageCommit {
            target_table: shared.item.target_table.clone(),
            columns: shared.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            upsert_key: shared.upsert_key.clone(),
            batch: Some(BatchRef {
                migration_id: shared.migration_id.clone(),
                pipeline_name: pipeline.clone(),
                batch_id: page.batch_id,
            }),
        })
        .await?;
    debug!(
        "Batch {} written ({} rows) for {}",
        page.batch_id, written, pipeline
    );

    let total = shared.total_count.fetch_add(row_count, Ordering::SeqCst) + row_count;
    shared.run_state.add_rows_copied(row_count);
    repository
        .update_task_progress(&shared.migration_id, shared.node_id, &pipeline, total)
        .await?;
    Ok(())
}

/// Apply per-column rules to every row of a page: nullify wins, then fixed
/// overrides, then the source value.
fn map_rows(shared: &WriterContext, page: &Page) -> Result<Vec<Vec<SqlValue>>> {
    let pipeline = shared.item.pipeline_name();

    // Page column order can differ from the copy column list; map by name.
    let indices: Vec<Option<usize>> = shared
        .columns
        .iter()
        .map(|c| page.column_index(&c.name))
        .collect();

    let mut mapped = Vec::with_capacity(page.rows.len());
    for row in &page.rows {
        let mut values = Vec::with_capacity(shared.columns.len());
        for (column, index) in shared.columns.iter().zip(&indices) {
            let value = if shared.nullify.contains(&column.name.to_ascii_lowercase()) {
                SqlValue::Null(null_type_for(column))
            } else if let Some(fixed) = shared.item.override_for(&column.name) {
                SqlValue::Text(fixed.to_string())
            } else {
                let index = index.ok_or_else(|| {
                    CopyError::transfer(
                        &pipeline,
                        format!("source page lacks column {}", column.name),
                    )
                })?;
                row[index].clone()
            };
            values.push(value);
        }
        mapped.push(values);
    }
    Ok(mapped)
}

/// First-page target preparation: truncate when configured and not already
/// done by an earlier, interrupted run. Returns whether a truncate ran.
async fn prepare_target(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    repository: &Arc<dyn TaskRepository>,
    item: &CopyItem,
) -> Result<bool> {
    let settings = &ctx.config.migration;
    let pipeline = item.pipeline_name();

    if settings.resume_enabled {
        let task = repository
            .find_pipeline(&ctx.migration_id, ctx.node_id, &pipeline)
            .await?;
        if task.map(|t| t.truncated).unwrap_or(false) {
            return Ok(false);
        }
    }

    if !settings.truncate_enabled {
        return Ok(false);
    }

    if settings.is_truncate_excluded(&item.target_table) {
        repository
            .mark_task_truncated(&ctx.migration_id, ctx.node_id, &pipeline)
            .await?;
        return Ok(false);
    }

    if settings.incremental_enabled {
        return Err(CopyError::Config(
            "truncating tables in incremental mode is illegal; set migration.truncate_enabled to false".into(),
        ));
    }

    dialect.truncate_table(&item.target_table).await?;
    repository
        .mark_task_truncated(&ctx.migration_id, ctx.node_id, &pipeline)
        .await?;
    Ok(true)
}

/// Drop or disable target indexes before the first page. Returns whether
/// they must be re-enabled after the copy.
async fn toggle_indexes_off(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    target: &str,
) -> Result<bool> {
    let settings = &ctx.config.migration;
    if settings.drop_all_indexes {
        debug!("Dropping indexes for table '{}'", target);
        dialect.drop_indexes(target).await?;
        return Ok(false);
    }
    if settings.disable_indexes_for(target) {
        debug!("Disabling indexes for table '{}'", target);
        dialect.disable_indexes(target).await?;
        return Ok(true);
    }
    Ok(false)
}

/// Incremental mode merges on `PK` when present, else `ID`.
fn determine_upsert_key(columns: &[ColumnMeta]) -> Option<String> {
    columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case("PK"))
        .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case("ID")))
        .map(|c| c.name.clone())
}

fn null_type_for(column: &ColumnMeta) -> SqlNullType {
    match column.type_code.as_str() {
        "boolean" | "bool" => SqlNullType::Bool,
        "smallint" | "int2" => SqlNullType::I16,
        "integer" | "int" | "int4" => SqlNullType::I32,
        "bigint" | "int8" => SqlNullType::I64,
        "real" | "float4" => SqlNullType::F32,
        "double precision" | "float8" => SqlNullType::F64,
        "bytea" | "varbinary" => SqlNullType::Bytes,
        "uuid" => SqlNullType::Uuid,
        "numeric" | "decimal" => SqlNullType::Decimal,
        "timestamp" | "timestamp without time zone" => SqlNullType::DateTime,
        "timestamptz" | "timestamp with time zone" => SqlNullType::DateTimeOffset,
        "date" => SqlNullType::Date,
        "time" => SqlNullType::Time,
        _ => SqlNullType::Text,
    }
}
