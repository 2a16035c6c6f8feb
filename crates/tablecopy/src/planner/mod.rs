//! Batch planning: strategy selection and batch descriptor construction.

pub mod reader;

use crate::context::CopyContext;
use crate::core::{CopyItem, SqlValue};
use crate::dialect::{DialectRepository, MarkersQuery};
use crate::error::Result;
use crate::repository::{CopyBatch, TaskRepository};
use std::sync::Arc;
use tracing::{debug, warn};

/// How a table's rows are batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMethod {
    /// Seek by ordered key-column values.
    Seek,
    /// Offset pagination over a unique column ordering.
    Offset,
    /// One unbounded batch covering the whole table.
    Default,
}

impl CopyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyMethod::Seek => "SEEK",
            CopyMethod::Offset => "OFFSET",
            CopyMethod::Default => "DEFAULT",
        }
    }
}

/// One planned batch. Boundaries are persisted as text until the writer
/// confirms completion; the set of persisted descriptors is exactly the
/// pending work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub batch_id: u32,
    pub lower: String,
    pub upper: Option<String>,
}

/// The plan for one copy item.
#[derive(Debug, Clone)]
pub struct CopyPlan {
    pub method: CopyMethod,
    /// Seek key column, when the method is seek.
    pub key_column: Option<String>,
    /// Unique ordering columns, when the method is offset.
    pub order_columns: Vec<String>,
    pub batches: Vec<BatchDescriptor>,
}

/// Plan the batches for one item and register them as pending work.
///
/// Strategy priority: seek on `ID` for audit tables carrying that column,
/// else seek on `PK`; else offset pagination over a discovered unique column
/// set; else a single unbounded batch. When resume is enabled and pending
/// descriptors exist, the batch list is rebuilt from those records instead of
/// recomputed, then cleared and re-registered.
pub async fn plan_item(
    ctx: &CopyContext,
    dialect: &Arc<dyn DialectRepository>,
    repository: &Arc<dyn TaskRepository>,
    item: &CopyItem,
) -> Result<CopyPlan> {
    let settings = &ctx.config.migration;
    let table = &item.source_table;
    let pipeline = item.pipeline_name();
    let page_size = settings.get_page_size();
    let columns = dialect.all_column_names(table).await?;

    let find_column = |name: &str| {
        columns
            .iter()
            .find(|c| c.eq_ignore_ascii_case(name))
            .cloned()
    };
    let batch_column = if settings.is_audit_table(table) {
        find_column("ID")
    } else {
        None
    }
    .or_else(|| find_column("PK"));
    debug!(
        "Using batch column for {}: {}",
        pipeline,
        batch_column.as_deref().unwrap_or("NONE")
    );

    let resumed = if settings.resume_enabled {
        let pending = repository
            .find_pending_batches(&ctx.migration_id, &pipeline)
            .await?;
        if pending.is_empty() {
            None
        } else {
            repository
                .reset_pipeline_batches(&ctx.migration_id, &pipeline)
                .await?;
            Some(pending)
        }
    } else {
        None
    };

    let plan = if let Some(key_column) = batch_column {
        repository
            .update_task_copy_method(
                &ctx.migration_id,
                ctx.node_id,
                &pipeline,
                CopyMethod::Seek.as_str(),
            )
            .await?;
        repository
            .update_task_key_columns(
                &ctx.migration_id,
                ctx.node_id,
                &pipeline,
                std::slice::from_ref(&key_column),
            )
            .await?;

        let markers: Vec<String> = match &resumed {
            Some(pending) => pending.iter().map(|b| b.lower_boundary.clone()).collect(),
            None => dialect
                .batch_markers(&MarkersQuery {
                    table: table.clone(),
                    column: key_column.clone(),
                    page_size,
                })
                .await?
                .iter()
                .map(SqlValue::to_boundary)
                .collect(),
        };

        // Adjacent markers form half-open ranges; the last range is open.
        let batches = markers
            .iter()
            .enumerate()
            .map(|(i, lower)| BatchDescriptor {
                batch_id: i as u32,
                lower: lower.clone(),
                upper: markers.get(i + 1).cloned(),
            })
            .collect();

        CopyPlan {
            method: CopyMethod::Seek,
            key_column: Some(key_column),
            order_columns: Vec::new(),
            batches,
        }
    } else {
        let unique_columns = dialect.unique_columns(table).await?;
        if !unique_columns.is_empty() {
            repository
                .update_task_copy_method(
                    &ctx.migration_id,
                    ctx.node_id,
                    &pipeline,
                    CopyMethod::Offset.as_str(),
                )
                .await?;
            repository
                .update_task_key_columns(&ctx.migration_id, ctx.node_id, &pipeline, &unique_columns)
                .await?;

            let total = item.source_row_count.max(0) as u64;
            let offsets: Vec<u64> = match &resumed {
                Some(pending) => pending
                    .iter()
                    .filter_map(|b| b.lower_boundary.parse().ok())
                    .collect(),
                None => (0..total).step_by(page_size.max(1)).collect(),
            };

            let batches = offsets
                .iter()
                .enumerate()
                .map(|(i, offset)| BatchDescriptor {
                    batch_id: i as u32,
                    lower: offset.to_string(),
                    upper: Some((offset + page_size as u64).min(total.max(*offset)).to_string()),
                })
                .collect();

            CopyPlan {
                method: CopyMethod::Offset,
                key_column: None,
                order_columns: unique_columns,
                batches,
            }
        } else {
            warn!(
                "Reading all rows of {} at once without batching; memory consumption may suffer",
                table
            );
            repository
                .update_task_copy_method(
                    &ctx.migration_id,
                    ctx.node_id,
                    &pipeline,
                    CopyMethod::Default.as_str(),
                )
                .await?;
            CopyPlan {
                method: CopyMethod::Default,
                key_column: None,
                order_columns: Vec::new(),
                batches: vec![BatchDescriptor {
                    batch_id: 0,
                    lower: "0".into(),
                    upper: Some(item.source_row_count.max(0).to_string()),
                }],
            }
        }
    };

    // Register the planned batches; they stay persisted until the writer
    // commits each one.
    for batch in &plan.batches {
        repository
            .schedule_batch(&CopyBatch {
                migration_id: ctx.migration_id.clone(),
                pipeline_name: pipeline.clone(),
                batch_id: batch.batch_id,
                lower_boundary: batch.lower.clone(),
                upper_boundary: batch.upper.clone(),
            })
            .await?;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyConfig;
    use crate::repository::MemoryTaskRepository;
    use crate::testutil::MockDialect;

    fn context(page_size: usize, resume: bool, audit: &[&str]) -> CopyContext {
        let mut config = CopyConfig::from_yaml(
            "source:\n  url: postgres://s\ntarget:\n  url: postgres://t\ntables:\n  - source: users\n",
        )
        .unwrap();
        config.migration.page_size = Some(page_size);
        config.migration.resume_enabled = resume;
        config.migration.audit_tables = audit.iter().map(|s| s.to_string()).collect();
        CopyContext::new("m1", std::sync::Arc::new(config), vec![])
    }

    async fn setup(
        rows: i64,
        key_column: &str,
    ) -> (Arc<MemoryTaskRepository>, Arc<MockDialect>, CopyItem) {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source(key_column, rows);
        let item = CopyItem::new("users", "users").with_row_count(rows);
        repo.schedule_task("m1", &item, rows, 0).await.unwrap();
        (repo, dialect, item)
    }

    #[tokio::test]
    async fn seek_plan_pairs_adjacent_markers() {
        let (repo, dialect, item) = setup(250, "PK").await;
        let ctx = context(100, false, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo.clone();

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();

        assert_eq!(plan.method, CopyMethod::Seek);
        assert_eq!(plan.key_column.as_deref(), Some("PK"));
        // Markers at PK 1, 101, 201 for 250 sequential rows.
        assert_eq!(
            plan.batches,
            vec![
                BatchDescriptor { batch_id: 0, lower: "1".into(), upper: Some("101".into()) },
                BatchDescriptor { batch_id: 1, lower: "101".into(), upper: Some("201".into()) },
                BatchDescriptor { batch_id: 2, lower: "201".into(), upper: None },
            ]
        );

        let pending = repo.find_pending_batches("m1", "users->users").await.unwrap();
        assert_eq!(pending.len(), 3);

        let task = repo.find_pipeline("m1", 0, "users->users").await.unwrap().unwrap();
        assert_eq!(task.copy_method.as_deref(), Some("SEEK"));
        assert_eq!(task.key_columns, vec!["PK".to_string()]);
    }

    #[tokio::test]
    async fn audit_table_prefers_id_column() {
        let (repo, dialect, item) = setup(10, "ID").await;
        let ctx = context(100, false, &["users"]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo;

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();
        assert_eq!(plan.method, CopyMethod::Seek);
        assert_eq!(plan.key_column.as_deref(), Some("ID"));
    }

    #[tokio::test]
    async fn id_column_alone_does_not_trigger_seek_outside_audit_tables() {
        let (repo, dialect, item) = setup(10, "ID").await;
        dialect.set_unique_columns(&["ID"]);
        let ctx = context(100, false, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo;

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();
        assert_eq!(plan.method, CopyMethod::Offset);
    }

    #[tokio::test]
    async fn offset_plan_partitions_the_row_domain() {
        // 250 rows, page size 100, no seek key: offsets 0/100/200 with the
        // last range clamped to the row count.
        let (repo, dialect, item) = setup(250, "code").await;
        dialect.set_unique_columns(&["code"]);
        let ctx = context(100, false, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo.clone();

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();

        assert_eq!(plan.method, CopyMethod::Offset);
        assert_eq!(plan.order_columns, vec!["code".to_string()]);
        assert_eq!(
            plan.batches,
            vec![
                BatchDescriptor { batch_id: 0, lower: "0".into(), upper: Some("100".into()) },
                BatchDescriptor { batch_id: 1, lower: "100".into(), upper: Some("200".into()) },
                BatchDescriptor { batch_id: 2, lower: "200".into(), upper: Some("250".into()) },
            ]
        );

        let task = repo.find_pipeline("m1", 0, "users->users").await.unwrap().unwrap();
        assert_eq!(task.copy_method.as_deref(), Some("OFFSET"));
    }

    #[tokio::test]
    async fn fallback_is_one_unbounded_batch() {
        let (repo, dialect, item) = setup(250, "code").await;
        let ctx = context(100, false, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo.clone();

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();

        assert_eq!(plan.method, CopyMethod::Default);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].lower, "0");
        assert_eq!(plan.batches[0].upper.as_deref(), Some("250"));

        let task = repo.find_pipeline("m1", 0, "users->users").await.unwrap().unwrap();
        assert_eq!(task.copy_method.as_deref(), Some("DEFAULT"));
    }

    #[tokio::test]
    async fn resume_rebuilds_only_pending_batches() {
        let (repo, dialect, item) = setup(250, "code").await;
        dialect.set_unique_columns(&["code"]);

        // Two batches survived a previous interrupted run; batch 0 committed.
        for (id, lower) in [(1u32, "100"), (2u32, "200")] {
            repo.schedule_batch(&CopyBatch {
                migration_id: "m1".into(),
                pipeline_name: "users->users".into(),
                batch_id: id,
                lower_boundary: lower.into(),
                upper_boundary: Some(format!("{}", lower.parse::<u64>().unwrap() + 100)),
            })
            .await
            .unwrap();
        }

        let ctx = context(100, true, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo.clone();

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();

        let lowers: Vec<&str> = plan.batches.iter().map(|b| b.lower.as_str()).collect();
        assert_eq!(lowers, vec!["100", "200"]);

        // The pending records were cleared and re-registered.
        let pending = repo.find_pending_batches("m1", "users->users").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].lower_boundary, "100");
    }

    #[tokio::test]
    async fn resume_with_no_pending_batches_plans_fresh() {
        let (repo, dialect, item) = setup(50, "PK").await;
        let ctx = context(100, true, &[]);
        let dialect: Arc<dyn DialectRepository> = dialect;
        let repo_dyn: Arc<dyn TaskRepository> = repo;

        let plan = plan_item(&ctx, &dialect, &repo_dyn, &item).await.unwrap();
        assert_eq!(plan.method, CopyMethod::Seek);
        assert_eq!(plan.batches.len(), 1);
    }
}
