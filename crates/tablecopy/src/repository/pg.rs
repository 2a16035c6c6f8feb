//! Database-backed task repository.
//!
//! Stores the copy bookkeeping in the target database so every cluster node
//! sees the same truth and a fresh process can resume a half-finished run.

use super::{CopyBatch, CopyTask, MigrationProgress, MigrationStatus, TaskRepository};
use crate::core::CopyItem;
use crate::error::{CopyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::str::FromStr;
use tokio_postgres::NoTls;
use tracing::debug;

/// Deletes one pending batch row. Shared with the dialect's page commit so
/// the delete runs inside the same transaction as the page write.
pub(crate) const BATCH_DELETE_SQL: &str =
    "DELETE FROM tablecopy_batches WHERE migrationid = $1 AND pipelinename = $2 AND batchid = $3";

const TASK_COLUMNS: &str = "migrationid, targetnodeid, pipelinename, sourcetablename, \
     targettablename, columnmap, sourcerowcount, targetrowcount, duration, failure, error, \
     truncated, copymethod, keycolumns, lastupdate";

/// Task repository persisted in PostgreSQL.
pub struct PgTaskRepository {
    pool: Pool,
}

impl PgTaskRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Connect a repository from a connection string.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let pg_config = tokio_postgres::Config::from_str(url)
            .map_err(|e| CopyError::Config(format!("invalid connection string: {e}")))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| CopyError::pool(e.to_string(), "building repository pool"))?;
        Ok(Self::new(pool))
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        Ok(self.pool.get().await?)
    }

    fn task_from_row(row: &tokio_postgres::Row) -> Result<CopyTask> {
        let column_map: serde_json::Value = row.get("columnmap");
        let key_columns: String = row.get::<_, Option<String>>("keycolumns").unwrap_or_default();
        Ok(CopyTask {
            migration_id: row.get("migrationid"),
            target_node_id: row.get("targetnodeid"),
            pipeline_name: row.get("pipelinename"),
            source_table: row.get("sourcetablename"),
            target_table: row.get("targettablename"),
            column_map: serde_json::from_value(column_map).unwrap_or_default(),
            source_row_count: row.get("sourcerowcount"),
            target_row_count: row.get("targetrowcount"),
            duration: row.get("duration"),
            failure: row.get("failure"),
            error: row.get("error"),
            truncated: row.get("truncated"),
            copy_method: row.get("copymethod"),
            key_columns: if key_columns.is_empty() {
                Vec::new()
            } else {
                key_columns.split(',').map(str::to_string).collect()
            },
            last_update: row.get("lastupdate"),
        })
    }

    fn status_from_row(row: &tokio_postgres::Row) -> Result<MigrationStatus> {
        let status: String = row.get("status");
        Ok(MigrationStatus {
            migration_id: row.get("migrationid"),
            status: MigrationProgress::parse(&status)?,
            total_tasks: row.get("total"),
            completed_tasks: row.get("completed"),
            failed_tasks: row.get("failed"),
            config_hash: row.get("confighash"),
            started_at: row.get("startat"),
            ended_at: row.get("endat"),
            last_update: row.get("lastupdate"),
        })
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<CopyTask>> {
        let client = self.client().await?;
        let rows = client.query(sql, params).await?;
        rows.iter().map(Self::task_from_row).collect()
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    async fn init_schema(&self) -> Result<()> {
        let client = self.client().await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS tablecopy_status (
                    migrationid TEXT PRIMARY KEY,
                    total INTEGER NOT NULL,
                    completed INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    confighash TEXT,
                    status TEXT NOT NULL DEFAULT 'running',
                    startat TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    endat TIMESTAMPTZ,
                    lastupdate TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS tablecopy_tasks (
                    migrationid TEXT NOT NULL,
                    targetnodeid INTEGER NOT NULL,
                    pipelinename TEXT NOT NULL,
                    sourcetablename TEXT NOT NULL,
                    targettablename TEXT NOT NULL,
                    columnmap JSONB NOT NULL DEFAULT '{}'::jsonb,
                    sourcerowcount BIGINT NOT NULL DEFAULT 0,
                    targetrowcount BIGINT NOT NULL DEFAULT 0,
                    duration TEXT,
                    failure BOOLEAN NOT NULL DEFAULT FALSE,
                    error TEXT,
                    truncated BOOLEAN NOT NULL DEFAULT FALSE,
                    copymethod TEXT,
                    keycolumns TEXT,
                    lastupdate TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (migrationid, pipelinename, targetnodeid)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS tablecopy_batches (
                    migrationid TEXT NOT NULL,
                    pipelinename TEXT NOT NULL,
                    batchid INTEGER NOT NULL,
                    lowerboundary TEXT NOT NULL,
                    upperboundary TEXT,
                    PRIMARY KEY (migrationid, pipelinename, batchid)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_tablecopy_tasks_lastupdate
                    ON tablecopy_tasks (migrationid, lastupdate)",
                &[],
            )
            .await?;

        Ok(())
    }

    async fn create_status(
        &self,
        migration_id: &str,
        total_tasks: i32,
        config_hash: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO tablecopy_status (migrationid, total, confighash, status)
                 VALUES ($1, $2, $3, 'running')",
                &[&migration_id, &total_tasks, &config_hash],
            )
            .await?;
        Ok(())
    }

    async fn reset_status(&self, migration_id: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_status
                 SET completed = total - failed, failed = 0, status = 'running', lastupdate = NOW()
                 WHERE migrationid = $1",
                &[&migration_id],
            )
            .await?;
        Ok(())
    }

    async fn transition_status(
        &self,
        migration_id: &str,
        from: MigrationProgress,
        to: MigrationProgress,
    ) -> Result<()> {
        let client = self.client().await?;
        let endat = matches!(to, MigrationProgress::Completed | MigrationProgress::Aborted);
        client
            .execute(
                "UPDATE tablecopy_status
                 SET status = $1,
                     endat = CASE WHEN $2 THEN NOW() ELSE endat END,
                     lastupdate = NOW()
                 WHERE migrationid = $3 AND status = $4",
                &[&to.as_str(), &endat, &migration_id, &from.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn set_status(&self, migration_id: &str, to: MigrationProgress) -> Result<()> {
        let client = self.client().await?;
        let endat = matches!(to, MigrationProgress::Completed | MigrationProgress::Aborted);
        client
            .execute(
                "UPDATE tablecopy_status
                 SET status = $1,
                     endat = CASE WHEN $2 THEN NOW() ELSE endat END,
                     lastupdate = NOW()
                 WHERE migrationid = $3",
                &[&to.as_str(), &endat, &migration_id],
            )
            .await?;
        Ok(())
    }

    async fn update_status_counts(
        &self,
        migration_id: &str,
        completed: i32,
        failed: i32,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_status
                 SET completed = $1, failed = $2, lastupdate = NOW()
                 WHERE migrationid = $3",
                &[&completed, &failed, &migration_id],
            )
            .await?;
        Ok(())
    }

    async fn get_status(&self, migration_id: &str) -> Result<MigrationStatus> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM tablecopy_status WHERE migrationid = $1",
                &[&migration_id],
            )
            .await?
            .ok_or_else(|| {
                CopyError::Config(format!("no status row for migration {migration_id}"))
            })?;
        Self::status_from_row(&row)
    }

    async fn schedule_task(
        &self,
        migration_id: &str,
        item: &CopyItem,
        source_row_count: i64,
        target_node_id: i32,
    ) -> Result<()> {
        let client = self.client().await?;
        let column_map = serde_json::to_value(&item.column_overrides)?;
        client
            .execute(
                "INSERT INTO tablecopy_tasks
                 (migrationid, targetnodeid, pipelinename, sourcetablename, targettablename,
                  columnmap, sourcerowcount, lastupdate)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())",
                &[
                    &migration_id,
                    &target_node_id,
                    &item.pipeline_name(),
                    &item.source_table,
                    &item.target_table,
                    &column_map,
                    &source_row_count,
                ],
            )
            .await?;
        Ok(())
    }

    async fn reschedule_task(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        target_node_id: i32,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET failure = FALSE, duration = NULL, error = NULL,
                     targetnodeid = $1, lastupdate = NOW()
                 WHERE migrationid = $2 AND pipelinename = $3",
                &[&target_node_id, &migration_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn find_pipeline(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<Option<CopyTask>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tablecopy_tasks
                     WHERE migrationid = $1 AND targetnodeid = $2 AND pipelinename = $3"
                ),
                &[&migration_id, &target_node_id, &pipeline_name],
            )
            .await?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn find_pending_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tablecopy_tasks
                 WHERE migrationid = $1 AND targetnodeid = $2 AND duration IS NULL
                 ORDER BY sourcerowcount"
            ),
            &[&migration_id, &target_node_id],
        )
        .await
    }

    async fn find_failed_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tablecopy_tasks
                 WHERE migrationid = $1 AND targetnodeid = $2 AND failure
                 ORDER BY sourcerowcount"
            ),
            &[&migration_id, &target_node_id],
        )
        .await
    }

    async fn updated_tasks_since(
        &self,
        migration_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CopyTask>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tablecopy_tasks
                 WHERE migrationid = $1 AND lastupdate >= $2"
            ),
            &[&migration_id, &since],
        )
        .await
    }

    async fn all_tasks(&self, migration_id: &str) -> Result<Vec<CopyTask>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tablecopy_tasks WHERE migrationid = $1"),
            &[&migration_id],
        )
        .await
    }

    async fn update_task_progress(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        target_row_count: i64,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET targetrowcount = $1, lastupdate = NOW()
                 WHERE migrationid = $2 AND targetnodeid = $3 AND pipelinename = $4",
                &[
                    &target_row_count,
                    &migration_id,
                    &target_node_id,
                    &pipeline_name,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_task_completed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        duration: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET duration = $1, lastupdate = NOW()
                 WHERE migrationid = $2 AND targetnodeid = $3 AND pipelinename = $4
                   AND duration IS NULL",
                &[&duration, &migration_id, &target_node_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn mark_task_failed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        error: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET failure = TRUE, duration = '-1', error = $1, lastupdate = NOW()
                 WHERE migrationid = $2 AND targetnodeid = $3 AND pipelinename = $4
                   AND NOT failure",
                &[&error, &migration_id, &target_node_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn mark_task_truncated(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET truncated = TRUE
                 WHERE migrationid = $1 AND targetnodeid = $2 AND pipelinename = $3",
                &[&migration_id, &target_node_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn update_task_copy_method(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        copy_method: &str,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET copymethod = $1
                 WHERE migrationid = $2 AND targetnodeid = $3 AND pipelinename = $4",
                &[&copy_method, &migration_id, &target_node_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn update_task_key_columns(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        key_columns: &[String],
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tablecopy_tasks
                 SET keycolumns = $1
                 WHERE migrationid = $2 AND targetnodeid = $3 AND pipelinename = $4",
                &[
                    &key_columns.join(","),
                    &migration_id,
                    &target_node_id,
                    &pipeline_name,
                ],
            )
            .await?;
        Ok(())
    }

    async fn schedule_batch(&self, batch: &CopyBatch) -> Result<()> {
        debug!(
            "Scheduling batch {} for {}",
            batch.batch_id, batch.pipeline_name
        );
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO tablecopy_batches
                 (migrationid, pipelinename, batchid, lowerboundary, upperboundary)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &batch.migration_id,
                    &batch.pipeline_name,
                    &(batch.batch_id as i32),
                    &batch.lower_boundary,
                    &batch.upper_boundary,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_batch_completed(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        batch_id: u32,
    ) -> Result<()> {
        let client = self.client().await?;
        let deleted = client
            .execute(
                BATCH_DELETE_SQL,
                &[&migration_id, &pipeline_name, &(batch_id as i32)],
            )
            .await?;
        if deleted != 1 {
            return Err(CopyError::transfer(
                pipeline_name,
                format!("no (exact) match for batch {batch_id}"),
            ));
        }
        Ok(())
    }

    async fn reset_pipeline_batches(&self, migration_id: &str, pipeline_name: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "DELETE FROM tablecopy_batches WHERE migrationid = $1 AND pipelinename = $2",
                &[&migration_id, &pipeline_name],
            )
            .await?;
        Ok(())
    }

    async fn find_pending_batches(
        &self,
        migration_id: &str,
        pipeline_name: &str,
    ) -> Result<Vec<CopyBatch>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT migrationid, pipelinename, batchid, lowerboundary, upperboundary
                 FROM tablecopy_batches
                 WHERE migrationid = $1 AND pipelinename = $2
                 ORDER BY batchid ASC",
                &[&migration_id, &pipeline_name],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| CopyBatch {
                migration_id: r.get(0),
                pipeline_name: r.get(1),
                batch_id: r.get::<_, i32>(2) as u32,
                lower_boundary: r.get(3),
                upper_boundary: r.get(4),
            })
            .collect())
    }
}
