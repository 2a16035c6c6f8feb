//! Persisted task/batch bookkeeping.
//!
//! The repository is the single source of truth for what remains to be
//! copied: one row per (migration, pipeline, node) task, one row per pending
//! batch, one status row per migration. Every call commits independently,
//! except batch-completion deletion, which participates in the writer's page
//! transaction (see [`crate::dialect::PageCommit`]).

mod memory;
pub(crate) mod pg;

pub use memory::MemoryTaskRepository;
pub use pg::PgTaskRepository;

use crate::core::CopyItem;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall migration progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationProgress {
    Created,
    Running,
    Processed,
    Completed,
    Aborted,
    Stalled,
}

impl MigrationProgress {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationProgress::Created => "created",
            MigrationProgress::Running => "running",
            MigrationProgress::Processed => "processed",
            MigrationProgress::Completed => "completed",
            MigrationProgress::Aborted => "aborted",
            MigrationProgress::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(MigrationProgress::Created),
            "running" => Ok(MigrationProgress::Running),
            "processed" => Ok(MigrationProgress::Processed),
            "completed" => Ok(MigrationProgress::Completed),
            "aborted" => Ok(MigrationProgress::Aborted),
            "stalled" => Ok(MigrationProgress::Stalled),
            other => Err(crate::error::CopyError::Config(format!(
                "invalid migration status: {other}"
            ))),
        }
    }
}

/// Aggregate status of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub migration_id: String,
    pub status: MigrationProgress,
    pub total_tasks: i32,
    pub completed_tasks: i32,
    pub failed_tasks: i32,
    /// Hash of the configuration the run started with; resume refuses to
    /// continue under a different configuration.
    pub config_hash: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    /// Whether the run reached a terminal or stalled state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            MigrationProgress::Completed | MigrationProgress::Aborted | MigrationProgress::Stalled
        ) || (self.status == MigrationProgress::Processed
            && self.total_tasks == self.completed_tasks + self.failed_tasks)
    }

    pub fn is_failed(&self) -> bool {
        self.failed_tasks > 0 || self.status == MigrationProgress::Stalled
    }

    pub fn is_aborted(&self) -> bool {
        self.status == MigrationProgress::Aborted
    }
}

/// One persisted copy task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyTask {
    pub migration_id: String,
    pub target_node_id: i32,
    pub pipeline_name: String,
    pub source_table: String,
    pub target_table: String,
    pub column_map: std::collections::HashMap<String, String>,
    pub source_row_count: i64,
    pub target_row_count: i64,
    /// Human-readable duration; set exactly once when the task finishes.
    /// `"-1"` marks a failed task.
    pub duration: Option<String>,
    pub failure: bool,
    pub error: Option<String>,
    pub truncated: bool,
    pub copy_method: Option<String>,
    pub key_columns: Vec<String>,
    pub last_update: DateTime<Utc>,
}

impl CopyTask {
    pub fn is_completed(&self) -> bool {
        self.duration.is_some() && !self.failure
    }

    /// Rebuild the in-memory copy item from the persisted row.
    pub fn to_copy_item(&self) -> CopyItem {
        CopyItem {
            source_table: self.source_table.clone(),
            target_table: self.target_table.clone(),
            column_overrides: self.column_map.clone(),
            source_row_count: self.source_row_count,
        }
    }
}

/// One persisted pending batch row. Deleted on completion; the set of
/// remaining rows for a pipeline is exactly its pending work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyBatch {
    pub migration_id: String,
    pub pipeline_name: String,
    pub batch_id: u32,
    pub lower_boundary: String,
    pub upper_boundary: Option<String>,
}

/// Persistence operations for tasks, batches and the migration status row.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create the persisted schema. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    // ===== Migration status =====

    /// Insert the status row for a new run.
    async fn create_status(
        &self,
        migration_id: &str,
        total_tasks: i32,
        config_hash: &str,
    ) -> Result<()>;

    /// Reset counters for a resumed run: failed tasks become pending again.
    async fn reset_status(&self, migration_id: &str) -> Result<()>;

    /// Transition the status row from one state to another. A no-op when the
    /// current state differs from `from`, so concurrent nodes cannot double
    /// apply a transition.
    async fn transition_status(
        &self,
        migration_id: &str,
        from: MigrationProgress,
        to: MigrationProgress,
    ) -> Result<()>;

    /// Force the status row to a state regardless of the current one.
    async fn set_status(&self, migration_id: &str, to: MigrationProgress) -> Result<()>;

    /// Update the aggregate task counters.
    async fn update_status_counts(
        &self,
        migration_id: &str,
        completed: i32,
        failed: i32,
    ) -> Result<()>;

    async fn get_status(&self, migration_id: &str) -> Result<MigrationStatus>;

    // ===== Tasks =====

    /// Register a copy item for a node.
    async fn schedule_task(
        &self,
        migration_id: &str,
        item: &CopyItem,
        source_row_count: i64,
        target_node_id: i32,
    ) -> Result<()>;

    /// Put a failed task back into play on a node (resume).
    async fn reschedule_task(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        target_node_id: i32,
    ) -> Result<()>;

    async fn find_pipeline(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<Option<CopyTask>>;

    /// Pending tasks for a node, smallest tables first.
    async fn find_pending_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>>;

    async fn find_failed_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>>;

    /// Tasks updated at or after `since`, across all nodes.
    async fn updated_tasks_since(
        &self,
        migration_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CopyTask>>;

    async fn all_tasks(&self, migration_id: &str) -> Result<Vec<CopyTask>>;

    async fn update_task_progress(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        target_row_count: i64,
    ) -> Result<()>;

    /// Record the duration and close the task. Only applies while the task is
    /// not yet terminal, so a failure recorded earlier is preserved.
    async fn mark_task_completed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        duration: &str,
    ) -> Result<()>;

    /// Record a failure. The first failure wins.
    async fn mark_task_failed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        error: &str,
    ) -> Result<()>;

    async fn mark_task_truncated(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<()>;

    async fn update_task_copy_method(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        copy_method: &str,
    ) -> Result<()>;

    async fn update_task_key_columns(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        key_columns: &[String],
    ) -> Result<()>;

    // ===== Batches =====

    /// Register a pending batch descriptor.
    async fn schedule_batch(&self, batch: &CopyBatch) -> Result<()>;

    /// Delete a completed batch descriptor outside a page transaction.
    /// Exactly one row must be deleted.
    async fn mark_batch_completed(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        batch_id: u32,
    ) -> Result<()>;

    /// Drop all pending batch descriptors for a pipeline.
    async fn reset_pipeline_batches(&self, migration_id: &str, pipeline_name: &str) -> Result<()>;

    /// Pending batches for a pipeline, ordered by batch id.
    async fn find_pending_batches(
        &self,
        migration_id: &str,
        pipeline_name: &str,
    ) -> Result<Vec<CopyBatch>>;
}
