//! In-memory task repository for tests and dry runs.

use super::{CopyBatch, CopyTask, MigrationProgress, MigrationStatus, TaskRepository};
use crate::core::CopyItem;
use crate::error::{CopyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Store {
    status: HashMap<String, MigrationStatus>,
    tasks: HashMap<(String, i32, String), CopyTask>,
    batches: BTreeMap<(String, String, u32), CopyBatch>,
}

/// Task repository backed by process memory. State does not survive the
/// process, so resume across restarts needs the database-backed repository.
#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    store: Mutex<Store>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_mut<'a>(
        store: &'a mut Store,
        migration_id: &str,
        node: i32,
        pipeline: &str,
    ) -> Option<&'a mut CopyTask> {
        store
            .tasks
            .get_mut(&(migration_id.to_string(), node, pipeline.to_string()))
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn create_status(
        &self,
        migration_id: &str,
        total_tasks: i32,
        config_hash: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        store.status.insert(
            migration_id.to_string(),
            MigrationStatus {
                migration_id: migration_id.to_string(),
                status: MigrationProgress::Running,
                total_tasks,
                completed_tasks: 0,
                failed_tasks: 0,
                config_hash: Some(config_hash.to_string()),
                started_at: Some(Utc::now()),
                ended_at: None,
                last_update: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn reset_status(&self, migration_id: &str) -> Result<()> {
        let mut store = self.lock();
        if let Some(status) = store.status.get_mut(migration_id) {
            status.completed_tasks = status.total_tasks - status.failed_tasks;
            status.failed_tasks = 0;
            status.status = MigrationProgress::Running;
            status.last_update = Some(Utc::now());
        }
        Ok(())
    }

    async fn transition_status(
        &self,
        migration_id: &str,
        from: MigrationProgress,
        to: MigrationProgress,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(status) = store.status.get_mut(migration_id) {
            if status.status == from {
                status.status = to;
                if to == MigrationProgress::Completed {
                    status.ended_at = Some(Utc::now());
                }
                status.last_update = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn set_status(&self, migration_id: &str, to: MigrationProgress) -> Result<()> {
        let mut store = self.lock();
        if let Some(status) = store.status.get_mut(migration_id) {
            status.status = to;
            if matches!(to, MigrationProgress::Completed | MigrationProgress::Aborted) {
                status.ended_at = Some(Utc::now());
            }
            status.last_update = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_status_counts(
        &self,
        migration_id: &str,
        completed: i32,
        failed: i32,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(status) = store.status.get_mut(migration_id) {
            status.completed_tasks = completed;
            status.failed_tasks = failed;
            status.last_update = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_status(&self, migration_id: &str) -> Result<MigrationStatus> {
        self.lock()
            .status
            .get(migration_id)
            .cloned()
            .ok_or_else(|| {
                CopyError::Config(format!("no status row for migration {migration_id}"))
            })
    }

    async fn schedule_task(
        &self,
        migration_id: &str,
        item: &CopyItem,
        source_row_count: i64,
        target_node_id: i32,
    ) -> Result<()> {
        let mut store = self.lock();
        let pipeline = item.pipeline_name();
        store.tasks.insert(
            (migration_id.to_string(), target_node_id, pipeline.clone()),
            CopyTask {
                migration_id: migration_id.to_string(),
                target_node_id,
                pipeline_name: pipeline,
                source_table: item.source_table.clone(),
                target_table: item.target_table.clone(),
                column_map: item.column_overrides.clone(),
                source_row_count,
                target_row_count: 0,
                duration: None,
                failure: false,
                error: None,
                truncated: false,
                copy_method: None,
                key_columns: Vec::new(),
                last_update: Utc::now(),
            },
        );
        Ok(())
    }

    async fn reschedule_task(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        target_node_id: i32,
    ) -> Result<()> {
        let mut store = self.lock();
        // The task may move between nodes on resume; find it wherever it is.
        let key = store
            .tasks
            .iter()
            .find(|((mid, _, pipe), _)| mid == migration_id && pipe == pipeline_name)
            .map(|(k, _)| k.clone());
        if let Some(mut task) = key.and_then(|k| store.tasks.remove(&k)) {
            task.failure = false;
            task.duration = None;
            task.error = None;
            task.target_node_id = target_node_id;
            task.last_update = Utc::now();
            store.tasks.insert(
                (
                    migration_id.to_string(),
                    target_node_id,
                    pipeline_name.to_string(),
                ),
                task,
            );
        }
        Ok(())
    }

    async fn find_pipeline(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<Option<CopyTask>> {
        Ok(self
            .lock()
            .tasks
            .get(&(
                migration_id.to_string(),
                target_node_id,
                pipeline_name.to_string(),
            ))
            .cloned())
    }

    async fn find_pending_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>> {
        let store = self.lock();
        let mut tasks: Vec<CopyTask> = store
            .tasks
            .values()
            .filter(|t| {
                t.migration_id == migration_id
                    && t.target_node_id == target_node_id
                    && t.duration.is_none()
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.source_row_count);
        Ok(tasks)
    }

    async fn find_failed_tasks(
        &self,
        migration_id: &str,
        target_node_id: i32,
    ) -> Result<Vec<CopyTask>> {
        let store = self.lock();
        let mut tasks: Vec<CopyTask> = store
            .tasks
            .values()
            .filter(|t| {
                t.migration_id == migration_id && t.target_node_id == target_node_id && t.failure
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.source_row_count);
        Ok(tasks)
    }

    async fn updated_tasks_since(
        &self,
        migration_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CopyTask>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.migration_id == migration_id && t.last_update >= since)
            .cloned()
            .collect())
    }

    async fn all_tasks(&self, migration_id: &str) -> Result<Vec<CopyTask>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn update_task_progress(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        target_row_count: i64,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            task.target_row_count = target_row_count;
            task.last_update = Utc::now();
        }
        Ok(())
    }

    async fn mark_task_completed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        duration: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            if task.duration.is_none() {
                task.duration = Some(duration.to_string());
                task.last_update = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_task_failed(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        error: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            if !task.failure {
                task.failure = true;
                task.duration = Some("-1".to_string());
                task.error = Some(error.to_string());
                task.last_update = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_task_truncated(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            task.truncated = true;
        }
        Ok(())
    }

    async fn update_task_copy_method(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        copy_method: &str,
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            task.copy_method = Some(copy_method.to_string());
        }
        Ok(())
    }

    async fn update_task_key_columns(
        &self,
        migration_id: &str,
        target_node_id: i32,
        pipeline_name: &str,
        key_columns: &[String],
    ) -> Result<()> {
        let mut store = self.lock();
        if let Some(task) = Self::task_mut(&mut store, migration_id, target_node_id, pipeline_name)
        {
            task.key_columns = key_columns.to_vec();
        }
        Ok(())
    }

    async fn schedule_batch(&self, batch: &CopyBatch) -> Result<()> {
        let mut store = self.lock();
        store.batches.insert(
            (
                batch.migration_id.clone(),
                batch.pipeline_name.clone(),
                batch.batch_id,
            ),
            batch.clone(),
        );
        Ok(())
    }

    async fn mark_batch_completed(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        batch_id: u32,
    ) -> Result<()> {
        self.complete_batch(migration_id, pipeline_name, batch_id)
    }

    async fn reset_pipeline_batches(&self, migration_id: &str, pipeline_name: &str) -> Result<()> {
        let mut store = self.lock();
        store.batches.retain(|(mid, pipe, _), _| {
            !(mid == migration_id && pipe == pipeline_name)
        });
        Ok(())
    }

    async fn find_pending_batches(
        &self,
        migration_id: &str,
        pipeline_name: &str,
    ) -> Result<Vec<CopyBatch>> {
        // BTreeMap iteration order gives ascending batch ids.
        Ok(self
            .lock()
            .batches
            .iter()
            .filter(|((mid, pipe, _), _)| mid == migration_id && pipe == pipeline_name)
            .map(|(_, b)| b.clone())
            .collect())
    }
}

impl MemoryTaskRepository {
    /// Synchronous batch deletion, shared with the mock dialect's page commit
    /// so tests model "same transaction as the write".
    pub(crate) fn complete_batch(
        &self,
        migration_id: &str,
        pipeline_name: &str,
        batch_id: u32,
    ) -> Result<()> {
        let mut store = self.lock();
        let removed = store.batches.remove(&(
            migration_id.to_string(),
            pipeline_name.to_string(),
            batch_id,
        ));
        if removed.is_none() {
            return Err(CopyError::transfer(
                pipeline_name,
                format!("no (exact) match for batch {batch_id}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(pipeline: &str, id: u32, lower: &str) -> CopyBatch {
        CopyBatch {
            migration_id: "m1".into(),
            pipeline_name: pipeline.into(),
            batch_id: id,
            lower_boundary: lower.into(),
            upper_boundary: None,
        }
    }

    #[tokio::test]
    async fn task_lifecycle() {
        let repo = MemoryTaskRepository::new();
        let item = CopyItem::new("users", "users");
        repo.schedule_task("m1", &item, 100, 0).await.unwrap();

        let pending = repo.find_pending_tasks("m1", 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].pipeline_name, "users->users");

        repo.update_task_progress("m1", 0, "users->users", 50)
            .await
            .unwrap();
        repo.mark_task_completed("m1", 0, "users->users", "12s")
            .await
            .unwrap();

        assert!(repo.find_pending_tasks("m1", 0).await.unwrap().is_empty());
        let task = repo
            .find_pipeline("m1", 0, "users->users")
            .await
            .unwrap()
            .unwrap();
        assert!(task.is_completed());
        assert_eq!(task.target_row_count, 50);
    }

    #[tokio::test]
    async fn first_failure_wins_and_completion_does_not_override() {
        let repo = MemoryTaskRepository::new();
        let item = CopyItem::new("users", "users");
        repo.schedule_task("m1", &item, 100, 0).await.unwrap();

        repo.mark_task_failed("m1", 0, "users->users", "boom")
            .await
            .unwrap();
        repo.mark_task_failed("m1", 0, "users->users", "later")
            .await
            .unwrap();
        repo.mark_task_completed("m1", 0, "users->users", "10s")
            .await
            .unwrap();

        let task = repo
            .find_pipeline("m1", 0, "users->users")
            .await
            .unwrap()
            .unwrap();
        assert!(task.failure);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.duration.as_deref(), Some("-1"));
    }

    #[tokio::test]
    async fn pending_tasks_are_ordered_by_row_count() {
        let repo = MemoryTaskRepository::new();
        repo.schedule_task("m1", &CopyItem::new("big", "big"), 1000, 0)
            .await
            .unwrap();
        repo.schedule_task("m1", &CopyItem::new("small", "small"), 10, 0)
            .await
            .unwrap();

        let pending = repo.find_pending_tasks("m1", 0).await.unwrap();
        assert_eq!(pending[0].source_table, "small");
        assert_eq!(pending[1].source_table, "big");
    }

    #[tokio::test]
    async fn batch_completion_is_exactly_once() {
        let repo = MemoryTaskRepository::new();
        repo.schedule_batch(&batch("p", 0, "0")).await.unwrap();
        repo.schedule_batch(&batch("p", 1, "100")).await.unwrap();

        repo.mark_batch_completed("m1", "p", 0).await.unwrap();
        assert!(repo.mark_batch_completed("m1", "p", 0).await.is_err());

        let pending = repo.find_pending_batches("m1", "p").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].batch_id, 1);
    }

    #[tokio::test]
    async fn pending_batches_ordered_by_id() {
        let repo = MemoryTaskRepository::new();
        repo.schedule_batch(&batch("p", 2, "200")).await.unwrap();
        repo.schedule_batch(&batch("p", 0, "0")).await.unwrap();
        repo.schedule_batch(&batch("p", 1, "100")).await.unwrap();

        let ids: Vec<u32> = repo
            .find_pending_batches("m1", "p")
            .await
            .unwrap()
            .iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn reschedule_clears_failure() {
        let repo = MemoryTaskRepository::new();
        repo.schedule_task("m1", &CopyItem::new("t", "t"), 10, 0)
            .await
            .unwrap();
        repo.mark_task_failed("m1", 0, "t->t", "boom").await.unwrap();

        repo.reschedule_task("m1", "t->t", 1).await.unwrap();
        let task = repo.find_pipeline("m1", 1, "t->t").await.unwrap().unwrap();
        assert!(!task.failure);
        assert!(task.duration.is_none());
        assert_eq!(task.target_node_id, 1);
    }
}
