//! Cluster scheduler: node assignment, status aggregation, abort, stall
//! detection and post-processing.

mod algorithm;

pub use algorithm::RoundRobinAlgorithm;

use crate::context::CopyContext;
use crate::error::Result;
use crate::events::{ClusterEventBus, StartCopyEvent};
use crate::repository::{MigrationProgress, MigrationStatus, TaskRepository};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Runs after every item across all nodes reached a terminal state, before
/// the migration is declared completed.
#[async_trait]
pub trait MigrationPostProcessor: Send + Sync {
    async fn process(&self, ctx: &CopyContext, status: &MigrationStatus) -> Result<()>;
}

/// Default post-processor: log the run summary.
pub struct SummaryPostProcessor;

#[async_trait]
impl MigrationPostProcessor for SummaryPostProcessor {
    async fn process(&self, ctx: &CopyContext, status: &MigrationStatus) -> Result<()> {
        info!(
            "Migration {}: {}/{} tasks completed, {} failed, {} rows copied",
            ctx.migration_id,
            status.completed_tasks,
            status.total_tasks,
            status.failed_tasks,
            ctx.run_state.rows_copied(),
        );
        Ok(())
    }
}

/// Assigns items to cluster nodes and tracks the migration lifecycle:
/// Created → Running → (Processed → Completed) | Aborted | Stalled.
pub struct ClusterScheduler {
    repository: Arc<dyn TaskRepository>,
    event_bus: Arc<dyn ClusterEventBus>,
    algorithm: Mutex<RoundRobinAlgorithm>,
    post_processors: Vec<Arc<dyn MigrationPostProcessor>>,
}

impl ClusterScheduler {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        event_bus: Arc<dyn ClusterEventBus>,
        algorithm: RoundRobinAlgorithm,
    ) -> Self {
        Self {
            repository,
            event_bus,
            algorithm: Mutex::new(algorithm),
            post_processors: vec![Arc::new(SummaryPostProcessor)],
        }
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn MigrationPostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }

    /// Register every item with a node and broadcast the start signal.
    ///
    /// Items are assigned largest-first so the round-robin spreads the heavy
    /// tables across nodes.
    pub async fn schedule(&self, ctx: &CopyContext) -> Result<()> {
        self.repository
            .create_status(
                &ctx.migration_id,
                ctx.items.len() as i32,
                &ctx.config.hash(),
            )
            .await?;

        let mut items = ctx.items.clone();
        items.sort_by_key(|item| std::cmp::Reverse(item.source_row_count));

        for item in &items {
            let node = self
                .algorithm
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .next();
            self.repository
                .schedule_task(&ctx.migration_id, item, item.source_row_count, node)
                .await?;
            info!(
                "Scheduled {} ({} rows) on node {}",
                item.pipeline_name(),
                item.source_row_count,
                node
            );
        }

        self.event_bus
            .publish_start(StartCopyEvent {
                source_node_id: ctx.node_id,
                migration_id: ctx.migration_id.clone(),
                resume: false,
            })
            .await?;
        Ok(())
    }

    /// Put this node's failed tasks back into play and broadcast resume.
    pub async fn resume_unfinished(&self, ctx: &CopyContext) -> Result<()> {
        let failed = self
            .repository
            .find_failed_tasks(&ctx.migration_id, ctx.node_id)
            .await?;
        for task in &failed {
            let node = self
                .algorithm
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .next();
            info!("Rescheduling failed pipeline {} on node {}", task.pipeline_name, node);
            self.repository
                .reschedule_task(&ctx.migration_id, &task.pipeline_name, node)
                .await?;
        }
        self.repository.reset_status(&ctx.migration_id).await?;

        self.event_bus
            .publish_start(StartCopyEvent {
                source_node_id: ctx.node_id,
                migration_id: ctx.migration_id.clone(),
                resume: true,
            })
            .await?;
        Ok(())
    }

    /// Aggregate task rows into the migration status, advancing the
    /// lifecycle: Running → Processed once every task is terminal, then
    /// post-processing, then Processed → Completed. A running migration with
    /// no task update inside the stalled window degrades to Stalled.
    pub async fn current_state(&self, ctx: &CopyContext) -> Result<MigrationStatus> {
        let status = self.repository.get_status(&ctx.migration_id).await?;
        if status.status != MigrationProgress::Running {
            return Ok(status);
        }

        let tasks = self.repository.all_tasks(&ctx.migration_id).await?;
        let completed = tasks.iter().filter(|t| t.is_completed()).count() as i32;
        let failed = tasks.iter().filter(|t| t.failure).count() as i32;
        self.repository
            .update_status_counts(&ctx.migration_id, completed, failed)
            .await?;

        let all_terminal = tasks.iter().all(|t| t.duration.is_some());
        if !tasks.is_empty() && all_terminal {
            self.repository
                .transition_status(
                    &ctx.migration_id,
                    MigrationProgress::Running,
                    MigrationProgress::Processed,
                )
                .await?;
            let processed = self.repository.get_status(&ctx.migration_id).await?;
            for processor in &self.post_processors {
                processor.process(ctx, &processed).await?;
            }
            self.repository
                .transition_status(
                    &ctx.migration_id,
                    MigrationProgress::Processed,
                    MigrationProgress::Completed,
                )
                .await?;
        } else if let Some(last) = tasks.iter().map(|t| t.last_update).max() {
            let stalled_after =
                ChronoDuration::seconds(ctx.config.migration.stalled_timeout_secs as i64);
            if Utc::now() - last > stalled_after {
                warn!(
                    "Migration {} stalled: no progress since {}",
                    ctx.migration_id, last
                );
                self.repository
                    .set_status(&ctx.migration_id, MigrationProgress::Stalled)
                    .await?;
            }
        }

        self.repository.get_status(&ctx.migration_id).await
    }

    /// Abort the whole migration: flips the shared abort flag consulted by
    /// every pipe and writer loop, and persists the terminal status.
    pub async fn abort(&self, ctx: &CopyContext) -> Result<()> {
        ctx.run_state.request_abort("migration aborted");
        self.repository
            .set_status(&ctx.migration_id, MigrationProgress::Aborted)
            .await
    }

    pub async fn is_aborted(&self, ctx: &CopyContext) -> Result<bool> {
        if ctx.run_state.is_aborted() {
            return Ok(true);
        }
        Ok(self
            .repository
            .get_status(&ctx.migration_id)
            .await?
            .is_aborted())
    }
}
