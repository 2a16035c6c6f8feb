//! Migration services: the per-node copy driver and the run lifecycle facade.

use crate::config::CopyConfig;
use crate::context::CopyContext;
use crate::core::CopyItem;
use crate::dialect::DialectRepository;
use crate::error::{CopyError, Result};
use crate::events::{ClusterEventBus, CopyCompletedEvent};
use crate::pipe::DataPipe;
use crate::planner::reader::spawn_readers;
use crate::repository::{MigrationStatus, TaskRepository};
use crate::scheduler::{ClusterScheduler, RoundRobinAlgorithm};
use crate::writer;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

/// Copies every item assigned to this node, bounded by the
/// max-parallel-table-copy pool.
pub struct CopyService {
    source: Arc<dyn DialectRepository>,
    target: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    event_bus: Arc<dyn ClusterEventBus>,
}

impl CopyService {
    pub fn new(
        source: Arc<dyn DialectRepository>,
        target: Arc<dyn DialectRepository>,
        repository: Arc<dyn TaskRepository>,
        event_bus: Arc<dyn ClusterEventBus>,
    ) -> Self {
        Self {
            source,
            target,
            repository,
            event_bus,
        }
    }

    /// Copy all pending items assigned to this node. Returns whether every
    /// item succeeded. One item's failure does not stop the others; fail-fast
    /// aborts arrive through the shared run state instead.
    pub async fn copy_all(&self, ctx: &CopyContext) -> Result<bool> {
        let pending = self
            .repository
            .find_pending_tasks(&ctx.migration_id, ctx.node_id)
            .await?;
        info!(
            "Copying {} pending items on node {}",
            pending.len(),
            ctx.node_id
        );

        let semaphore = Arc::new(Semaphore::new(
            ctx.config.migration.get_max_parallel_table_copy(),
        ));
        let mut copies: JoinSet<bool> = JoinSet::new();

        for task in pending {
            let permit = acquire_with_backoff(&semaphore).await;
            let item = task.to_copy_item();
            let ctx = ctx.clone();
            let source = Arc::clone(&self.source);
            let target = Arc::clone(&self.target);
            let repository = Arc::clone(&self.repository);

            copies.spawn(async move {
                let _permit = permit;
                copy_item(&ctx, source, target, repository, item).await
            });
        }

        let mut all_succeeded = true;
        while let Some(joined) = copies.join_next().await {
            match joined {
                Ok(success) => all_succeeded &= success,
                Err(e) => {
                    error!("Copy task panicked: {}", e);
                    all_succeeded = false;
                }
            }
        }

        self.event_bus
            .publish_complete(CopyCompletedEvent {
                source_node_id: ctx.node_id,
                migration_id: ctx.migration_id.clone(),
                result: all_succeeded,
            })
            .await?;
        Ok(all_succeeded)
    }
}

/// The table-copy pool has a bounded queue; a rejected submission backs off
/// exponentially instead of failing the item.
async fn acquire_with_backoff(semaphore: &Arc<Semaphore>) -> tokio::sync::OwnedSemaphorePermit {
    let mut backoff = Duration::from_millis(100);
    loop {
        match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => return permit,
            Err(_) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
}

/// One item end to end: pipe, readers, writer, terminal bookkeeping.
async fn copy_item(
    ctx: &CopyContext,
    source: Arc<dyn DialectRepository>,
    target: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    item: CopyItem,
) -> bool {
    let pipeline = item.pipeline_name();
    let started = Instant::now();

    let pipe = DataPipe::new(ctx, &item, Arc::clone(&repository));
    let readers = spawn_readers(
        ctx,
        Arc::clone(&source),
        Arc::clone(&repository),
        pipe.clone(),
        item.clone(),
    );

    let result = writer::write(
        ctx,
        source,
        target,
        Arc::clone(&repository),
        pipe.clone(),
        &item,
    )
    .await;

    if let Err(e) = readers.await {
        error!("Reader coordinator for {} panicked: {}", pipeline, e);
    }

    let success = match result {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to copy item {}: {}", pipeline, e);
            false
        }
    };

    // Always record the duration; a failure recorded earlier stays terminal
    // because completion only applies to non-terminal tasks.
    let duration = format!("{:.3}s", started.elapsed().as_secs_f64());
    if let Err(e) = repository
        .mark_task_completed(&ctx.migration_id, ctx.node_id, &pipeline, &duration)
        .await
    {
        error!("Failed to update copy status for {}: {}", pipeline, e);
    }

    success
}

/// Lifecycle facade: start, resume, abort and observe migration runs.
pub struct MigrationService {
    config: Arc<CopyConfig>,
    source: Arc<dyn DialectRepository>,
    repository: Arc<dyn TaskRepository>,
    scheduler: Arc<ClusterScheduler>,
    copy_service: Arc<CopyService>,
}

impl MigrationService {
    pub fn new(
        config: Arc<CopyConfig>,
        source: Arc<dyn DialectRepository>,
        target: Arc<dyn DialectRepository>,
        repository: Arc<dyn TaskRepository>,
        event_bus: Arc<dyn ClusterEventBus>,
    ) -> Self {
        let settings = &config.migration;
        let algorithm = RoundRobinAlgorithm::new(
            settings.node_id,
            settings.cluster_mode,
            &settings.cluster_node_ids,
        );
        let scheduler = Arc::new(ClusterScheduler::new(
            Arc::clone(&repository),
            Arc::clone(&event_bus),
            algorithm,
        ));
        let copy_service = Arc::new(CopyService::new(
            source.clone(),
            target,
            Arc::clone(&repository),
            event_bus,
        ));
        Self {
            config,
            source,
            repository,
            scheduler,
            copy_service,
        }
    }

    /// Wire a service against live PostgreSQL endpoints.
    pub async fn connect(config: CopyConfig) -> Result<Self> {
        let config = Arc::new(config);
        let pool_size = config
            .source
            .pool_size
            .unwrap_or_else(|| config.migration.get_reader_workers() * 2);
        let target_pool_size = config
            .target
            .pool_size
            .unwrap_or_else(|| config.migration.get_writer_workers() * 2);

        let source = crate::dialect::from_connection_string(&config.source.url, pool_size).await?;
        let target =
            crate::dialect::from_connection_string(&config.target.url, target_pool_size).await?;
        let repository: Arc<dyn TaskRepository> = Arc::new(
            crate::repository::PgTaskRepository::connect(&config.target.url, target_pool_size)
                .await?,
        );
        let event_bus: Arc<dyn ClusterEventBus> = Arc::new(crate::events::LocalEventBus::new());
        Ok(Self::new(config, source, target, repository, event_bus))
    }

    /// Build copy items from the configured table mappings, with live source
    /// row counts.
    pub async fn build_items(&self) -> Result<Vec<CopyItem>> {
        let mut items = Vec::with_capacity(self.config.tables.len());
        for mapping in &self.config.tables {
            let rows = self.source.row_count(&mapping.source).await?;
            let mut item =
                CopyItem::new(&mapping.source, mapping.target_table()).with_row_count(rows);
            item.column_overrides = mapping.column_overrides.clone();
            items.push(item);
        }
        Ok(items)
    }

    /// Start a new run: persist schema and status, assign items to nodes,
    /// broadcast the start signal. Returns the run context.
    pub async fn start_migration(&self) -> Result<CopyContext> {
        crate::config::validate(&self.config)?;
        let migration_id = Uuid::new_v4().to_string();
        info!("Starting migration run {}", migration_id);

        let items = self.build_items().await?;
        let ctx = CopyContext::new(migration_id, Arc::clone(&self.config), items);
        self.repository.init_schema().await?;
        self.scheduler.schedule(&ctx).await?;
        Ok(ctx)
    }

    /// Lean context over an existing run, for status and abort calls; skips
    /// the item provider entirely.
    pub async fn resume_context(&self, migration_id: &str) -> Result<CopyContext> {
        // Fails when the run is unknown.
        self.repository.get_status(migration_id).await?;
        Ok(CopyContext::new(
            migration_id,
            Arc::clone(&self.config),
            Vec::new(),
        ))
    }

    /// Rebuild the context of an unfinished run and put its failed items back
    /// into play. Refuses to resume under a changed configuration, since the
    /// persisted batch boundaries were planned with the old one.
    pub async fn resume_migration(&self, migration_id: &str) -> Result<CopyContext> {
        let status = self.repository.get_status(migration_id).await?;
        if let Some(hash) = &status.config_hash {
            if *hash != self.config.hash() {
                return Err(CopyError::Config(
                    "configuration has changed since this run started; cannot resume".into(),
                ));
            }
        }

        let ctx = self.resume_context(migration_id).await?;
        info!("Resuming migration run {}", migration_id);
        self.scheduler.resume_unfinished(&ctx).await?;
        Ok(ctx)
    }

    /// Work this node's share of the run.
    pub async fn copy_local(&self, ctx: &CopyContext) -> Result<bool> {
        self.copy_service.copy_all(ctx).await
    }

    /// Start and run to completion on the local node.
    pub async fn run(&self) -> Result<MigrationStatus> {
        let ctx = self.start_migration().await?;
        self.copy_local(&ctx).await?;
        self.wait_for_finish(&ctx).await
    }

    pub async fn stop_migration(&self, ctx: &CopyContext) -> Result<()> {
        self.scheduler.abort(ctx).await
    }

    pub async fn migration_state(&self, ctx: &CopyContext) -> Result<MigrationStatus> {
        self.scheduler.current_state(ctx).await
    }

    /// Poll until the run reaches a terminal state. Polling suits the CLI
    /// harness; anything production-grade should watch the status store.
    pub async fn wait_for_finish(&self, ctx: &CopyContext) -> Result<MigrationStatus> {
        loop {
            let status = self.scheduler.current_state(ctx).await?;
            if status.is_finished() || status.is_aborted() {
                if status.is_failed() {
                    return Err(CopyError::transfer(
                        &ctx.migration_id,
                        "database migration failed",
                    ));
                }
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CopyConfig;
    use crate::events::LocalEventBus;
    use crate::planner::plan_item;
    use crate::pipe::PipeMessage;
    use crate::repository::{MemoryTaskRepository, MigrationProgress};
    use crate::testutil::MockDialect;

    fn config(mutate: impl FnOnce(&mut CopyConfig)) -> Arc<CopyConfig> {
        let mut config = CopyConfig::from_yaml(
            "source:\n  url: postgres://s\ntarget:\n  url: postgres://t\ntables:\n  - source: users\n",
        )
        .unwrap();
        config.migration.page_size = Some(100);
        config.migration.pipe_timeout_secs = 5;
        config.migration.max_retry_attempts = 1;
        mutate(&mut config);
        Arc::new(config)
    }

    fn service(
        config: Arc<CopyConfig>,
        repo: Arc<MemoryTaskRepository>,
        dialect: Arc<MockDialect>,
    ) -> MigrationService {
        MigrationService::new(
            config,
            dialect.clone() as Arc<dyn DialectRepository>,
            dialect as Arc<dyn DialectRepository>,
            repo as Arc<dyn TaskRepository>,
            Arc::new(LocalEventBus::new()) as Arc<dyn ClusterEventBus>,
        )
    }

    #[tokio::test]
    async fn full_run_copies_every_row_and_completes() {
        // 250 source rows, page size 100, offset batching over a unique
        // column: three pages, three committed batch deletions, 250 target
        // rows.
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("code", 250);
        dialect.set_unique_columns(&["code"]);

        let service = service(config(|_| {}), repo.clone(), dialect.clone());
        let ctx = service.start_migration().await.unwrap();
        service.copy_local(&ctx).await.unwrap();
        let status = service.wait_for_finish(&ctx).await.unwrap();

        assert_eq!(status.status, MigrationProgress::Completed);
        assert_eq!(status.completed_tasks, 1);

        let state = dialect.lock();
        assert_eq!(state.target_rows.len(), 250);
        assert_eq!(state.commits.len(), 3);
        drop(state);

        let task = repo
            .find_pipeline(&ctx.migration_id, 0, "users->users")
            .await
            .unwrap()
            .expect("task exists");
        assert_eq!(task.target_row_count, 250);
        assert!(task.is_completed());
        assert!(repo
            .find_pending_batches(&ctx.migration_id, "users->users")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn failing_item_fails_the_run_but_not_the_process() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("PK", 50);
        dialect.fail_commits(100);

        let service = service(config(|_| {}), repo.clone(), dialect.clone());
        let ctx = service.start_migration().await.unwrap();
        let succeeded = service.copy_local(&ctx).await.unwrap();
        assert!(!succeeded);

        let err = service.wait_for_finish(&ctx).await.unwrap_err();
        assert!(matches!(err, CopyError::Transfer { .. }));

        let task = repo
            .find_pipeline(&ctx.migration_id, 0, "users->users")
            .await
            .unwrap()
            .unwrap();
        assert!(task.failure);
    }

    #[tokio::test]
    async fn resume_reprocesses_exactly_the_pending_batches() {
        // Interrupt after one committed batch, then resume: only the still
        // pending descriptors run again and the final row count matches an
        // uninterrupted run.
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("PK", 250);
        let item = CopyItem::new("users", "users").with_row_count(250);
        repo.schedule_task("m1", &item, 250, 0).await.unwrap();

        let first_ctx = CopyContext::new("m1", config(|_| {}), vec![item.clone()]);
        let source = dialect.clone() as Arc<dyn DialectRepository>;
        let repo_dyn = repo.clone() as Arc<dyn TaskRepository>;

        // Plan registers three descriptors: [1,101), [101,201), [201,..).
        let plan = plan_item(&first_ctx, &source, &repo_dyn, &item)
            .await
            .unwrap();
        assert_eq!(plan.batches.len(), 3);

        // First run dies after committing only batch 0.
        let pipe = DataPipe::new(&first_ctx, &item, repo_dyn.clone());
        let page = dialect
            .seek_page(&crate::dialect::SeekQuery {
                table: "users".into(),
                column: "PK".into(),
                lower: Some(crate::core::SqlValue::I64(1)),
                upper: Some(crate::core::SqlValue::I64(101)),
                page_size: 100,
                batch_id: 0,
            })
            .await
            .unwrap();
        pipe.put(PipeMessage::Data(page)).await.unwrap();
        pipe.put(PipeMessage::Finished).await.unwrap();
        writer::write(
            &first_ctx,
            source.clone(),
            source.clone(),
            repo_dyn.clone(),
            pipe,
            &item,
        )
        .await
        .unwrap();

        assert_eq!(dialect.lock().target_rows.len(), 100);
        assert_eq!(
            repo.find_pending_batches("m1", "users->users")
                .await
                .unwrap()
                .len(),
            2
        );

        // Resumed run processes exactly the two pending descriptors.
        let resume_ctx = CopyContext::new(
            "m1",
            config(|c| c.migration.resume_enabled = true),
            vec![item.clone()],
        );
        let pipe = DataPipe::new(&resume_ctx, &item, repo_dyn.clone());
        let readers = spawn_readers(
            &resume_ctx,
            source.clone(),
            repo_dyn.clone(),
            pipe.clone(),
            item.clone(),
        );
        writer::write(
            &resume_ctx,
            source.clone(),
            source,
            repo_dyn.clone(),
            pipe,
            &item,
        )
        .await
        .unwrap();
        readers.await.unwrap();

        let state = dialect.lock();
        assert_eq!(state.target_rows.len(), 250);
        drop(state);

        assert!(repo
            .find_pending_batches("m1", "users->users")
            .await
            .unwrap()
            .is_empty());
        let task = repo.find_pipeline("m1", 0, "users->users").await.unwrap().unwrap();
        assert_eq!(task.target_row_count, 250);
    }

    #[tokio::test]
    async fn resume_refuses_a_changed_configuration() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("PK", 10);

        let started = service(config(|_| {}), repo.clone(), dialect.clone());
        let ctx = started.start_migration().await.unwrap();

        let changed = service(
            config(|c| c.migration.page_size = Some(7)),
            repo,
            dialect,
        );
        let err = changed.resume_migration(&ctx.migration_id).await.unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
    }

    #[tokio::test]
    async fn abort_stops_the_run() {
        let repo = Arc::new(MemoryTaskRepository::new());
        let dialect = Arc::new(MockDialect::new(repo.clone()));
        dialect.seed_source("PK", 10);

        let service = service(config(|_| {}), repo.clone(), dialect);
        let ctx = service.start_migration().await.unwrap();
        service.stop_migration(&ctx).await.unwrap();

        let status = service.migration_state(&ctx).await.unwrap();
        assert!(status.is_aborted());
        assert!(ctx.run_state.is_aborted());

        // An aborted run copies nothing: the pipe self-aborts on first get.
        let succeeded = service.copy_local(&ctx).await.unwrap();
        assert!(!succeeded);
    }
}
