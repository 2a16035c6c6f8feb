//! Parallel batched table copy engine for platform database migrations.
//!
//! Tables are copied one pipeline at a time: a planner picks a batching
//! strategy per table, parallel reader tasks fill a bounded pipe, and a
//! writer loop drains it through a bounded worker pool, committing each page
//! together with its persisted batch descriptor. The persisted task/batch
//! bookkeeping makes a run resumable after partial failure and lets a
//! cluster scheduler spread pipelines over nodes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tablecopy::{CopyConfig, MigrationService};
//!
//! let config = CopyConfig::from_file("config.yaml")?.with_auto_tuning();
//! let service = MigrationService::connect(config).await?;
//! let status = service.run().await?;
//! println!("{} tasks completed", status.completed_tasks);
//! ```

pub mod config;
pub mod context;
pub mod core;
pub mod dialect;
pub mod error;
pub mod events;
pub mod pipe;
pub mod planner;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::core::{ColumnMeta, CopyItem, Page, SqlNullType, SqlValue};
pub use config::{CopyConfig, MigrationSettings};
pub use context::{CopyContext, RunState};
pub use error::{CopyError, Result};
pub use pipe::{DataPipe, PipeMessage};
pub use repository::{
    CopyBatch, CopyTask, MemoryTaskRepository, MigrationProgress, MigrationStatus,
    PgTaskRepository, TaskRepository,
};
pub use service::{CopyService, MigrationService};
