//! Configuration validation.

use super::types::CopyConfig;
use crate::error::{CopyError, Result};

/// Validate a configuration before a run.
///
/// Contradictory settings are rejected here rather than failing mid-copy
/// where half the tables may already be truncated.
pub fn validate(config: &CopyConfig) -> Result<()> {
    if config.migration.truncate_enabled && config.migration.incremental_enabled {
        return Err(CopyError::Config(
            "truncating tables in incremental mode is illegal; set migration.truncate_enabled to false".into(),
        ));
    }

    if config.migration.get_page_size() == 0 {
        return Err(CopyError::Config("migration.page_size must be > 0".into()));
    }

    if config.migration.pipe_capacity == 0 {
        return Err(CopyError::Config(
            "migration.pipe_capacity must be > 0".into(),
        ));
    }

    if config.migration.get_reader_workers() == 0 || config.migration.get_writer_workers() == 0 {
        return Err(CopyError::Config(
            "reader_workers and writer_workers must be > 0".into(),
        ));
    }

    if config.migration.get_max_parallel_table_copy() == 0 {
        return Err(CopyError::Config(
            "migration.max_parallel_table_copy must be > 0".into(),
        ));
    }

    if config.migration.cluster_mode && config.migration.cluster_node_ids.is_empty() {
        return Err(CopyError::Config(
            "cluster_mode requires migration.cluster_node_ids".into(),
        ));
    }

    if config.tables.is_empty() {
        return Err(CopyError::Config("no tables configured".into()));
    }

    Ok(())
}
