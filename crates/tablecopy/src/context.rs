//! Per-run context and shared run state.

use crate::config::CopyConfig;
use crate::core::CopyItem;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Thread-safe state shared by every worker of one migration run.
///
/// All cross-worker mutable state lives here and travels by `Arc`; workers
/// never touch globals. The abort flag is the migration-wide signal consulted
/// by pipes and writer loops at their loop boundaries.
#[derive(Debug, Default)]
pub struct RunState {
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    rows_copied: AtomicI64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the migration-wide abort signal. The first reason wins.
    pub fn request_abort(&self, reason: impl Into<String>) {
        let mut guard = self.abort_reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Add committed rows to the run total and return the new total.
    pub fn add_rows_copied(&self, rows: i64) -> i64 {
        self.rows_copied.fetch_add(rows, Ordering::Relaxed) + rows
    }

    pub fn rows_copied(&self) -> i64 {
        self.rows_copied.load(Ordering::Relaxed)
    }
}

/// Context for one migration run: identity, configuration, the items to copy
/// and the shared run state.
#[derive(Clone, Debug)]
pub struct CopyContext {
    /// Unique migration run identifier.
    pub migration_id: String,

    /// This node's cluster id.
    pub node_id: i32,

    /// Run configuration.
    pub config: Arc<CopyConfig>,

    /// Items scheduled in this run.
    pub items: Vec<CopyItem>,

    /// Shared abort/progress state.
    pub run_state: Arc<RunState>,
}

impl CopyContext {
    pub fn new(migration_id: impl Into<String>, config: Arc<CopyConfig>, items: Vec<CopyItem>) -> Self {
        let node_id = config.migration.node_id;
        Self {
            migration_id: migration_id.into(),
            node_id,
            config,
            items,
            run_state: Arc::new(RunState::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_abort_reason_wins() {
        let state = RunState::new();
        assert!(!state.is_aborted());

        state.request_abort("first failure");
        state.request_abort("second failure");

        assert!(state.is_aborted());
        assert_eq!(state.abort_reason().as_deref(), Some("first failure"));
    }

    #[test]
    fn row_counter_accumulates() {
        let state = RunState::new();
        assert_eq!(state.add_rows_copied(100), 100);
        assert_eq!(state.add_rows_copied(50), 150);
        assert_eq!(state.rows_copied(), 150);
    }
}
