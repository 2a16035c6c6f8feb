//! Test doubles: a mock dialect over an in-memory table pair.
//!
//! The mock models source and target as row vectors and shares the memory
//! task repository, so a page commit applies the rows and deletes the batch
//! descriptor under one lock, the way the real dialect does it in one
//! transaction.

use crate::core::{ColumnMeta, Page, SqlValue};
use crate::dialect::{
    DialectRepository, MarkersQuery, OffsetQuery, PageCommit, SeekQuery,
};
use crate::error::{CopyError, Result};
use crate::repository::MemoryTaskRepository;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub source_columns: Vec<ColumnMeta>,
    pub source_rows: Vec<Vec<SqlValue>>,
    pub unique_columns: Vec<String>,
    pub target_columns: Vec<String>,
    pub target_rows: Vec<Vec<SqlValue>>,
    pub truncate_calls: u32,
    pub disable_calls: u32,
    pub enable_calls: u32,
    pub drop_calls: u32,
    pub commits: Vec<PageCommit>,
}

pub(crate) struct MockDialect {
    pub state: Mutex<MockState>,
    pub repository: Arc<MemoryTaskRepository>,
    /// Number of upcoming page commits to fail with a transient error.
    pub fail_next_commits: AtomicU32,
}

impl MockDialect {
    pub fn new(repository: Arc<MemoryTaskRepository>) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            repository,
            fail_next_commits: AtomicU32::new(0),
        }
    }

    /// Seed the source table with `rows` sequential rows of (PK-like key, text).
    pub fn seed_source(&self, key_column: &str, rows: i64) {
        let mut state = self.lock();
        state.source_columns = vec![
            ColumnMeta::new(key_column, "bigint"),
            ColumnMeta::new("name", "text"),
        ];
        state.source_rows = (1..=rows)
            .map(|pk| vec![SqlValue::I64(pk), SqlValue::Text(format!("row-{pk}"))])
            .collect();
    }

    pub fn set_unique_columns(&self, columns: &[&str]) {
        self.lock().unique_columns = columns.iter().map(|c| c.to_string()).collect();
    }

    pub fn fail_commits(&self, n: u32) {
        self.fail_next_commits.store(n, AtomicOrdering::SeqCst);
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn column_index(columns: &[ColumnMeta], name: &str) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| CopyError::Config(format!("unknown column {name}")))
    }
}

fn compare_values(a: &SqlValue, b: &SqlValue) -> Ordering {
    match (a, b) {
        (SqlValue::I64(x), SqlValue::I64(y)) => x.cmp(y),
        (SqlValue::I32(x), SqlValue::I32(y)) => x.cmp(y),
        _ => a.to_boundary().cmp(&b.to_boundary()),
    }
}

#[async_trait]
impl DialectRepository for MockDialect {
    fn dialect_name(&self) -> &'static str {
        "mock"
    }

    async fn row_count(&self, _table: &str) -> Result<i64> {
        Ok(self.lock().source_rows.len() as i64)
    }

    async fn all_column_names(&self, _table: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .source_columns
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    async fn column_metadata(&self, _table: &str) -> Result<Vec<ColumnMeta>> {
        Ok(self.lock().source_columns.clone())
    }

    async fn unique_columns(&self, _table: &str) -> Result<Vec<String>> {
        Ok(self.lock().unique_columns.clone())
    }

    async fn batch_markers(&self, query: &MarkersQuery) -> Result<Vec<SqlValue>> {
        let state = self.lock();
        let idx = Self::column_index(&state.source_columns, &query.column)?;
        let mut values: Vec<SqlValue> =
            state.source_rows.iter().map(|r| r[idx].clone()).collect();
        values.sort_by(compare_values);
        Ok(values
            .into_iter()
            .step_by(query.page_size.max(1))
            .collect())
    }

    async fn seek_page(&self, query: &SeekQuery) -> Result<Page> {
        let state = self.lock();
        let idx = Self::column_index(&state.source_columns, &query.column)?;
        let mut rows: Vec<Vec<SqlValue>> = state
            .source_rows
            .iter()
            .filter(|r| {
                let v = &r[idx];
                let lower_ok = query
                    .lower
                    .as_ref()
                    .map_or(true, |l| compare_values(v, l) != Ordering::Less);
                let upper_ok = query
                    .upper
                    .as_ref()
                    .map_or(true, |u| compare_values(v, u) == Ordering::Less);
                lower_ok && upper_ok
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
        rows.truncate(query.page_size);
        Ok(Page::new(query.batch_id, state.source_columns.clone(), rows))
    }

    async fn offset_page(&self, query: &OffsetQuery) -> Result<Page> {
        let state = self.lock();
        let order_col = query
            .order_columns
            .first()
            .ok_or_else(|| CopyError::Config("offset query without order columns".into()))?;
        let idx = Self::column_index(&state.source_columns, order_col)?;
        let mut rows = state.source_rows.clone();
        rows.sort_by(|a, b| compare_values(&a[idx], &b[idx]));
        let rows: Vec<Vec<SqlValue>> = rows
            .into_iter()
            .skip(query.offset as usize)
            .take(query.page_size)
            .collect();
        Ok(Page::new(query.batch_id, state.source_columns.clone(), rows))
    }

    async fn full_page(&self, _table: &str, batch_id: u32) -> Result<Page> {
        let state = self.lock();
        Ok(Page::new(
            batch_id,
            state.source_columns.clone(),
            state.source_rows.clone(),
        ))
    }

    async fn truncate_table(&self, _table: &str) -> Result<()> {
        let mut state = self.lock();
        state.target_rows.clear();
        state.truncate_calls += 1;
        Ok(())
    }

    async fn disable_indexes(&self, _table: &str) -> Result<()> {
        self.lock().disable_calls += 1;
        Ok(())
    }

    async fn enable_indexes(&self, _table: &str) -> Result<()> {
        self.lock().enable_calls += 1;
        Ok(())
    }

    async fn drop_indexes(&self, _table: &str) -> Result<()> {
        self.lock().drop_calls += 1;
        Ok(())
    }

    async fn commit_page(&self, commit: PageCommit) -> Result<u64> {
        if self
            .fail_next_commits
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return Err(CopyError::transfer(&commit.target_table, "injected failure"));
        }

        let written = commit.rows.len() as u64;
        {
            let mut state = self.lock();
            state.target_columns = commit.columns.clone();
            match &commit.upsert_key {
                Some(key) => {
                    let key_idx = commit
                        .columns
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(key))
                        .ok_or_else(|| {
                            CopyError::Config(format!("upsert key {key} not in columns"))
                        })?;
                    for row in &commit.rows {
                        let existing = state.target_rows.iter_mut().find(|r| {
                            compare_values(&r[key_idx], &row[key_idx]) == Ordering::Equal
                        });
                        match existing {
                            Some(target) => *target = row.clone(),
                            None => state.target_rows.push(row.clone()),
                        }
                    }
                }
                None => state.target_rows.extend(commit.rows.iter().cloned()),
            }
            state.commits.push(commit.clone());
        }

        if let Some(batch) = &commit.batch {
            self.repository.complete_batch(
                &batch.migration_id,
                &batch.pipeline_name,
                batch.batch_id,
            )?;
        }
        Ok(written)
    }
}
