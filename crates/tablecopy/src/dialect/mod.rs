//! Dialect collaborator: everything the core asks a database product for.
//!
//! The copy pipeline never builds product-specific SQL itself; it describes
//! reads and writes through the structures below and lets the selected
//! dialect implementation build and execute the statements. One
//! implementation exists per database product, chosen once at startup from
//! the connection string.

mod postgres;

pub use postgres::PostgresRepository;

use crate::core::{ColumnMeta, Page, SqlValue};
use crate::error::{CopyError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// A seek-batched read: ordered scan of `[lower, upper)` on a key column.
#[derive(Debug, Clone)]
pub struct SeekQuery {
    pub table: String,
    pub column: String,
    /// Inclusive lower bound; `None` for the first batch.
    pub lower: Option<SqlValue>,
    /// Exclusive upper bound; `None` for the last batch.
    pub upper: Option<SqlValue>,
    pub page_size: usize,
    pub batch_id: u32,
}

/// An offset-batched read ordered by a unique column set.
#[derive(Debug, Clone)]
pub struct OffsetQuery {
    pub table: String,
    pub order_columns: Vec<String>,
    pub offset: u64,
    pub page_size: usize,
    pub batch_id: u32,
}

/// Marker sampling: every `page_size`-th value of the key column, ordered.
#[derive(Debug, Clone)]
pub struct MarkersQuery {
    pub table: String,
    pub column: String,
    pub page_size: usize,
}

/// Reference to a pending batch descriptor, resolved by the dialect into the
/// descriptor delete inside the page transaction.
#[derive(Debug, Clone)]
pub struct BatchRef {
    pub migration_id: String,
    pub pipeline_name: String,
    pub batch_id: u32,
}

/// One page worth of writes committed as a single transaction.
///
/// When `batch` is set, the dialect deletes the pending batch descriptor in
/// the same transaction as the write; exactly one descriptor row must go.
#[derive(Debug, Clone)]
pub struct PageCommit {
    pub target_table: String,
    /// Column names in row order.
    pub columns: Vec<String>,
    /// Rows with nullify/override rules already applied.
    pub rows: Vec<Vec<SqlValue>>,
    /// Upsert key column for incremental mode; `None` means plain INSERT.
    pub upsert_key: Option<String>,
    pub batch: Option<BatchRef>,
}

/// Capability interface of one database product.
#[async_trait]
pub trait DialectRepository: Send + Sync {
    fn dialect_name(&self) -> &'static str;

    // ===== Introspection =====

    async fn row_count(&self, table: &str) -> Result<i64>;

    async fn all_column_names(&self, table: &str) -> Result<Vec<String>>;

    async fn column_metadata(&self, table: &str) -> Result<Vec<ColumnMeta>>;

    /// Columns of some unique index on the table, if one exists.
    async fn unique_columns(&self, table: &str) -> Result<Vec<String>>;

    // ===== Batched reads =====

    async fn batch_markers(&self, query: &MarkersQuery) -> Result<Vec<SqlValue>>;

    async fn seek_page(&self, query: &SeekQuery) -> Result<Page>;

    async fn offset_page(&self, query: &OffsetQuery) -> Result<Page>;

    /// The whole table as one page. Memory-risk fallback for tables with no
    /// usable batching column.
    async fn full_page(&self, table: &str, batch_id: u32) -> Result<Page>;

    // ===== Target maintenance =====

    async fn truncate_table(&self, table: &str) -> Result<()>;

    /// Take non-key indexes out of play before bulk writes. Restored by
    /// [`enable_indexes`](DialectRepository::enable_indexes).
    async fn disable_indexes(&self, table: &str) -> Result<()>;

    async fn enable_indexes(&self, table: &str) -> Result<()>;

    /// Drop non-key indexes permanently.
    async fn drop_indexes(&self, table: &str) -> Result<()>;

    // ===== Writes =====

    /// Execute one page as a single batched statement and commit it together
    /// with the batch-descriptor delete. Returns the written row count.
    async fn commit_page(&self, commit: PageCommit) -> Result<u64>;
}

/// Select the dialect implementation from a connection string.
pub async fn from_connection_string(
    url: &str,
    pool_size: usize,
) -> Result<Arc<dyn DialectRepository>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let repo = PostgresRepository::connect(url, pool_size).await?;
        return Ok(Arc::new(repo));
    }
    Err(CopyError::Config(format!(
        "unsupported connection string (expected postgres://): {url}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_a_config_error() {
        let err = from_connection_string("mysql://host/db", 4).await.err().unwrap();
        assert!(matches!(err, CopyError::Config(_)));
    }
}
