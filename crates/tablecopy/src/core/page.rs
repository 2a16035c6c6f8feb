//! Pages: one batch worth of rows plus column metadata.

use super::value::SqlValue;

/// Column metadata as reported by the source dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// Dialect type code (SQL type name, lowercased).
    pub type_code: String,
    /// Numeric precision, where applicable.
    pub precision: Option<i32>,
    /// Numeric scale, where applicable.
    pub scale: Option<i32>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_code: type_code.into().to_ascii_lowercase(),
            precision: None,
            scale: None,
        }
    }
}

/// One batch of rows read from the source. Immutable; exchanged exactly once
/// between a reader task and the writer through the pipe.
#[derive(Debug, Clone)]
pub struct Page {
    /// The batch this page was read for.
    pub batch_id: u32,
    /// Column metadata, in row order.
    pub columns: Vec<ColumnMeta>,
    /// Rows; each row has one value per column.
    pub rows: Vec<Vec<SqlValue>>,
}

impl Page {
    pub fn new(batch_id: u32, columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            batch_id,
            columns,
            rows,
        }
    }

    /// An empty page carrying only the batch id.
    pub fn empty(batch_id: u32) -> Self {
        Self::new(batch_id, Vec::new(), Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Index of a column by name, case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Page {
        Page::new(
            7,
            vec![ColumnMeta::new("PK", "bigint"), ColumnMeta::new("name", "text")],
            vec![vec![SqlValue::I64(1), SqlValue::Text("a".into())]],
        )
    }

    #[test]
    fn column_lookup_ignores_case() {
        let p = page();
        assert_eq!(p.column_index("pk"), Some(0));
        assert!(p.has_column("NAME"));
        assert!(!p.has_column("missing"));
    }

    #[test]
    fn empty_page_keeps_batch_id() {
        let p = Page::empty(3);
        assert!(p.is_empty());
        assert_eq!(p.batch_id, 3);
    }
}
