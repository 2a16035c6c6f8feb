//! Copy items: one source-table to target-table pipeline each.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One table copy unit. Immutable once built; the pipeline name derived from
/// the (source, target) pair is its identity everywhere: task rows, batch
/// rows, log fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyItem {
    /// Source table name.
    pub source_table: String,

    /// Target table name.
    pub target_table: String,

    /// Fixed column-value overrides applied to every written row.
    #[serde(default)]
    pub column_overrides: HashMap<String, String>,

    /// Estimated source row count at scheduling time.
    pub source_row_count: i64,
}

impl CopyItem {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            column_overrides: HashMap::new(),
            source_row_count: 0,
        }
    }

    pub fn with_row_count(mut self, rows: i64) -> Self {
        self.source_row_count = rows;
        self
    }

    pub fn with_override(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.column_overrides.insert(column.into(), value.into());
        self
    }

    /// Pipeline identity, `source->target`.
    pub fn pipeline_name(&self) -> String {
        format!("{}->{}", self.source_table, self.target_table)
    }

    /// Fixed override for a column, if configured (case-insensitive).
    pub fn override_for(&self, column: &str) -> Option<&str> {
        self.column_overrides
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_name_is_the_table_pair() {
        let item = CopyItem::new("users", "users_v2");
        assert_eq!(item.pipeline_name(), "users->users_v2");
    }

    #[test]
    fn override_lookup_ignores_case() {
        let item = CopyItem::new("users", "users").with_override("TenantId", "42");
        assert_eq!(item.override_for("tenantid"), Some("42"));
        assert_eq!(item.override_for("name"), None);
    }
}
