//! Database-agnostic cell values.
//!
//! Pages exchange owned values: a page crosses from a reader task to a writer
//! worker exactly once, so there is no borrow to preserve across that handoff.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint carried by NULL values so the writer can render a correctly
/// typed placeholder for the target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Text,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// A single column value read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with a type hint.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Render as a SQL literal for a batched statement.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::I16(n) => n.to_string(),
            SqlValue::I32(n) => n.to_string(),
            SqlValue::I64(n) => n.to_string(),
            SqlValue::F32(n) => n.to_string(),
            SqlValue::F64(n) => n.to_string(),
            SqlValue::Text(s) => format!("'{}'", escape_sql_string(s)),
            SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b)),
            SqlValue::Uuid(u) => format!("'{}'::uuid", u),
            SqlValue::Decimal(d) => format!("{}::numeric", d),
            SqlValue::DateTime(dt) => {
                format!("'{}'::timestamp", dt.format("%Y-%m-%d %H:%M:%S%.6f"))
            }
            SqlValue::DateTimeOffset(dt) => format!("'{}'::timestamptz", dt.to_rfc3339()),
            SqlValue::Date(d) => format!("'{}'::date", d),
            SqlValue::Time(t) => format!("'{}'::time", t),
        }
    }

    /// Plain string rendering used for persisted batch boundaries.
    pub fn to_boundary(&self) -> String {
        match self {
            SqlValue::Text(s) => s.clone(),
            SqlValue::Uuid(u) => u.to_string(),
            other => other.to_literal(),
        }
    }

    /// Reconstruct a boundary value persisted by [`to_boundary`].
    ///
    /// Key columns used for seek batching are numeric in practice; anything
    /// that does not parse as an integer round-trips as text.
    pub fn from_boundary(s: &str) -> SqlValue {
        match s.parse::<i64>() {
            Ok(n) => SqlValue::I64(n),
            Err(_) => SqlValue::Text(s.to_string()),
        }
    }
}

/// Escape a string for use inside a single-quoted SQL literal.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_rendering() {
        assert_eq!(SqlValue::Null(SqlNullType::Text).to_literal(), "NULL");
        assert_eq!(SqlValue::Bool(true).to_literal(), "TRUE");
        assert_eq!(SqlValue::I64(42).to_literal(), "42");
        assert_eq!(SqlValue::Text("abc".into()).to_literal(), "'abc'");
        assert_eq!(
            SqlValue::Text("O'Hara".into()).to_literal(),
            "'O''Hara'"
        );
        assert_eq!(
            SqlValue::Bytes(vec![0xde, 0xad]).to_literal(),
            "'\\xdead'::bytea"
        );
    }

    #[test]
    fn date_literals_are_cast() {
        let d = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        assert_eq!(SqlValue::Date(d).to_literal(), "'2021-03-14'::date");
    }

    #[test]
    fn boundary_round_trip() {
        assert_eq!(
            SqlValue::from_boundary(&SqlValue::I64(100).to_boundary()),
            SqlValue::I64(100)
        );
        assert_eq!(
            SqlValue::from_boundary("user-42"),
            SqlValue::Text("user-42".into())
        );
    }
}
