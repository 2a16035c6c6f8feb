//! PostgreSQL dialect implementation.

use super::{
    BatchRef, DialectRepository, MarkersQuery, OffsetQuery, PageCommit, SeekQuery,
};
use crate::core::{ColumnMeta, Page, SqlNullType, SqlValue};
use crate::error::{CopyError, Result};
use crate::repository::pg::BATCH_DELETE_SQL;
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use tokio_postgres::{NoTls, Row, SimpleQueryMessage};
use tracing::debug;

/// Dialect repository for PostgreSQL sources and targets.
pub struct PostgresRepository {
    pool: Pool,
    /// Index DDL captured by `disable_indexes`, replayed by `enable_indexes`.
    /// PostgreSQL cannot switch an index off in place, so disable means
    /// save-and-drop, enable means recreate.
    saved_indexes: Mutex<HashMap<String, Vec<String>>>,
}

impl PostgresRepository {
    /// Connect a pooled dialect repository.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let pg_config = tokio_postgres::Config::from_str(url)
            .map_err(|e| CopyError::Config(format!("invalid connection string: {e}")))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| CopyError::pool(e.to_string(), "building connection pool"))?;
        Ok(Self {
            pool,
            saved_indexes: Mutex::new(HashMap::new()),
        })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        Ok(self.pool.get().await?)
    }

    /// Bare relation name without a schema qualifier, for catalog lookups.
    fn relation_name(table: &str) -> &str {
        table.rsplit('.').next().unwrap_or(table)
    }

    async fn select_page(&self, sql: &str, batch_id: u32) -> Result<Page> {
        let client = self.client().await?;
        let rows = client.query(sql, &[]).await?;
        rows_to_page(&rows, batch_id)
    }
}

#[async_trait]
impl DialectRepository for PostgresRepository {
    fn dialect_name(&self) -> &'static str {
        "postgres"
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(&format!("SELECT COUNT(*) FROM {}", quote_table(table)), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn all_column_names(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .column_metadata(table)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn column_metadata(&self, table: &str) -> Result<Vec<ColumnMeta>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT column_name, data_type, numeric_precision, numeric_scale
                 FROM information_schema.columns
                 WHERE table_name = $1
                 ORDER BY ordinal_position",
                &[&Self::relation_name(table)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| ColumnMeta {
                name: r.get(0),
                type_code: r.get::<_, String>(1).to_ascii_lowercase(),
                precision: r.get(2),
                scale: r.get(3),
            })
            .collect())
    }

    async fn unique_columns(&self, table: &str) -> Result<Vec<String>> {
        let client = self.client().await?;
        // Smallest unique index wins; it gives the cheapest stable ordering.
        let rows = client
            .query(
                "SELECT a.attname
                 FROM pg_index x
                 JOIN pg_class c ON c.oid = x.indrelid
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(x.indkey)
                 WHERE c.relname = $1 AND x.indisunique
                   AND x.indexrelid = (
                       SELECT x2.indexrelid FROM pg_index x2
                       JOIN pg_class c2 ON c2.oid = x2.indrelid
                       WHERE c2.relname = $1 AND x2.indisunique
                       ORDER BY x2.indnatts ASC LIMIT 1
                   )",
                &[&Self::relation_name(table)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn batch_markers(&self, query: &MarkersQuery) -> Result<Vec<SqlValue>> {
        let sql = build_markers_sql(query);
        let client = self.client().await?;
        let rows = client.query(&sql, &[]).await?;
        rows.iter().map(|r| column_value(r, 0)).collect()
    }

    async fn seek_page(&self, query: &SeekQuery) -> Result<Page> {
        self.select_page(&build_seek_sql(query), query.batch_id).await
    }

    async fn offset_page(&self, query: &OffsetQuery) -> Result<Page> {
        self.select_page(&build_offset_sql(query), query.batch_id)
            .await
    }

    async fn full_page(&self, table: &str, batch_id: u32) -> Result<Page> {
        self.select_page(&format!("SELECT * FROM {}", quote_table(table)), batch_id)
            .await
    }

    async fn truncate_table(&self, table: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(&format!("TRUNCATE TABLE {}", quote_table(table)), &[])
            .await?;
        Ok(())
    }

    async fn disable_indexes(&self, table: &str) -> Result<()> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT i.relname, pg_get_indexdef(x.indexrelid)
                 FROM pg_index x
                 JOIN pg_class c ON c.oid = x.indrelid
                 JOIN pg_class i ON i.oid = x.indexrelid
                 WHERE c.relname = $1 AND NOT x.indisprimary",
                &[&Self::relation_name(table)],
            )
            .await?;

        let mut definitions = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get(0);
            let definition: String = row.get(1);
            debug!("Dropping index {} on {}", name, table);
            client
                .execute(&format!("DROP INDEX IF EXISTS {}", quote_ident(&name)), &[])
                .await?;
            definitions.push(definition);
        }

        self.saved_indexes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(table.to_string(), definitions);
        Ok(())
    }

    async fn enable_indexes(&self, table: &str) -> Result<()> {
        let definitions = self
            .saved_indexes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(table)
            .unwrap_or_default();

        let client = self.client().await?;
        for definition in definitions {
            debug!("Rebuilding index on {}: {}", table, definition);
            client.execute(&definition, &[]).await?;
        }
        Ok(())
    }

    async fn drop_indexes(&self, table: &str) -> Result<()> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT i.relname
                 FROM pg_index x
                 JOIN pg_class c ON c.oid = x.indrelid
                 JOIN pg_class i ON i.oid = x.indexrelid
                 WHERE c.relname = $1 AND NOT x.indisprimary",
                &[&Self::relation_name(table)],
            )
            .await?;
        for row in &rows {
            let name: String = row.get(0);
            debug!("Dropping index {} on {}", name, table);
            client
                .execute(&format!("DROP INDEX IF EXISTS {}", quote_ident(&name)), &[])
                .await?;
        }
        Ok(())
    }

    async fn commit_page(&self, commit: PageCommit) -> Result<u64> {
        if commit.rows.is_empty() {
            return Ok(0);
        }

        let statement = match &commit.upsert_key {
            Some(key) => build_upsert_sql(&commit.target_table, &commit.columns, key, &commit.rows),
            None => build_insert_sql(&commit.target_table, &commit.columns, &commit.rows),
        };

        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let messages = tx.simple_query(&statement).await?;
        let written = messages
            .iter()
            .find_map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(commit.rows.len() as u64);

        if let Some(BatchRef {
            migration_id,
            pipeline_name,
            batch_id,
        }) = &commit.batch
        {
            let deleted = tx
                .execute(
                    BATCH_DELETE_SQL,
                    &[migration_id, pipeline_name, &(*batch_id as i32)],
                )
                .await?;
            if deleted != 1 {
                return Err(CopyError::transfer(
                    pipeline_name,
                    format!("no (exact) match for batch {batch_id}"),
                ));
            }
        }

        tx.commit().await?;
        Ok(written)
    }
}

/// Quote a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name.
pub fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

fn build_markers_sql(query: &MarkersQuery) -> String {
    let column = quote_ident(&query.column);
    format!(
        "SELECT t.{column} FROM (SELECT {column}, (ROW_NUMBER() OVER (ORDER BY {column}))-1 AS rownum FROM {table}) t WHERE t.rownum % {page_size} = 0 ORDER BY t.{column}",
        column = column,
        table = quote_table(&query.table),
        page_size = query.page_size,
    )
}

fn build_seek_sql(query: &SeekQuery) -> String {
    let column = quote_ident(&query.column);
    let mut conditions = Vec::new();
    if let Some(lower) = &query.lower {
        conditions.push(format!("{} >= {}", column, lower.to_literal()));
    }
    if let Some(upper) = &query.upper {
        conditions.push(format!("{} < {}", column, upper.to_literal()));
    }
    let mut sql = format!("SELECT * FROM {}", quote_table(&query.table));
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {} LIMIT {}", column, query.page_size));
    sql
}

fn build_offset_sql(query: &OffsetQuery) -> String {
    let order_by = query
        .order_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT * FROM {} ORDER BY {} OFFSET {} LIMIT {}",
        quote_table(&query.table),
        order_by,
        query.offset,
        query.page_size,
    )
}

/// Build one multi-row INSERT with literal values.
fn build_insert_sql(table: &str, columns: &[String], rows: &[Vec<SqlValue>]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let value_rows: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(SqlValue::to_literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_table(table),
        col_list,
        value_rows.join(", ")
    )
}

/// Build one multi-row upsert keyed by the chosen column.
fn build_upsert_sql(
    table: &str,
    columns: &[String],
    upsert_key: &str,
    rows: &[Vec<SqlValue>],
) -> String {
    let insert = build_insert_sql(table, columns, rows);
    let update_cols: Vec<String> = columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(upsert_key))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    if update_cols.is_empty() {
        format!(
            "{} ON CONFLICT ({}) DO NOTHING",
            insert,
            quote_ident(upsert_key)
        )
    } else {
        format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}",
            insert,
            quote_ident(upsert_key),
            update_cols.join(", ")
        )
    }
}

/// Convert a driver row set into a page.
fn rows_to_page(rows: &[Row], batch_id: u32) -> Result<Page> {
    let columns = match rows.first() {
        Some(first) => first
            .columns()
            .iter()
            .map(|c| ColumnMeta::new(c.name(), c.type_().name()))
            .collect(),
        None => Vec::new(),
    };

    let mut converted = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.columns().len());
        for idx in 0..row.columns().len() {
            values.push(column_value(row, idx)?);
        }
        converted.push(values);
    }
    Ok(Page::new(batch_id, columns, converted))
}

/// Convert one driver column value into a [`SqlValue`], keyed by the wire
/// type name.
fn column_value(row: &Row, idx: usize) -> Result<SqlValue> {
    let value = match row.columns()[idx].type_().name() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Bool), SqlValue::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I16), SqlValue::I16),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I32), SqlValue::I32),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::I64), SqlValue::I64),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::F32), SqlValue::F32),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::F64), SqlValue::F64),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Bytes), SqlValue::Bytes),
        "uuid" => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Uuid), SqlValue::Uuid),
        "numeric" => row
            .try_get::<_, Option<rust_decimal::Decimal>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Decimal), SqlValue::Decimal),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::DateTime), SqlValue::DateTime),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::FixedOffset>>>(idx)?
            .map_or(
                SqlValue::Null(SqlNullType::DateTimeOffset),
                SqlValue::DateTimeOffset,
            ),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Date), SqlValue::Date),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Time), SqlValue::Time),
        // Everything else travels as text.
        _ => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(SqlValue::Null(SqlNullType::Text), SqlValue::Text),
    };
    Ok(value)
}
