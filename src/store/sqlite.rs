//! Local SQLite backend.
//!
//! Rows are stored as JSON documents in `records`, filtered with
//! `json_extract`. The serial counter is a single upsert with `RETURNING`,
//! which SQLite executes atomically.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};
use std::sync::Arc;

use super::{Direction, Filter, Query, RelationalStore, Row, StoreError, Table};
use crate::db::Database;

pub struct SqliteStore {
    db: Arc<Database>,
}

enum SqlValue {
    Text(String),
    Integer(i64),
    Real(f64),
}

impl SqlValue {
    /// JSON scalars as `json_extract` returns them; booleans become 0/1.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(SqlValue::Text(text.clone())),
            Value::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
            Value::Number(number) => number
                .as_i64()
                .map(SqlValue::Integer)
                .or_else(|| number.as_f64().map(SqlValue::Real)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn push(self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            SqlValue::Text(text) => qb.push_bind(text),
            SqlValue::Integer(number) => qb.push_bind(number),
            SqlValue::Real(number) => qb.push_bind(number),
        };
    }
}

fn json_path(column: &str) -> String {
    format!("$.\"{}\"", column)
}

fn push_column(qb: &mut QueryBuilder<'_, Sqlite>, column: &str) {
    qb.push("json_extract(body, ");
    qb.push_bind(json_path(column));
    qb.push(")");
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Sqlite>,
    operator: &str,
    value: &Value,
) -> Result<(), StoreError> {
    let value = SqlValue::from_json(value)
        .ok_or_else(|| StoreError::Api(format!("cannot compare against {}", value)))?;
    qb.push(operator);
    value.push(qb);
    Ok(())
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &Query) -> Result<(), StoreError> {
    for filter in &query.filters {
        qb.push(" AND ");
        push_column(qb, filter.column());
        match filter {
            Filter::Eq(_, Value::Null) | Filter::IsNull(_) => {
                qb.push(" IS NULL");
            }
            Filter::NotNull(_) => {
                qb.push(" IS NOT NULL");
            }
            Filter::Eq(_, value) => push_comparison(qb, " = ", value)?,
            Filter::Gte(_, value) => push_comparison(qb, " >= ", value)?,
            Filter::Lt(_, value) => push_comparison(qb, " < ", value)?,
        }
    }
    Ok(())
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn unique_violation(error: &sqlx::Error) -> bool {
        matches!(error, sqlx::Error::Database(e) if e.is_unique_violation())
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT body FROM records WHERE table_name = ");
        qb.push_bind(table.name());
        push_filters(&mut qb, query)?;

        if let Some(order) = &query.order {
            // Nulls last, matching the in-memory ordering.
            qb.push(" ORDER BY ");
            push_column(&mut qb, &order.column);
            qb.push(" IS NULL, ");
            push_column(&mut qb, &order.column);
            qb.push(match order.direction {
                Direction::Ascending => " ASC",
                Direction::Descending => " DESC",
            });
        }

        let bodies: Vec<(String,)> = qb.build_query_as().fetch_all(self.db.pool()).await?;

        bodies
            .into_iter()
            .map(|(body,)| serde_json::from_str::<Row>(&body).map_err(StoreError::from))
            .collect()
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let mut tx = self.db.pool().begin().await?;

        for row in rows {
            let key = table.row_key(&row)?;
            let body = serde_json::to_string(&row)?;

            let result =
                sqlx::query("INSERT INTO records (table_name, record_key, body) VALUES (?, ?, ?)")
                    .bind(table.name())
                    .bind(&key)
                    .bind(body)
                    .execute(&mut *tx)
                    .await;

            match result {
                Ok(_) => {}
                Err(e) if Self::unique_violation(&e) => {
                    return Err(StoreError::Conflict {
                        table: table.name(),
                        key,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, table: Table, query: &Query, patch: Row) -> Result<u64, StoreError> {
        if patch.contains_key(table.key_column()) {
            return Err(StoreError::Api(format!(
                "cannot rewrite key column {} of {}",
                table.key_column(),
                table.name()
            )));
        }
        if patch.is_empty() {
            return Ok(self.select(table, query).await?.len() as u64);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE records SET body = json_set(body");
        for (column, value) in &patch {
            qb.push(", ");
            qb.push_bind(json_path(column));
            qb.push(", json(");
            qb.push_bind(value.to_string());
            qb.push(")");
        }
        qb.push(") WHERE table_name = ");
        qb.push_bind(table.name());
        push_filters(&mut qb, query)?;

        let result = qb.build().execute(self.db.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, table: Table, query: &Query) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM records WHERE table_name = ");
        qb.push_bind(table.name());
        push_filters(&mut qb, query)?;

        let result = qb.build().execute(self.db.pool()).await?;
        Ok(result.rows_affected())
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let key = table.row_key(&row)?;
        let body = serde_json::to_string(&row)?;

        sqlx::query(
            r#"
            INSERT INTO records (table_name, record_key, body) VALUES (?, ?, ?)
            ON CONFLICT(table_name, record_key) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(table.name())
        .bind(key)
        .bind(body)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn next_invoice_serial(&self, prefix: &str, date_key: &str) -> Result<u32, StoreError> {
        let (serial,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO invoice_serials (prefix, date_key, last_serial) VALUES (?, ?, 1)
            ON CONFLICT(prefix, date_key) DO UPDATE SET last_serial = last_serial + 1
            RETURNING last_serial
            "#,
        )
        .bind(prefix)
        .bind(date_key)
        .fetch_one(self.db.pool())
        .await?;

        u32::try_from(serial).map_err(|_| StoreError::Api(format!("serial out of range: {}", serial)))
    }
}
