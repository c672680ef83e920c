//! Relational store seam
//!
//! Table-scoped reads and writes over JSON rows plus the atomic invoice
//! serial counter. Backends:
//! - `MemoryStore`: in-process tables
//! - `SqliteStore`: local SQLite document rows (sqlx)
//! - `SupabaseStore`: PostgREST over HTTP

mod memory;
mod query;
mod sqlite;
mod supabase;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use query::{compare_values, Direction, Filter, Order, Query};
pub use sqlite::SqliteStore;
pub use supabase::{SupabaseConfig, SupabaseStore};

/// A single record, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Duplicate key {key} in {table}")]
    Conflict { table: &'static str, key: String },

    #[error("Row for {0} is missing its key column")]
    MissingKey(&'static str),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Tables the desk reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Notifications,
    UserSessions,
    UserPreferences,
    Invoices,
    Users,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Notifications => "notifications",
            Table::UserSessions => "user_sessions",
            Table::UserPreferences => "user_preferences",
            Table::Invoices => "invoices",
            Table::Users => "users",
        }
    }

    /// Column that uniquely identifies a row; upserts conflict on it.
    pub fn key_column(self) -> &'static str {
        match self {
            Table::Notifications | Table::Invoices | Table::Users => "id",
            Table::UserSessions | Table::UserPreferences => "user_id",
        }
    }

    /// Extract the key of `row` as text.
    pub fn row_key(self, row: &Row) -> Result<String, StoreError> {
        match row.get(self.key_column()) {
            Some(Value::String(key)) => Ok(key.clone()),
            Some(Value::Number(key)) => Ok(key.to_string()),
            _ => Err(StoreError::MissingKey(self.name())),
        }
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError>;

    /// Set the columns in `patch` on every matching row. Returns the number
    /// of rows changed.
    async fn update(&self, table: Table, query: &Query, patch: Row) -> Result<u64, StoreError>;

    /// Returns the number of rows removed.
    async fn delete(&self, table: Table, query: &Query) -> Result<u64, StoreError>;

    /// Insert, or replace the row sharing the table's key column.
    async fn upsert(&self, table: Table, row: Row) -> Result<(), StoreError>;

    /// Atomically increment and return the serial for (prefix, date_key).
    /// The first call for a pair returns 1.
    async fn next_invoice_serial(&self, prefix: &str, date_key: &str) -> Result<u32, StoreError>;
}

/// Convert a serializable record into a row.
pub fn to_row<T: serde::Serialize>(record: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Api(format!("expected an object row, got {}", other))),
    }
}

pub fn from_row<T: serde::de::DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(row))?)
}
