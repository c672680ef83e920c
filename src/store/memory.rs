//! In-process relational store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{Query, RelationalStore, Row, StoreError, Table};

#[derive(Default)]
struct Tables {
    rows: HashMap<Table, Vec<Row>>,
    serials: HashMap<(String, String), u32>,
}

/// Tables kept in memory behind one lock, so every operation (including the
/// serial counter) is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held in `table`.
    pub async fn len(&self, table: Table) -> usize {
        self.tables
            .lock()
            .await
            .rows
            .get(&table)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<Row> = tables
            .rows
            .get(&table)
            .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
            .unwrap_or_default();
        query.sort(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let existing = tables.rows.entry(table).or_default();

        // Validate the whole batch first so a conflict inserts nothing.
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = table.row_key(row)?;
            let taken = keys.contains(&key)
                || existing
                    .iter()
                    .any(|other| table.row_key(other).ok().as_deref() == Some(key.as_str()));
            if taken {
                return Err(StoreError::Conflict {
                    table: table.name(),
                    key,
                });
            }
            keys.push(key);
        }

        existing.extend(rows);
        Ok(())
    }

    async fn update(&self, table: Table, query: &Query, patch: Row) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        if let Some(rows) = tables.rows.get_mut(&table) {
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, table: Table, query: &Query) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.rows.get_mut(&table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !query.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        let key = table.row_key(&row)?;
        let mut tables = self.tables.lock().await;
        let rows = tables.rows.entry(table).or_default();
        match rows
            .iter_mut()
            .find(|other| table.row_key(other).ok().as_deref() == Some(key.as_str()))
        {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn next_invoice_serial(&self, prefix: &str, date_key: &str) -> Result<u32, StoreError> {
        let mut tables = self.tables.lock().await;
        let serial = tables
            .serials
            .entry((prefix.to_string(), date_key.to_string()))
            .or_insert(0);
        *serial += 1;
        Ok(*serial)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}
