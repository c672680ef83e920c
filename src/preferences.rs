//! Per-user key-value preferences.
//!
//! All keys of a user live in one `user_preferences` row. Writes are
//! version-checked updates, so two writers never lose each other's keys.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::auth::{current_user_id, AuthProvider};
use crate::clock::{self, Clock};
use crate::store::{Query, RelationalStore, Row, StoreError, Table};

const MAX_WRITE_ATTEMPTS: usize = 3;

pub const DARK_MODE_KEY: &str = "darkMode";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key` for the current user.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Returns false when signed out or the write failed.
    async fn set(&self, key: &str, value: Value) -> bool;

    async fn remove(&self, key: &str) -> bool;

    async fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).await.unwrap_or(default)
    }

    /// Write several keys; true only if every write landed.
    async fn set_many(&self, entries: Map<String, Value>) -> bool {
        let mut all = true;
        for (key, value) in entries {
            all &= self.set(&key, value).await;
        }
        all
    }
}

pub struct PreferenceStore {
    store: Arc<dyn RelationalStore>,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
}

struct PreferenceRow {
    preferences: Map<String, Value>,
    version: i64,
}

enum WriteOutcome {
    Written,
    Unchanged,
    Raced,
}

impl PreferenceStore {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, auth, clock }
    }

    async fn load(&self, user_id: &str) -> Result<Option<PreferenceRow>, StoreError> {
        let rows = self
            .store
            .select(Table::UserPreferences, &Query::new().eq("user_id", user_id))
            .await?;

        Ok(rows.into_iter().next().map(|row| PreferenceRow {
            preferences: match row.get("preferences") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            },
            version: row.get("version").and_then(Value::as_i64).unwrap_or(0),
        }))
    }

    /// Apply `edit` to the user's map with optimistic concurrency. `edit`
    /// returns false when it changed nothing.
    async fn modify<F>(&self, user_id: &str, edit: F) -> Result<bool, StoreError>
    where
        F: Fn(&mut Map<String, Value>) -> bool + Send + Sync,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.try_modify(user_id, &edit).await? {
                WriteOutcome::Written => return Ok(true),
                WriteOutcome::Unchanged => return Ok(false),
                WriteOutcome::Raced => {
                    tracing::debug!(
                        "Preference write for {} raced (attempt {}), retrying",
                        user_id,
                        attempt
                    );
                }
            }
        }
        Err(StoreError::Api(format!(
            "preferences for {} kept changing underneath us",
            user_id
        )))
    }

    async fn try_modify<F>(&self, user_id: &str, edit: &F) -> Result<WriteOutcome, StoreError>
    where
        F: Fn(&mut Map<String, Value>) -> bool + Send + Sync,
    {
        let updated_at = json!(clock::format_timestamp(self.clock.now()));

        match self.load(user_id).await? {
            None => {
                let mut preferences = Map::new();
                if !edit(&mut preferences) {
                    return Ok(WriteOutcome::Unchanged);
                }
                let row = preference_row(user_id, preferences, 1, updated_at);
                match self.store.insert(Table::UserPreferences, vec![row]).await {
                    Ok(()) => Ok(WriteOutcome::Written),
                    Err(StoreError::Conflict { .. }) => Ok(WriteOutcome::Raced),
                    Err(e) => Err(e),
                }
            }
            Some(PreferenceRow {
                mut preferences,
                version,
            }) => {
                if !edit(&mut preferences) {
                    return Ok(WriteOutcome::Unchanged);
                }
                let mut patch = Row::new();
                patch.insert("preferences".to_string(), Value::Object(preferences));
                patch.insert("version".to_string(), json!(version + 1));
                patch.insert("updated_at".to_string(), updated_at);

                let query = Query::new().eq("user_id", user_id).eq("version", version);
                let changed = self
                    .store
                    .update(Table::UserPreferences, &query, patch)
                    .await?;
                Ok(if changed == 0 {
                    WriteOutcome::Raced
                } else {
                    WriteOutcome::Written
                })
            }
        }
    }

    /// All preferences of the current user; empty when signed out.
    pub async fn snapshot(&self) -> Map<String, Value> {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return Map::new();
        };
        match self.load(&user_id).await {
            Ok(row) => row.map(|r| r.preferences).unwrap_or_default(),
            Err(e) => {
                tracing::error!("Error reading preferences for {}: {}", user_id, e);
                Map::new()
            }
        }
    }

    /// Write several keys at once.
    pub async fn merge(&self, values: Map<String, Value>) -> bool {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return false;
        };
        let result = self
            .modify(&user_id, |preferences| {
                for (key, value) in &values {
                    preferences.insert(key.clone(), value.clone());
                }
                true
            })
            .await;
        log_write(&user_id, "merge", result.map(|_| true))
    }

    /// Empty the current user's map.
    pub async fn clear_all(&self) -> bool {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return false;
        };
        let result = self
            .modify(&user_id, |preferences| {
                let had_keys = !preferences.is_empty();
                preferences.clear();
                had_keys
            })
            .await;
        log_write(&user_id, "clear", result.map(|_| true))
    }

    /// Dark mode is on unless the user turned it off.
    pub async fn dark_mode(&self) -> bool {
        self.get(DARK_MODE_KEY)
            .await
            .and_then(|value| value.as_bool())
            .unwrap_or(true)
    }

    pub async fn set_dark_mode(&self, enabled: bool) -> bool {
        self.set(DARK_MODE_KEY, Value::Bool(enabled)).await
    }
}

fn preference_row(user_id: &str, preferences: Map<String, Value>, version: i64, updated_at: Value) -> Row {
    let mut row = Row::new();
    row.insert("user_id".to_string(), json!(user_id));
    row.insert("preferences".to_string(), Value::Object(preferences));
    row.insert("version".to_string(), json!(version));
    row.insert("updated_at".to_string(), updated_at);
    row
}

fn log_write(user_id: &str, action: &str, result: Result<bool, StoreError>) -> bool {
    match result {
        Ok(done) => done,
        Err(e) => {
            tracing::error!("Preference {} failed for {}: {}", action, user_id, e);
            false
        }
    }
}

#[async_trait]
impl KeyValueStore for PreferenceStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.snapshot().await.remove(key)
    }

    async fn set(&self, key: &str, value: Value) -> bool {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return false;
        };
        let result = self
            .modify(&user_id, |preferences| {
                preferences.insert(key.to_string(), value.clone());
                true
            })
            .await;
        log_write(&user_id, "set", result.map(|_| true))
    }

    async fn set_many(&self, entries: Map<String, Value>) -> bool {
        self.merge(entries).await
    }

    async fn remove(&self, key: &str) -> bool {
        let Some(user_id) = current_user_id(self.auth.as_ref()).await else {
            return false;
        };
        // Removing an absent key counts as success.
        let result = self
            .modify(&user_id, |preferences| preferences.remove(key).is_some())
            .await;
        log_write(&user_id, "remove", result.map(|_| true))
    }
}
