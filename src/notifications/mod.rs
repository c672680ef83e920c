//! Per-user notification mailbox
//!
//! An in-memory view of the user's `notifications` rows. Adds and
//! mark-reads apply locally first and persist after; removals persist first.
//! `load()` folds server truth back in and reruns on the bus signals.

mod mailbox;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::auth::{current_user_id, AuthProvider};
use crate::clock::{self, Clock};
use crate::events::{EventBus, Signal, Subscription};
use crate::store::{from_row, to_row, Direction, Query, RelationalStore, StoreError, Table};

pub use mailbox::Pending;
use mailbox::MailboxState;

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("No signed-in user")]
    NotSignedIn,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "success" => Ok(Severity::Success),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

fn empty_payload() -> Value {
    json!({})
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// `notification_<millisecond epoch>`, unique per user.
    pub id: String,
    pub user_id: String,
    #[serde(with = "clock::rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(rename = "type")]
    pub severity: Severity,
    #[serde(default)]
    pub read: bool,
    #[serde(default = "empty_payload")]
    pub data: Value,
}

struct MailboxInner {
    store: Arc<dyn RelationalStore>,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    state: Mutex<MailboxState>,
    load_seq: AtomicU64,
}

#[derive(Clone)]
pub struct NotificationMailbox {
    inner: Arc<MailboxInner>,
}

impl NotificationMailbox {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                store,
                auth,
                clock,
                state: Mutex::new(MailboxState::default()),
                load_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Cached notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.state.lock().notifications()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.state.lock().unread_count()
    }

    /// Pending tag of an entry whose write is still in flight.
    pub fn pending(&self, id: &str) -> Option<Pending> {
        self.inner.state.lock().pending(id)
    }

    async fn require_user(&self) -> Result<String, MailboxError> {
        current_user_id(self.inner.auth.as_ref())
            .await
            .ok_or(MailboxError::NotSignedIn)
    }

    fn current_load_seq(&self) -> u64 {
        self.inner.load_seq.load(Ordering::SeqCst)
    }

    /// Refresh the cache from the store. Returns the number of cached
    /// entries; a response overtaken by a newer load is dropped.
    pub async fn load(&self) -> Result<usize, MailboxError> {
        let seq = self.inner.load_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let Some(user_id) = current_user_id(self.inner.auth.as_ref()).await else {
            let mut state = self.inner.state.lock();
            if self.current_load_seq() == seq {
                state.reset();
            }
            return Ok(0);
        };

        let query = Query::new()
            .eq("user_id", user_id.as_str())
            .order_by("timestamp", Direction::Descending);
        let rows = match self.inner.store.select(Table::Notifications, &query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("Error loading notifications for {}: {}", user_id, e);
                return Err(e.into());
            }
        };

        let mut fetched = Vec::with_capacity(rows.len());
        for row in rows {
            match from_row::<Notification>(row) {
                Ok(notification) => fetched.push(notification),
                Err(e) => tracing::warn!("Skipping malformed notification row: {}", e),
            }
        }

        let mut state = self.inner.state.lock();
        if self.current_load_seq() != seq {
            tracing::debug!("Discarding stale notification load {}", seq);
            return Ok(state.notifications().len());
        }
        state.apply_load(&user_id, fetched, seq);
        Ok(state.notifications().len())
    }

    /// Add a notification for the current user. It shows up immediately and
    /// stays cached even if persisting fails.
    pub async fn add(
        &self,
        message: impl Into<String>,
        severity: Severity,
        data: Value,
    ) -> Result<Notification, MailboxError> {
        let user_id = self.require_user().await?;
        let now = self.inner.clock.now();

        let notification = {
            let mut state = self.inner.state.lock();
            state.scope_to(&user_id);
            let ms = state.next_id_millis(now.timestamp_millis());
            let notification = Notification {
                id: format!("notification_{}", ms),
                user_id: user_id.clone(),
                timestamp: now,
                message: message.into(),
                severity,
                read: false,
                data: if data.is_null() { empty_payload() } else { data },
            };
            state.prepend(notification.clone());
            notification
        };

        let ids = [notification.id.clone()];
        let result = match to_row(&notification) {
            Ok(row) => self.inner.store.insert(Table::Notifications, vec![row]).await,
            Err(e) => Err(e),
        };
        self.settle(&ids, result.is_ok());

        match result {
            Ok(()) => Ok(notification),
            Err(e) => {
                tracing::error!("Error storing notification {}: {}", notification.id, e);
                Err(e.into())
            }
        }
    }

    fn settle(&self, ids: &[String], succeeded: bool) {
        let seq = self.current_load_seq();
        self.inner.state.lock().settle(ids, succeeded, seq);
    }

    pub async fn mark_read(&self, id: &str) -> Result<(), MailboxError> {
        let user_id = self.require_user().await?;
        if !self.inner.state.lock().mark_read(id) {
            tracing::debug!("Marking uncached notification {} read", id);
        }

        let query = Query::new().eq("id", id).eq("user_id", user_id.as_str());
        let result = self
            .inner
            .store
            .update(Table::Notifications, &query, read_patch())
            .await;
        let ids = [id.to_string()];
        self.settle(&ids, result.is_ok());

        result.map(|_| ()).map_err(|e| {
            tracing::error!("Error marking notification {} read: {}", id, e);
            e.into()
        })
    }

    pub async fn mark_all_read(&self) -> Result<(), MailboxError> {
        let user_id = self.require_user().await?;
        let ids = self.inner.state.lock().mark_all_read();

        let query = Query::new().eq("user_id", user_id.as_str());
        let result = self
            .inner
            .store
            .update(Table::Notifications, &query, read_patch())
            .await;
        self.settle(&ids, result.is_ok());

        result.map(|_| ()).map_err(|e| {
            tracing::error!("Error marking notifications read for {}: {}", user_id, e);
            e.into()
        })
    }

    /// Delete remotely, then drop the cached entry. The entry stays if the
    /// delete fails.
    pub async fn remove(&self, id: &str) -> Result<(), MailboxError> {
        let user_id = self.require_user().await?;
        let query = Query::new().eq("id", id).eq("user_id", user_id.as_str());

        if let Err(e) = self.inner.store.delete(Table::Notifications, &query).await {
            tracing::error!("Error deleting notification {}: {}", id, e);
            return Err(e.into());
        }
        self.inner.state.lock().remove(id);
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<(), MailboxError> {
        let user_id = self.require_user().await?;
        let query = Query::new().eq("user_id", user_id.as_str());

        if let Err(e) = self.inner.store.delete(Table::Notifications, &query).await {
            tracing::error!("Error clearing notifications for {}: {}", user_id, e);
            return Err(e.into());
        }
        self.inner.state.lock().clear();
        Ok(())
    }

    /// Reload on every bus signal. Dropping the returned handles detaches.
    pub fn attach(&self, bus: &EventBus) -> Vec<Subscription> {
        Signal::ALL
            .iter()
            .map(|&signal| {
                let mailbox = self.clone();
                bus.subscribe(signal, move |signal| {
                    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                        tracing::warn!("Ignoring {} outside a runtime", signal);
                        return;
                    };
                    let mailbox = mailbox.clone();
                    runtime.spawn(async move {
                        if let Err(e) = mailbox.load().await {
                            tracing::warn!("Reload after {} failed: {}", signal, e);
                        }
                    });
                })
            })
            .collect()
    }
}

fn read_patch() -> serde_json::Map<String, Value> {
    let mut patch = serde_json::Map::new();
    patch.insert("read".to_string(), Value::Bool(true));
    patch
}
