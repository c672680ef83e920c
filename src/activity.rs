//! Last-activity tracking.
//!
//! The local timestamp is authoritative for this process; the remote
//! `user_sessions` row mirrors it so other tabs and devices can see it.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::clock::{self, Clock};
use crate::store::{from_row, to_row, Query, RelationalStore, StoreError, Table};

/// Remote mirror of a user's last activity. One row per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub user_id: String,
    #[serde(with = "clock::rfc3339")]
    pub last_activity: DateTime<Utc>,
}

pub struct ActivityClock {
    store: Arc<dyn RelationalStore>,
    clock: Arc<dyn Clock>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
    touch_seq: AtomicU64,
    // Highest touch sequence written remotely; older persists are skipped.
    persisted_seq: Arc<tokio::sync::Mutex<u64>>,
}

impl ActivityClock {
    pub fn new(store: Arc<dyn RelationalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            last_activity: Mutex::new(None),
            touch_seq: AtomicU64::new(0),
            persisted_seq: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    /// Record now as the last activity and persist it in the background.
    ///
    /// Never fails and never waits on the store. The returned handle may be
    /// dropped; it exists so callers can await the persist when they care.
    pub fn touch(&self, user_id: &str) -> JoinHandle<()> {
        let now = self.clock.now();
        *self.last_activity.lock() = Some(now);

        let seq = self.touch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let store = self.store.clone();
        let persisted = self.persisted_seq.clone();
        let record = ActivityRecord {
            user_id: user_id.to_string(),
            last_activity: now,
        };

        tokio::spawn(async move {
            let mut persisted = persisted.lock().await;
            if *persisted >= seq {
                return;
            }
            match persist(store.as_ref(), &record).await {
                Ok(()) => *persisted = seq,
                Err(e) => tracing::warn!(
                    "Failed to persist last activity for {}: {}",
                    record.user_id,
                    e
                ),
            }
        })
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_activity.lock()
    }

    /// True iff strictly more than `timeout` has passed since the last touch.
    /// Never-touched clocks are not expired.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        match self.last_activity() {
            Some(at) => self.clock.now() - at > timeout,
            None => false,
        }
    }

    /// Time left before the local window lapses.
    pub fn remaining(&self, timeout: Duration) -> Option<Duration> {
        self.last_activity()
            .map(|at| timeout - (self.clock.now() - at))
    }

    pub fn reset(&self) {
        *self.last_activity.lock() = None;
    }

    pub async fn remote_last_activity(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self
            .store
            .select(Table::UserSessions, &Query::new().eq("user_id", user_id))
            .await?;

        match rows.into_iter().next() {
            Some(row) => Ok(Some(from_row::<ActivityRecord>(row)?.last_activity)),
            None => Ok(None),
        }
    }
}

async fn persist(store: &dyn RelationalStore, record: &ActivityRecord) -> Result<(), StoreError> {
    store.upsert(Table::UserSessions, to_row(record)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::{start_time, FlakyStore};

    fn activity(store: Arc<dyn RelationalStore>) -> (ActivityClock, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        (ActivityClock::new(store, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_expiry_is_measured_from_last_touch() {
        let (activity, clock) = activity(Arc::new(MemoryStore::new()));
        let timeout = Duration::minutes(30);
        assert!(!activity.is_expired(timeout));

        // Frequent touches never accumulate; only the last one counts.
        for _ in 0..5 {
            activity.touch("u1");
            clock.advance(Duration::minutes(20));
        }
        assert!(!activity.is_expired(timeout));

        clock.advance(Duration::minutes(10));
        assert!(!activity.is_expired(timeout), "exactly the timeout is not expired");

        clock.advance(Duration::milliseconds(1));
        assert!(activity.is_expired(timeout));

        activity.touch("u1");
        assert!(!activity.is_expired(timeout));
    }

    #[tokio::test]
    async fn test_touch_persists_remote_record() {
        let store = Arc::new(MemoryStore::new());
        let (activity, clock) = activity(store.clone());

        activity.touch("u1").await.unwrap();
        clock.advance(Duration::minutes(3));
        activity.touch("u1").await.unwrap();

        assert_eq!(
            activity.remote_last_activity("u1").await.unwrap(),
            Some(start_time() + Duration::minutes(3))
        );
        assert_eq!(store.len(Table::UserSessions).await, 1);
        assert_eq!(activity.remote_last_activity("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_persist_is_swallowed() {
        let store = Arc::new(FlakyStore::new());
        store.fail_writes(true);
        let (activity, _clock) = activity(store.clone());

        activity.touch("u1").await.unwrap();

        assert!(activity.last_activity().is_some());
        assert_eq!(store.inner().len(Table::UserSessions).await, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_local_state() {
        let (activity, clock) = activity(Arc::new(MemoryStore::new()));
        activity.touch("u1");
        clock.advance(Duration::hours(2));

        activity.reset();

        assert_eq!(activity.last_activity(), None);
        assert!(!activity.is_expired(Duration::minutes(30)));
        assert_eq!(activity.remaining(Duration::minutes(30)), None);
    }
}
