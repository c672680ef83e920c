//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{broadcast, oneshot, RwLock};

use crate::auth::{AuthError, AuthEvent, AuthProvider, AuthSession, User};
use crate::store::{MemoryStore, Query, RelationalStore, Row, StoreError, Table};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 9, 0, 0).unwrap()
}

/// Memory store with switchable failures and a gate that holds writes.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    fail_serials: AtomicBool,
    /// Inserts and updates wait for a read guard; hold the write guard to
    /// keep them in flight.
    pub write_gate: RwLock<()>,
    held_read: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_serials(&self, fail: bool) {
        self.fail_serials.store(fail, Ordering::SeqCst);
    }

    /// The next select reads its rows, then waits until the returned
    /// sender fires (or is dropped) before handing them back.
    pub fn hold_next_read(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.held_read.lock() = Some(rx);
        tx
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RelationalStore for FlakyStore {
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        Self::check(&self.fail_reads)?;
        let rows = self.inner.select(table, query).await?;
        let held = self.held_read.lock().take();
        if let Some(release) = held {
            let _ = release.await;
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<(), StoreError> {
        let _gate = self.write_gate.read().await;
        Self::check(&self.fail_writes)?;
        self.inner.insert(table, rows).await
    }

    async fn update(&self, table: Table, query: &Query, patch: Row) -> Result<u64, StoreError> {
        let _gate = self.write_gate.read().await;
        Self::check(&self.fail_writes)?;
        self.inner.update(table, query, patch).await
    }

    async fn delete(&self, table: Table, query: &Query) -> Result<u64, StoreError> {
        Self::check(&self.fail_deletes)?;
        self.inner.delete(table, query).await
    }

    async fn upsert(&self, table: Table, row: Row) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.upsert(table, row).await
    }

    async fn next_invoice_serial(&self, prefix: &str, date_key: &str) -> Result<u32, StoreError> {
        Self::check(&self.fail_serials)?;
        self.inner.next_invoice_serial(prefix, date_key).await
    }
}

/// Auth provider whose signed-in user is set directly by the test.
pub struct StaticAuth {
    user: Mutex<Option<User>>,
    sign_outs: AtomicUsize,
    events: broadcast::Sender<AuthEvent>,
}

impl StaticAuth {
    pub fn signed_in(user_id: &str) -> Self {
        let auth = Self::signed_out();
        *auth.user.lock() = Some(User {
            id: user_id.to_string(),
            email: Some(format!("{}@example.com", user_id)),
        });
        auth
    }

    pub fn signed_out() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            user: Mutex::new(None),
            sign_outs: AtomicUsize::new(0),
            events,
        }
    }

    /// Simulate the provider signing a user in and announcing it.
    pub fn sign_in(&self, user_id: &str) {
        let user = User {
            id: user_id.to_string(),
            email: None,
        };
        *self.user.lock() = Some(user.clone());
        let _ = self.events.send(AuthEvent::SignedIn(AuthSession {
            user,
            access_token: "token".to_string(),
        }));
    }

    /// Simulate the provider ending the session on its own.
    pub fn expire(&self) {
        *self.user.lock() = None;
        let _ = self.events.send(AuthEvent::SignedOut);
    }

    pub fn sign_out_count(&self) -> usize {
        self.sign_outs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        Ok(self.user.lock().clone().map(|user| AuthSession {
            user,
            access_token: "token".to_string(),
        }))
    }

    async fn get_user(&self) -> Result<Option<User>, AuthError> {
        Ok(self.user.lock().clone())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        *self.user.lock() = None;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
