//! Session guard
//!
//! State machine over the auth provider and the activity clock:
//!
//! `Unauthenticated -> Authenticated -> (TimingOut) -> Unauthenticated`
//!
//! One idle timer is armed while authenticated and re-armed on activity.
//! When it fires the guard consults the remote activity record before
//! logging out, so a user active in another tab keeps their session.

mod profile;
mod timer;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::activity::ActivityClock;
use crate::auth::{AuthError, AuthEvent, AuthProvider, Session};
use crate::clock::Clock;
use crate::events::{EventBus, Signal};
use crate::notifications::Severity;
use crate::preferences::KeyValueStore;
use crate::store::RelationalStore;

pub use profile::{default_service_descriptions, LoginProfile, SERVICE_DESCRIPTIONS_KEY, SESSION_KEYS};
pub use timer::IdleTimer;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const TIMEOUT_MESSAGE: &str = "Your session has expired. Please log in again.";

/// Floor for re-arming after a remote check, so a record sitting exactly on
/// the boundary cannot spin the timer.
const MIN_REARM: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("No live session with the auth provider")]
    NoSession,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub idle_timeout: Duration,
    pub session_keys: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            session_keys: SESSION_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardState {
    Unauthenticated,
    Authenticated,
    /// The idle timer fired and the remote record is being checked.
    TimingOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LogoutReason {
    Explicit,
    Timeout,
    ProviderSignedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEvent {
    Authenticated { user_id: String },
    LoggedOut { reason: LogoutReason },
    /// User-facing message for the UI layer.
    Notice { message: String, severity: Severity },
}

/// What a fired timer decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryCheck {
    /// Not authenticated, or another check is already running.
    Inactive,
    /// Local activity is inside the window; re-armed for the remainder.
    LocallyActive,
    /// Remote record is fresher (another tab); re-armed.
    RemoteActive,
    /// Remote record unreadable or missing; treated as active.
    RemoteUnavailable,
    LoggedOut,
}

struct Status {
    state: GuardState,
    session: Option<Session>,
}

struct GuardInner {
    auth: Arc<dyn AuthProvider>,
    prefs: Arc<dyn KeyValueStore>,
    activity: ActivityClock,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    config: GuardConfig,
    status: Mutex<Status>,
    timer: IdleTimer,
    events: broadcast::Sender<SessionEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<GuardInner>,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn std_duration(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

impl SessionGuard {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        prefs: Arc<dyn KeyValueStore>,
        store: Arc<dyn RelationalStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
        config: GuardConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(GuardInner {
                auth,
                prefs,
                activity: ActivityClock::new(store, clock.clone()),
                bus,
                clock,
                config,
                status: Mutex::new(Status {
                    state: GuardState::Unauthenticated,
                    session: None,
                }),
                timer: IdleTimer::new(),
                events,
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Adopt any live provider session and start following auth changes.
    pub async fn start(&self) -> Result<GuardState, GuardError> {
        // Subscribe first so a change racing the lookup is not missed.
        let changes = self.inner.auth.subscribe();
        let watcher = tokio::spawn(watch_auth(Arc::downgrade(&self.inner), changes));
        if let Some(previous) = self.inner.watcher.lock().replace(watcher) {
            previous.abort();
        }

        match self.inner.auth.get_session().await? {
            Some(session) => {
                tracing::info!("Resuming session for {}", session.user.id);
                self.inner.become_authenticated(session.user.id);
            }
            None => tracing::info!("No live session at start"),
        }
        Ok(self.state())
    }

    /// Bookkeeping after the provider signed the user in.
    pub async fn login(&self, profile: &LoginProfile) -> Result<Session, GuardError> {
        let session = self
            .inner
            .auth
            .get_session()
            .await?
            .ok_or(GuardError::NoSession)?;
        let user_id = session.user.id;
        let prefs = &self.inner.prefs;

        let entries = profile.preference_entries(&user_id, self.inner.clock.now());
        if !prefs.set_many(entries).await {
            tracing::warn!("Failed to store login profile for {}", user_id);
        }
        if prefs.get(SERVICE_DESCRIPTIONS_KEY).await.is_none()
            && !prefs
                .set(SERVICE_DESCRIPTIONS_KEY, default_service_descriptions())
                .await
        {
            tracing::warn!("Failed to seed service descriptions for {}", user_id);
        }

        self.inner.become_authenticated(user_id.clone());
        self.inner.bus.emit(Signal::Login);

        tracing::info!("User {} logged in", user_id);
        self.session().ok_or(GuardError::NoSession)
    }

    /// Note user activity (route change, input). Ignored when signed out.
    pub fn record_activity(&self) -> bool {
        self.inner.record_activity()
    }

    /// Explicit logout; always ends in `Unauthenticated`.
    pub async fn logout(&self) {
        self.inner.end_session(LogoutReason::Explicit, true).await;
    }

    /// Run the idle-timer decision now. The timer calls this when it fires.
    pub async fn check_expiry(&self) -> ExpiryCheck {
        self.inner.check_expiry().await
    }

    pub fn state(&self) -> GuardState {
        self.inner.status.lock().state
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.status.lock().session.clone()
    }

    pub fn is_timer_armed(&self) -> bool {
        self.inner.timer.is_armed()
    }

    pub fn activity(&self) -> &ActivityClock {
        &self.inner.activity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }
}

async fn watch_auth(guard: Weak<GuardInner>, mut changes: broadcast::Receiver<AuthEvent>) {
    loop {
        let event = match changes.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("Missed {} auth change(s)", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(guard) = guard.upgrade() else {
            break;
        };

        let state = guard.status.lock().state;
        match event {
            AuthEvent::SignedIn(session) if state == GuardState::Unauthenticated => {
                guard.become_authenticated(session.user.id);
            }
            AuthEvent::SignedOut if state != GuardState::Unauthenticated => {
                guard.end_session(LogoutReason::ProviderSignedOut, false).await;
            }
            _ => {}
        }
    }
}

impl GuardInner {
    fn timeout(&self) -> chrono::Duration {
        chrono_duration(self.config.idle_timeout)
    }

    fn publish(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn arm(self: &Arc<Self>, after: Duration) {
        let guard = Arc::downgrade(self);
        self.timer.arm(after, async move {
            if let Some(guard) = guard.upgrade() {
                let outcome = guard.check_expiry().await;
                tracing::debug!("Idle timer fired: {:?}", outcome);
            }
        });
    }

    fn become_authenticated(self: &Arc<Self>, user_id: String) {
        let now = self.clock.now();
        {
            let mut status = self.status.lock();
            status.state = GuardState::Authenticated;
            status.session = Some(Session {
                user_id: user_id.clone(),
                authenticated_at: now,
                last_activity_at: now,
            });
        }

        self.activity.touch(&user_id);
        self.arm(self.config.idle_timeout);
        self.publish(SessionEvent::Authenticated { user_id });
    }

    fn record_activity(self: &Arc<Self>) -> bool {
        let user_id = {
            let mut status = self.status.lock();
            let Some(session) = status.session.as_mut() else {
                return false;
            };
            session.last_activity_at = self.clock.now();
            let user_id = session.user_id.clone();
            // Activity during a pending remote check settles it.
            status.state = GuardState::Authenticated;
            user_id
        };

        self.activity.touch(&user_id);
        self.arm(self.config.idle_timeout);
        true
    }

    async fn check_expiry(self: &Arc<Self>) -> ExpiryCheck {
        let timeout = self.timeout();

        let user_id = {
            let mut status = self.status.lock();
            if status.state != GuardState::Authenticated {
                return ExpiryCheck::Inactive;
            }
            let Some(user_id) = status.session.as_ref().map(|s| s.user_id.clone()) else {
                return ExpiryCheck::Inactive;
            };

            if !self.activity.is_expired(timeout) {
                let remaining = self
                    .activity
                    .remaining(timeout)
                    .map(std_duration)
                    .unwrap_or(self.config.idle_timeout);
                drop(status);
                self.arm(remaining.max(MIN_REARM));
                return ExpiryCheck::LocallyActive;
            }

            status.state = GuardState::TimingOut;
            user_id
        };

        let remote = self.activity.remote_last_activity(&user_id).await;

        {
            let status = self.status.lock();
            let same_session = status
                .session
                .as_ref()
                .is_some_and(|s| s.user_id == user_id);
            if status.state != GuardState::TimingOut || !same_session {
                // Activity or logout happened while the store answered.
                return ExpiryCheck::Inactive;
            }
        }

        let (outcome, rearm) = match remote {
            Ok(Some(last_activity)) => {
                let idle = self.clock.now() - last_activity;
                if idle > timeout {
                    tracing::info!(
                        "Session for {} idle for {} minutes, logging out",
                        user_id,
                        idle.num_minutes()
                    );
                    self.end_session(LogoutReason::Timeout, true).await;
                    return ExpiryCheck::LoggedOut;
                }
                tracing::debug!("Remote activity for {} is fresher, keeping session", user_id);
                (ExpiryCheck::RemoteActive, std_duration(timeout - idle))
            }
            Ok(None) => {
                tracing::warn!("No remote activity record for {}, keeping session", user_id);
                (ExpiryCheck::RemoteUnavailable, self.config.idle_timeout)
            }
            Err(e) => {
                tracing::warn!("Could not check remote activity for {}: {}", user_id, e);
                (ExpiryCheck::RemoteUnavailable, self.config.idle_timeout)
            }
        };

        self.status.lock().state = GuardState::Authenticated;
        self.arm(rearm.max(MIN_REARM));
        outcome
    }

    async fn end_session(self: &Arc<Self>, reason: LogoutReason, sign_out: bool) {
        self.timer.cancel();
        let ended = {
            let mut status = self.status.lock();
            status.state = GuardState::Unauthenticated;
            status.session.take()
        };

        // Keys are scoped to the signed-in user, so clear them before the
        // provider forgets who that is.
        if reason != LogoutReason::ProviderSignedOut {
            for key in &self.config.session_keys {
                if !self.prefs.remove(key).await {
                    tracing::warn!("Failed to clear session key {}", key);
                }
            }
        }

        if sign_out {
            if let Err(e) = self.auth.sign_out().await {
                tracing::error!("Sign-out failed: {}", e);
            }
        }

        self.activity.reset();

        match &ended {
            Some(session) => tracing::info!("Session for {} ended: {:?}", session.user_id, reason),
            None => tracing::info!("Logout with no active session: {:?}", reason),
        }

        self.publish(SessionEvent::LoggedOut { reason });
        if reason == LogoutReason::Timeout {
            self.publish(SessionEvent::Notice {
                message: TIMEOUT_MESSAGE.to_string(),
                severity: Severity::Warning,
            });
        }
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityRecord;
    use crate::clock::ManualClock;
    use crate::preferences::PreferenceStore;
    use crate::store::{to_row, Query, Table};
    use crate::testing::{start_time, FlakyStore, StaticAuth};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        guard: SessionGuard,
        auth: Arc<StaticAuth>,
        store: Arc<FlakyStore>,
        prefs: Arc<PreferenceStore>,
        clock: Arc<ManualClock>,
        bus: EventBus,
    }

    fn fixture(user: Option<&str>) -> Fixture {
        let auth = Arc::new(match user {
            Some(id) => StaticAuth::signed_in(id),
            None => StaticAuth::signed_out(),
        });
        let store = Arc::new(FlakyStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let prefs = Arc::new(PreferenceStore::new(store.clone(), auth.clone(), clock.clone()));
        let bus = EventBus::new();
        let guard = SessionGuard::new(
            auth.clone(),
            prefs.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
            GuardConfig::default(),
        );
        Fixture {
            guard,
            auth,
            store,
            prefs,
            clock,
            bus,
        }
    }

    async fn stored_preferences(store: &FlakyStore) -> Value {
        let rows = store
            .inner()
            .select(Table::UserPreferences, &Query::new().eq("user_id", "u1"))
            .await
            .unwrap();
        rows[0]["preferences"].clone()
    }

    #[tokio::test]
    async fn test_idle_past_timeout_logs_out() {
        let f = fixture(Some("u1"));
        assert_eq!(f.guard.start().await.unwrap(), GuardState::Authenticated);
        f.prefs.set("isLoggedIn", json!(true)).await;
        f.prefs.set("userEmail", json!("u1@example.com")).await;
        f.prefs.set("invoiceDraft", json!("keep")).await;
        f.guard.activity().touch("u1").await.unwrap();
        let mut events = f.guard.subscribe();

        f.clock.advance(chrono::Duration::minutes(31));
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::LoggedOut);

        assert_eq!(f.guard.state(), GuardState::Unauthenticated);
        assert!(f.guard.session().is_none());
        assert!(!f.guard.is_timer_armed());
        assert_eq!(f.auth.sign_out_count(), 1);
        assert_eq!(stored_preferences(&f.store).await, json!({ "invoiceDraft": "keep" }));

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut {
                reason: LogoutReason::Timeout
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Notice {
                message: TIMEOUT_MESSAGE.to_string(),
                severity: Severity::Warning,
            }
        );
    }

    #[tokio::test]
    async fn test_idle_inside_window_rearms() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();
        f.guard.activity().touch("u1").await.unwrap();

        f.clock.advance(chrono::Duration::minutes(29));
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::LocallyActive);
        assert_eq!(f.guard.state(), GuardState::Authenticated);
        assert!(f.guard.is_timer_armed());
        assert_eq!(f.auth.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_fresher_remote_activity_keeps_session() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();
        f.guard.activity().touch("u1").await.unwrap();

        // Another tab was active 25 minutes in.
        f.clock.advance(chrono::Duration::minutes(25));
        let record = ActivityRecord {
            user_id: "u1".to_string(),
            last_activity: f.clock.now(),
        };
        f.store
            .inner()
            .upsert(Table::UserSessions, to_row(&record).unwrap())
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(6));
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::RemoteActive);
        assert_eq!(f.guard.state(), GuardState::Authenticated);
        assert!(f.guard.is_timer_armed());
        assert_eq!(f.auth.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_remote_fails_open() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();
        f.guard.activity().touch("u1").await.unwrap();

        f.clock.advance(chrono::Duration::minutes(45));
        f.store.fail_reads(true);
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::RemoteUnavailable);
        assert_eq!(f.guard.state(), GuardState::Authenticated);
        assert_eq!(f.auth.sign_out_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_remote_record_fails_open() {
        let f = fixture(Some("u1"));
        f.store.fail_writes(true);
        f.guard.start().await.unwrap();
        f.guard.activity().touch("u1").await.unwrap();

        f.clock.advance(chrono::Duration::minutes(31));
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::RemoteUnavailable);
        assert_eq!(f.guard.state(), GuardState::Authenticated);
    }

    #[tokio::test]
    async fn test_explicit_logout_always_ends_session() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();
        let mut events = f.guard.subscribe();

        f.guard.logout().await;
        assert_eq!(f.guard.state(), GuardState::Unauthenticated);
        assert!(!f.guard.is_timer_armed());
        assert_eq!(f.auth.sign_out_count(), 1);
        assert!(f.guard.activity().last_activity().is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut {
                reason: LogoutReason::Explicit
            }
        );

        assert!(!f.guard.record_activity());
        assert_eq!(f.guard.check_expiry().await, ExpiryCheck::Inactive);
    }

    #[tokio::test]
    async fn test_login_records_profile_and_signals() {
        let f = fixture(Some("u1"));
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = logins.clone();
        let _sub = f.bus.subscribe(Signal::Login, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut profile = LoginProfile::new("jo@example.com");
        profile.role = Some("admin".to_string());
        let session = f.guard.login(&profile).await.unwrap();

        assert_eq!(session.user_id, "u1");
        assert_eq!(f.guard.state(), GuardState::Authenticated);
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(f.prefs.get("userPosition").await, Some(json!("Admin")));
        assert_eq!(
            f.prefs.get(SERVICE_DESCRIPTIONS_KEY).await,
            Some(default_service_descriptions())
        );
    }

    #[tokio::test]
    async fn test_login_keeps_existing_service_descriptions() {
        let f = fixture(Some("u1"));
        let custom = json!([{ "id": 1, "text": "Bookkeeping" }]);
        f.prefs.set(SERVICE_DESCRIPTIONS_KEY, custom.clone()).await;

        f.guard.login(&LoginProfile::new("jo@example.com")).await.unwrap();
        assert_eq!(f.prefs.get(SERVICE_DESCRIPTIONS_KEY).await, Some(custom));
    }

    #[tokio::test]
    async fn test_login_without_provider_session_fails() {
        let f = fixture(None);
        let result = f.guard.login(&LoginProfile::new("jo@example.com")).await;
        assert!(matches!(result, Err(GuardError::NoSession)));
        assert_eq!(f.guard.state(), GuardState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_follows_provider_sign_in_and_out() {
        let f = fixture(None);
        assert_eq!(f.guard.start().await.unwrap(), GuardState::Unauthenticated);
        let mut events = f.guard.subscribe();

        f.auth.sign_in("u2");
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Authenticated {
                user_id: "u2".to_string()
            }
        );
        assert_eq!(f.guard.state(), GuardState::Authenticated);

        f.auth.expire();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut {
                reason: LogoutReason::ProviderSignedOut
            }
        );
        assert_eq!(f.guard.state(), GuardState::Unauthenticated);
        assert_eq!(f.auth.sign_out_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_fires_and_logs_out() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();
        f.guard.activity().touch("u1").await.unwrap();
        let mut events = f.guard.subscribe();

        f.clock.advance(chrono::Duration::minutes(31));
        tokio::time::sleep(DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedOut {
                reason: LogoutReason::Timeout
            }
        );
        assert_eq!(f.guard.state(), GuardState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_pushes_deadline_back() {
        let f = fixture(Some("u1"));
        f.guard.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        f.clock.advance(chrono::Duration::minutes(20));
        assert!(f.guard.record_activity());

        tokio::time::sleep(Duration::from_secs(15 * 60)).await;
        f.clock.advance(chrono::Duration::minutes(15));
        tokio::task::yield_now().await;

        assert_eq!(f.guard.state(), GuardState::Authenticated);
        assert!(f.guard.is_timer_armed());
    }
}
