//! Wiring of the desk components over one store and one auth provider.

use std::sync::Arc;
use thiserror::Error;

use crate::auth::{AuthProvider, LocalAuth, SupabaseAuth};
use crate::clock::{Clock, SystemClock};
use crate::config::{Backend, ConfigError, DeskConfig};
use crate::db::{Database, DbError};
use crate::events::{EventBus, Subscription};
use crate::invoices::{InvoiceLedger, InvoiceNumberAllocator};
use crate::notifications::NotificationMailbox;
use crate::preferences::PreferenceStore;
use crate::session::{GuardError, GuardState, LoginProfile, SessionGuard};
use crate::store::{RelationalStore, SqliteStore, SupabaseStore};
use crate::users::UserDirectory;

#[derive(Error, Debug)]
pub enum DeskError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Session error: {0}")]
    Guard(#[from] GuardError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Local sign-in is only available with the sqlite backend")]
    NotLocal,
}

pub struct Desk {
    pub store: Arc<dyn RelationalStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub prefs: Arc<PreferenceStore>,
    pub guard: SessionGuard,
    pub mailbox: NotificationMailbox,
    pub allocator: InvoiceNumberAllocator,
    pub ledger: InvoiceLedger,
    pub users: UserDirectory,
    local_auth: Option<Arc<LocalAuth>>,
    _subscriptions: Vec<Subscription>,
}

impl Desk {
    /// Open the configured backend and wire every component to it.
    pub async fn open(config: &DeskConfig) -> Result<Self, DeskError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        match config.backend {
            Backend::Sqlite => {
                let db = Database::open(&config.database_path).await?;
                let store = Arc::new(SqliteStore::new(Arc::new(db)));
                let auth = Arc::new(LocalAuth::new(config.local_user.clone()));
                Ok(Self::assemble(store, auth.clone(), Some(auth), clock, config))
            }
            Backend::Supabase => {
                let mut store = SupabaseStore::new(config.supabase.clone());
                let mut auth = SupabaseAuth::new(config.supabase.clone());
                if let Some(token) = &config.access_token {
                    store = store.with_token(token.clone());
                    auth = auth.with_token(token.clone());
                }
                tracing::info!("Using Supabase backend at {}", config.supabase.url);
                Ok(Self::assemble(
                    Arc::new(store),
                    Arc::new(auth),
                    None,
                    clock,
                    config,
                ))
            }
        }
    }

    fn assemble(
        store: Arc<dyn RelationalStore>,
        auth: Arc<dyn AuthProvider>,
        local_auth: Option<Arc<LocalAuth>>,
        clock: Arc<dyn Clock>,
        config: &DeskConfig,
    ) -> Self {
        let bus = EventBus::new();
        let prefs = Arc::new(PreferenceStore::new(store.clone(), auth.clone(), clock.clone()));
        let guard = SessionGuard::new(
            auth.clone(),
            prefs.clone(),
            store.clone(),
            bus.clone(),
            clock.clone(),
            config.guard_config(),
        );
        let mailbox = NotificationMailbox::new(store.clone(), auth.clone(), clock.clone());
        let subscriptions = mailbox.attach(&bus);
        let allocator = InvoiceNumberAllocator::new(store.clone(), clock.clone());
        let ledger = InvoiceLedger::new(store.clone(), auth.clone(), bus.clone(), clock.clone())
            .with_retention(config.bin_retention());
        let users = UserDirectory::new(store.clone(), auth.clone(), bus.clone());

        Self {
            store,
            auth,
            bus,
            clock,
            prefs,
            guard,
            mailbox,
            allocator,
            ledger,
            users,
            local_auth,
            _subscriptions: subscriptions,
        }
    }

    /// Desk over caller-supplied collaborators. Signing in goes through
    /// `local_auth` when it is given.
    pub fn with_parts(
        store: Arc<dyn RelationalStore>,
        local_auth: Arc<LocalAuth>,
        clock: Arc<dyn Clock>,
        config: &DeskConfig,
    ) -> Self {
        Self::assemble(store, local_auth.clone(), Some(local_auth), clock, config)
    }

    /// Resume any live session and load the mailbox.
    pub async fn start(&self) -> Result<GuardState, DeskError> {
        let state = self.guard.start().await?;
        if state == GuardState::Authenticated {
            if let Err(e) = self.mailbox.load().await {
                tracing::warn!("Initial mailbox load failed: {}", e);
            }
        }
        Ok(state)
    }

    /// Sign in on the offline desk, record the login and its profile row.
    pub async fn sign_in_local(&self, profile: &LoginProfile) -> Result<(), DeskError> {
        let local = self.local_auth.as_ref().ok_or(DeskError::NotLocal)?;
        local.sign_in(&profile.email, Some(profile.email.clone()));
        self.guard.login(profile).await?;
        if !self.users.set_profile(profile.profile_fields(), None).await {
            tracing::warn!("Signed in without saving the profile of {}", profile.email);
        }
        Ok(())
    }
}
