//! Single-user provider for an offline desk backed by SQLite.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{AuthError, AuthEvent, AuthProvider, AuthSession, User};

const LOCAL_TOKEN: &str = "local";

pub struct LocalAuth {
    user: RwLock<Option<User>>,
    events: broadcast::Sender<AuthEvent>,
}

impl LocalAuth {
    pub fn new(user_id: Option<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            user: RwLock::new(user_id.map(|id| User { id, email: None })),
            events,
        }
    }

    /// Sign `user_id` in and announce it.
    pub fn sign_in(&self, user_id: &str, email: Option<String>) -> AuthSession {
        let user = User {
            id: user_id.to_string(),
            email,
        };
        *self.user.write() = Some(user.clone());
        let session = AuthSession {
            user,
            access_token: LOCAL_TOKEN.to_string(),
        };
        let _ = self.events.send(AuthEvent::SignedIn(session.clone()));
        session
    }
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        Ok(self.user.read().clone().map(|user| AuthSession {
            user,
            access_token: LOCAL_TOKEN.to_string(),
        }))
    }

    async fn get_user(&self) -> Result<Option<User>, AuthError> {
        Ok(self.user.read().clone())
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if self.user.write().take().is_some() {
            let _ = self.events.send(AuthEvent::SignedOut);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
