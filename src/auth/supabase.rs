//! Supabase Auth (GoTrue) client.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::broadcast;

use super::{AuthError, AuthEvent, AuthProvider, AuthSession, User};
use crate::store::SupabaseConfig;

pub struct SupabaseAuth {
    http: Client,
    config: SupabaseConfig,
    access_token: RwLock<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
}

impl SupabaseAuth {
    pub fn new(config: SupabaseConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            http: Client::new(),
            config,
            access_token: RwLock::new(None),
            events,
        }
    }

    pub fn with_token(self, access_token: String) -> Self {
        *self.access_token.write() = Some(access_token);
        self
    }

    /// Adopt a token obtained by the sign-in flow and announce the session.
    pub async fn adopt_token(&self, access_token: String) -> Result<Option<AuthSession>, AuthError> {
        *self.access_token.write() = Some(access_token);
        let session = self.get_session().await?;
        if let Some(session) = &session {
            let _ = self.events.send(AuthEvent::SignedIn(session.clone()));
        }
        Ok(session)
    }

    fn token(&self) -> Option<String> {
        self.access_token.read().clone()
    }

    async fn fetch_user(&self, token: &str) -> Result<Option<User>, AuthError> {
        let response = self
            .http
            .get(self.config.endpoint("auth/v1/user"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(Some(response.json().await?)),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => Ok(None),
            status => Err(AuthError::Api(format!("HTTP {}", status))),
        }
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
        let Some(token) = self.token() else {
            return Ok(None);
        };

        Ok(self.fetch_user(&token).await?.map(|user| AuthSession {
            user,
            access_token: token,
        }))
    }

    async fn get_user(&self) -> Result<Option<User>, AuthError> {
        match self.token() {
            Some(token) => self.fetch_user(&token).await,
            None => Ok(None),
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(token) = self.access_token.write().take() else {
            return Ok(());
        };
        let _ = self.events.send(AuthEvent::SignedOut);

        let response = self
            .http
            .post(self.config.endpoint("auth/v1/logout"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::Api(format!("Logout failed with status: {}", response.status())));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
