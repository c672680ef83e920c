//! Auth provider seam
//!
//! Credential checks live with the external provider; the desk only asks who
//! is signed in, signs out, and follows auth-state changes.

mod local;
mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use local::LocalAuth;
pub use supabase::SupabaseAuth;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Auth API error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// A live session as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user: User,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    SignedOut,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_session(&self) -> Result<Option<AuthSession>, AuthError>;

    async fn get_user(&self) -> Result<Option<User>, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Stream of auth-state changes.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Local view of a signed-in user, owned by the session guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub authenticated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Id of the signed-in user, or `None` when signed out or unreachable.
pub async fn current_user_id(auth: &dyn AuthProvider) -> Option<String> {
    match auth.get_user().await {
        Ok(user) => user.map(|u| u.id),
        Err(e) => {
            tracing::warn!("Failed to look up current user: {}", e);
            None
        }
    }
}
