//! User profile rows and the role view derived from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{AuthProvider, User};
use crate::events::{EventBus, Signal};
use crate::store::{Query, RelationalStore, Row, StoreError, Table};

pub const ADMIN_ROLE: &str = "admin";

/// Who is at the desk and what they may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRole {
    pub id: String,
    pub name: String,
    pub role: String,
    pub position: String,
}

impl UserRole {
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            name: "Anonymous User".to_string(),
            role: "user".to_string(),
            position: String::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

pub struct UserDirectory {
    store: Arc<dyn RelationalStore>,
    auth: Arc<dyn AuthProvider>,
    bus: EventBus,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn RelationalStore>, auth: Arc<dyn AuthProvider>, bus: EventBus) -> Self {
        Self { store, auth, bus }
    }

    async fn current_user(&self) -> Option<User> {
        match self.auth.get_user().await {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!("Failed to look up current user: {}", e);
                None
            }
        }
    }

    async fn resolve(&self, user_id: Option<&str>) -> Option<String> {
        match user_id {
            Some(id) => Some(id.to_string()),
            None => self.current_user().await.map(|user| user.id),
        }
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<Row>, StoreError> {
        let rows = self
            .store
            .select(Table::Users, &Query::new().eq("id", user_id))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Profile row of `user_id`, or of the signed-in user when `None`.
    pub async fn profile(&self, user_id: Option<&str>) -> Option<Row> {
        let user_id = self.resolve(user_id).await?;
        match self.fetch(&user_id).await {
            Ok(row) => row,
            Err(e) => {
                tracing::error!("Error fetching user profile {}: {}", user_id, e);
                None
            }
        }
    }

    /// Merge `fields` into the profile, creating it if missing. Returns
    /// false when nobody is signed in or the write failed.
    pub async fn set_profile(&self, fields: Row, user_id: Option<&str>) -> bool {
        let Some(user_id) = self.resolve(user_id).await else {
            return false;
        };
        match self.write(&user_id, fields).await {
            Ok(()) => {
                tracing::debug!("Updated profile for {}", user_id);
                self.bus.emit(Signal::UserUpdated);
                true
            }
            Err(e) => {
                tracing::error!("Error setting user profile {}: {}", user_id, e);
                false
            }
        }
    }

    async fn write(&self, user_id: &str, mut fields: Row) -> Result<(), StoreError> {
        fields.remove("id");
        if self.fetch(user_id).await?.is_some() {
            self.store
                .update(Table::Users, &Query::new().eq("id", user_id), fields)
                .await?;
        } else {
            fields.insert("id".to_string(), Value::String(user_id.to_string()));
            self.store.insert(Table::Users, vec![fields]).await?;
        }
        Ok(())
    }

    /// Role view of the signed-in user. Missing profile columns fall back to
    /// the email and the `user` role; nobody signed in is anonymous.
    pub async fn current_role(&self) -> UserRole {
        let Some(user) = self.current_user().await else {
            return UserRole::anonymous();
        };
        let row = match self.fetch(&user.id).await {
            Ok(row) => row.unwrap_or_default(),
            Err(e) => {
                tracing::error!("Error fetching role for {}: {}", user.id, e);
                Row::new()
            }
        };

        UserRole {
            name: text(&row, "full_name")
                .or_else(|| user.email.clone())
                .unwrap_or_else(|| user.id.clone()),
            role: text(&row, "role").unwrap_or_else(|| "user".to_string()),
            position: text(&row, "position").unwrap_or_default(),
            id: user.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakyStore, StaticAuth};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        users: UserDirectory,
        store: Arc<FlakyStore>,
        bus: EventBus,
    }

    fn fixture(user: Option<&str>) -> Fixture {
        let store = Arc::new(FlakyStore::new());
        let auth: Arc<dyn AuthProvider> = Arc::new(match user {
            Some(id) => StaticAuth::signed_in(id),
            None => StaticAuth::signed_out(),
        });
        let bus = EventBus::new();
        let users = UserDirectory::new(store.clone(), auth, bus.clone());
        Fixture { users, store, bus }
    }

    fn fields(value: Value) -> Row {
        match value {
            Value::Object(row) => row,
            _ => Row::new(),
        }
    }

    #[tokio::test]
    async fn test_set_profile_inserts_then_updates() {
        let f = fixture(Some("u1"));
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let _sub = f.bus.subscribe(Signal::UserUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(f.users.set_profile(fields(json!({ "full_name": "Jo Smith" })), None).await);
        assert!(f.users.set_profile(fields(json!({ "role": "admin" })), None).await);

        let rows = f.store.inner().select(Table::Users, &Query::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        let profile = f.users.profile(None).await.unwrap();
        assert_eq!(profile["id"], json!("u1"));
        assert_eq!(profile["full_name"], json!("Jo Smith"));
        assert_eq!(profile["role"], json!("admin"));
        assert_eq!(updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_explicit_user_id() {
        let f = fixture(Some("u1"));
        assert!(f.users.set_profile(fields(json!({ "role": "user" })), Some("u2")).await);
        assert!(f.users.profile(None).await.is_none());
        assert_eq!(f.users.profile(Some("u2")).await.unwrap()["role"], json!("user"));
    }

    #[tokio::test]
    async fn test_write_failure_returns_false_without_signal() {
        let f = fixture(Some("u1"));
        let updates = Arc::new(AtomicUsize::new(0));
        let counter = updates.clone();
        let _sub = f.bus.subscribe(Signal::UserUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        f.store.fail_writes(true);
        assert!(!f.users.set_profile(fields(json!({ "role": "admin" })), None).await);
        assert_eq!(updates.load(Ordering::SeqCst), 0);

        f.store.fail_writes(false);
        f.store.fail_reads(true);
        assert!(!f.users.set_profile(fields(json!({ "role": "admin" })), None).await);
        assert!(f.users.profile(None).await.is_none());
    }

    #[tokio::test]
    async fn test_signed_out() {
        let f = fixture(None);
        assert!(!f.users.set_profile(fields(json!({ "role": "admin" })), None).await);
        assert!(f.users.profile(None).await.is_none());
        assert_eq!(f.users.current_role().await, UserRole::anonymous());
    }

    #[tokio::test]
    async fn test_current_role_falls_back_to_email() {
        let f = fixture(Some("u1"));
        let role = f.users.current_role().await;
        assert_eq!(role.name, "u1@example.com");
        assert_eq!(role.role, "user");
        assert!(!role.is_admin());

        f.users
            .set_profile(
                fields(json!({ "full_name": "Jo", "role": "admin", "position": "Admin" })),
                None,
            )
            .await;
        let role = f.users.current_role().await;
        assert_eq!(role.name, "Jo");
        assert_eq!(role.position, "Admin");
        assert!(role.is_admin());
    }
}
