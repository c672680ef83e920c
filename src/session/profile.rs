//! Profile keys written to the preference store at login.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::clock;

pub const SERVICE_DESCRIPTIONS_KEY: &str = "serviceDescriptions";

/// Keys removed from the preference store when a session ends.
pub const SESSION_KEYS: [&str; 4] = ["isLoggedIn", "userEmail", "userRole", "userPosition"];

const DEFAULT_SERVICE_DESCRIPTIONS: [&str; 4] = [
    "US Federal Corporation Income Tax Return (Form 1120)",
    "Foreign related party disclosure form with respect to a foreign subsidiary (Form 5417)",
    "Foreign related party disclosure form with respect to a foreign shareholders (Form 5472)",
    "Application for Automatic Extension of Time To File Business Income Tax (Form 7004)",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginProfile {
    pub email: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl LoginProfile {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Self::default()
        }
    }

    pub fn role(&self) -> &str {
        match self.role.as_deref() {
            Some(role) if !role.is_empty() => role,
            _ => "user",
        }
    }

    /// Explicit position, else `Admin` for admins and `Invoicing Associate`
    /// for everyone else.
    pub fn position(&self) -> &str {
        match self.position.as_deref() {
            Some(position) if !position.is_empty() => position,
            _ if self.role() == "admin" => "Admin",
            _ => "Invoicing Associate",
        }
    }

    /// Explicit name, else the local part of the email.
    pub fn user_name(&self) -> &str {
        match self.user_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => self.email.split('@').next().unwrap_or_default(),
        }
    }

    /// Columns written to the user's profile row at login.
    pub fn profile_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("email".to_string(), json!(self.email));
        fields.insert("full_name".to_string(), json!(self.user_name()));
        fields.insert("role".to_string(), json!(self.role()));
        fields.insert("position".to_string(), json!(self.position()));
        if let Some(phone) = self.phone.as_deref().filter(|p| !p.is_empty()) {
            fields.insert("phone".to_string(), json!(phone));
        }
        fields
    }

    /// Preference entries recorded for this login.
    pub fn preference_entries(&self, user_id: &str, at: DateTime<Utc>) -> Map<String, Value> {
        let mut entries = Map::new();
        entries.insert("userRole".to_string(), json!(self.role()));
        entries.insert("isLoggedIn".to_string(), json!(true));
        entries.insert("userEmail".to_string(), json!(self.email));
        entries.insert("userId".to_string(), json!(user_id));
        entries.insert("userName".to_string(), json!(self.user_name()));
        entries.insert("userPhone".to_string(), json!(self.phone.as_deref().unwrap_or_default()));
        entries.insert("userPosition".to_string(), json!(self.position()));
        entries.insert("lastLogin".to_string(), json!(clock::format_timestamp(at)));
        entries
    }
}

/// Starter list seeded for users who have none yet.
pub fn default_service_descriptions() -> Value {
    Value::Array(
        DEFAULT_SERVICE_DESCRIPTIONS
            .iter()
            .enumerate()
            .map(|(i, text)| json!({ "id": i + 1, "text": text }))
            .collect(),
    )
}
