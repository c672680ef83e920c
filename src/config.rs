//! Desk configuration
//!
//! Read from an optional JSON file, then overridden by environment
//! variables (`INVOICEDESK_*`, `SUPABASE_*`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::{GuardConfig, SESSION_KEYS};
use crate::store::SupabaseConfig;

pub const CONFIG_PATH_VAR: &str = "INVOICEDESK_CONFIG";

/// One week.
pub const MAX_IDLE_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;
/// Ten years.
pub const MAX_BIN_RETENTION_DAYS: i64 = 3650;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },

    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Supabase backend needs SUPABASE_URL and SUPABASE_ANON_KEY")]
    SupabaseNotConfigured,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Supabase,
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "supabase" => Ok(Backend::Supabase),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeskConfig {
    pub idle_timeout_minutes: u64,
    pub session_keys: Vec<String>,
    pub bin_retention_days: i64,
    pub backend: Backend,
    pub database_path: PathBuf,
    pub supabase: SupabaseConfig,
    /// Access token adopted at startup (Supabase backend).
    pub access_token: Option<String>,
    /// Signed-in user for the offline SQLite desk.
    pub local_user: Option<String>,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 30,
            session_keys: SESSION_KEYS.iter().map(|k| k.to_string()).collect(),
            bin_retention_days: 30,
            backend: Backend::Sqlite,
            database_path: PathBuf::from("data/invoicedesk.db"),
            supabase: SupabaseConfig::default(),
            access_token: None,
            local_user: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar { name, value })
}

impl DeskConfig {
    /// Load `path` if given and present, then apply the process environment.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config: DeskConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from `lookup` (the environment, in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("INVOICEDESK_IDLE_TIMEOUT_MINUTES") {
            self.idle_timeout_minutes = parse_var("INVOICEDESK_IDLE_TIMEOUT_MINUTES", value)?;
        }
        if let Some(value) = lookup("INVOICEDESK_BIN_RETENTION_DAYS") {
            self.bin_retention_days = parse_var("INVOICEDESK_BIN_RETENTION_DAYS", value)?;
        }
        if let Some(value) = lookup("INVOICEDESK_BACKEND") {
            self.backend = parse_var("INVOICEDESK_BACKEND", value)?;
        }
        if let Some(value) = lookup("INVOICEDESK_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("INVOICEDESK_USER") {
            self.local_user = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = lookup("SUPABASE_URL") {
            self.supabase.url = value;
        }
        if let Some(value) = lookup("SUPABASE_ANON_KEY") {
            self.supabase.anon_key = value;
        }
        if let Some(value) = lookup("SUPABASE_ACCESS_TOKEN") {
            self.access_token = Some(value).filter(|v| !v.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_minutes > MAX_IDLE_TIMEOUT_MINUTES {
            return Err(ConfigError::OutOfRange {
                name: "idleTimeoutMinutes",
                value: i64::try_from(self.idle_timeout_minutes).unwrap_or(i64::MAX),
                min: 0,
                max: MAX_IDLE_TIMEOUT_MINUTES as i64,
            });
        }
        if !(0..=MAX_BIN_RETENTION_DAYS).contains(&self.bin_retention_days) {
            return Err(ConfigError::OutOfRange {
                name: "binRetentionDays",
                value: self.bin_retention_days,
                min: 0,
                max: MAX_BIN_RETENTION_DAYS,
            });
        }
        if self.backend == Backend::Supabase && !self.supabase.is_configured() {
            return Err(ConfigError::SupabaseNotConfigured);
        }
        Ok(())
    }

    /// Idle timeout, clamped to one minute through one week.
    pub fn idle_timeout(&self) -> Duration {
        let minutes = self
            .idle_timeout_minutes
            .clamp(1, MAX_IDLE_TIMEOUT_MINUTES);
        Duration::from_secs(minutes.checked_mul(60).unwrap_or(u64::MAX))
    }

    pub fn bin_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.bin_retention_days.clamp(0, MAX_BIN_RETENTION_DAYS))
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            idle_timeout: self.idle_timeout(),
            session_keys: self.session_keys.clone(),
        }
    }
}
