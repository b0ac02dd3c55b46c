//! Persisted per-session state: the authenticated flag and tenant settings.
//!
//! Backed by SQLite through `sqlx`. Settings are cached in memory and
//! refreshed when a session becomes ready or on an explicit
//! [`SettingsStore::reload`], so the router and flow engine can read them
//! without touching the database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::StoreError;
use crate::types::{default_questions, Question, SessionKey, StorageDestination};

const SCHEMA: &str = include_str!("../../migrations/001_schema.sql");

/// Tenant-configurable behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Only messages from the chat with this name are handled, when set.
    pub group_name: Option<String>,
    /// Template for the completion message; `{field}` placeholders are filled.
    pub message_template: Option<String>,
    /// Custom question list. Empty means the defaults.
    pub questions: Vec<Question>,
    /// Where records and images are stored.
    pub destination: StorageDestination,
    /// Use AI extraction for receipt images.
    pub ai_enabled: bool,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            group_name: None,
            message_template: None,
            questions: Vec::new(),
            destination: StorageDestination::default(),
            ai_enabled: true,
        }
    }
}

impl TenantSettings {
    /// The question list in effect.
    pub fn effective_questions(&self) -> Vec<Question> {
        if self.questions.is_empty() {
            default_questions()
        } else {
            self.questions.clone()
        }
    }

    /// Whether a message from a chat named `thread_name` should be handled.
    pub fn accepts_thread(&self, thread_name: Option<&str>) -> bool {
        match self.group_name.as_deref() {
            None => true,
            Some(wanted) => thread_name.is_some_and(|name| name.eq_ignore_ascii_case(wanted)),
        }
    }
}

/// SQLite-backed settings and auth-flag store.
#[derive(Debug)]
pub struct SettingsStore {
    db: SqlitePool,
    cache: RwLock<HashMap<SessionKey, TenantSettings>>,
}

impl SettingsStore {
    /// Wrap an existing pool and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn new(db: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&db).await?;
        Ok(Self {
            db,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "settings database opened");
        Self::new(pool).await
    }

    /// In-memory database, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        // The database lives only as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    /// Persist the authenticated flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_authenticated(
        &self,
        key: &SessionKey,
        authenticated: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_auth (tenant, identity, authenticated, updated_at) \
             VALUES (?1, ?2, ?3, datetime('now')) \
             ON CONFLICT(tenant, identity) DO UPDATE SET \
                 authenticated = excluded.authenticated, updated_at = datetime('now')",
        )
        .bind(&key.tenant)
        .bind(&key.identity)
        .bind(authenticated)
        .execute(&self.db)
        .await?;
        debug!(session = %key, authenticated, "authenticated flag stored");
        Ok(())
    }

    /// Read the authenticated flag. Unknown sessions are unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn is_authenticated(&self, key: &SessionKey) -> Result<bool, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT authenticated FROM session_auth WHERE tenant = ?1 AND identity = ?2",
        )
        .bind(&key.tenant)
        .bind(&key.identity)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.is_some_and(|(flag,)| flag))
    }

    /// Every session with a stored flag, ordered by tenant then identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn sessions(&self) -> Result<Vec<(SessionKey, bool)>, StoreError> {
        let rows: Vec<(String, String, bool)> = sqlx::query_as(
            "SELECT tenant, identity, authenticated FROM session_auth ORDER BY tenant, identity",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(tenant, identity, auth)| (SessionKey { tenant, identity }, auth))
            .collect())
    }

    /// Write settings and refresh the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save(&self, key: &SessionKey, settings: &TenantSettings) -> Result<(), StoreError> {
        let json = serde_json::to_string(settings)?;
        sqlx::query(
            "INSERT INTO tenant_settings (tenant, identity, settings_json, updated_at) \
             VALUES (?1, ?2, ?3, datetime('now')) \
             ON CONFLICT(tenant, identity) DO UPDATE SET \
                 settings_json = excluded.settings_json, updated_at = datetime('now')",
        )
        .bind(&key.tenant)
        .bind(&key.identity)
        .bind(&json)
        .execute(&self.db)
        .await?;
        self.cache_insert(key, settings.clone());
        Ok(())
    }

    /// Re-read settings from the database into the cache.
    ///
    /// Missing rows yield defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or deserialization fails.
    pub async fn reload(&self, key: &SessionKey) -> Result<TenantSettings, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT settings_json FROM tenant_settings WHERE tenant = ?1 AND identity = ?2",
        )
        .bind(&key.tenant)
        .bind(&key.identity)
        .fetch_optional(&self.db)
        .await?;
        let settings = match row {
            Some((json,)) => serde_json::from_str(&json)?,
            None => TenantSettings::default(),
        };
        self.cache_insert(key, settings.clone());
        debug!(session = %key, "settings reloaded");
        Ok(settings)
    }

    /// Cached settings, or defaults when never loaded.
    pub fn cached(&self, key: &SessionKey) -> TenantSettings {
        match self.cache.read() {
            Ok(cache) => cache.get(key).cloned().unwrap_or_default(),
            Err(_) => TenantSettings::default(),
        }
    }

    /// Drop a session's cached settings.
    pub fn evict(&self, key: &SessionKey) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(key);
        }
    }

    fn cache_insert(&self, key: &SessionKey, settings: TenantSettings) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key.clone(), settings);
        }
    }
}
