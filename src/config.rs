//! Configuration loading.
//!
//! Loads from `$SPENDWIRE_CONFIG_PATH` or `~/.spendwire/config.toml`.
//! Precedence: env vars > config file > defaults. A missing file yields
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::connection::{ConnectionConfig, ReconnectPolicy};
use crate::flow::edits::ReplyTokens;
use crate::flow::FlowConfig;
use crate::queue::QueueConfig;
use crate::router::RouterConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging bridge sidecar.
    pub bridge: BridgeConfig,
    /// Session lifecycle.
    pub connection: ConnectionSection,
    /// Capture and confirmation flows.
    pub flow: FlowSection,
    /// Routing and dedup.
    pub router: RouterSection,
    /// Image ingestion.
    pub queue: QueueSection,
    /// Extraction and storage services.
    pub collaborators: CollaboratorsConfig,
    /// Persistent state locations.
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration with precedence env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok())?;
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if no env override is set and the home directory
    /// cannot be determined.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(p) = env("SPENDWIRE_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        Ok(config_dir()?.join("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Bridge.
        if let Some(v) = env("SPENDWIRE_BRIDGE_URL") {
            self.bridge.base_url = v;
        }
        if let Some(v) = env("SPENDWIRE_BRIDGE_API_KEY") {
            self.bridge.api_key = Some(v);
        }

        // Connection.
        if let Some(v) = env("SPENDWIRE_MAX_SESSIONS") {
            match v.parse() {
                Ok(n) => self.connection.max_sessions = n,
                Err(_) => tracing::warn!(
                    var = "SPENDWIRE_MAX_SESSIONS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Collaborators.
        if let Some(v) = env("SPENDWIRE_EXTRACTOR_URL") {
            self.collaborators.extractor_url = v;
        }
        if let Some(v) = env("SPENDWIRE_EXTRACTOR_API_KEY") {
            self.collaborators.extractor_api_key = Some(v);
        }
        if let Some(v) = env("SPENDWIRE_STORAGE_URL") {
            self.collaborators.storage_url = v;
        }
        if let Some(v) = env("SPENDWIRE_STORAGE_API_KEY") {
            self.collaborators.storage_api_key = Some(v);
        }

        // Paths.
        if let Some(v) = env("SPENDWIRE_DATA_DIR") {
            self.paths.data_dir = Some(PathBuf::from(v));
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or mistyped values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

/// The default state directory (`~/.spendwire/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".spendwire"))
}

// ── Bridge ──────────────────────────────────────────────────────

/// Messaging bridge sidecar.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Sidecar base URL.
    pub base_url: String,
    /// Shared secret sent as a bearer token.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_owned(),
            api_key: None,
        }
    }
}

// ── Connection ──────────────────────────────────────────────────

/// Session lifecycle tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Global cap on live sessions.
    pub max_sessions: usize,
    /// Connect-to-outcome budget.
    pub handshake_timeout_secs: u64,
    /// Pairing code lifetime.
    pub pairing_ttl_secs: u64,
    /// Idle time before a ready session is torn down.
    pub inactivity_timeout_secs: u64,
    /// Health sweep period.
    pub health_sweep_interval_secs: u64,
    /// Reconnect attempts before giving up.
    pub reconnect_max_attempts: u32,
    /// First reconnect delay.
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_delay_secs: u64,
    /// Budget for one reconnect attempt.
    pub reconnect_attempt_timeout_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            handshake_timeout_secs: 60,
            pairing_ttl_secs: 120,
            inactivity_timeout_secs: 24 * 60 * 60,
            health_sweep_interval_secs: 300,
            reconnect_max_attempts: 3,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_secs: 60,
            reconnect_attempt_timeout_secs: 30,
        }
    }
}

impl ConnectionSection {
    /// Manager configuration.
    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_sessions: self.max_sessions,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            pairing_ttl: Duration::from_secs(self.pairing_ttl_secs),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect_max_attempts,
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
                attempt_timeout: Duration::from_secs(self.reconnect_attempt_timeout_secs),
            },
        }
    }

    /// Health sweep period, at least one second.
    pub fn health_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.health_sweep_interval_secs.max(1))
    }
}

// ── Flow ────────────────────────────────────────────────────────

/// Capture and confirmation tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    /// Idle limit for guided captures.
    pub collecting_timeout_secs: u64,
    /// Idle limit for AI confirmations.
    pub confirmation_timeout_secs: u64,
    /// Expiry sweep period.
    pub expiry_sweep_interval_secs: u64,
    /// Replies that confirm extracted data.
    pub confirm_tokens: Vec<String>,
    /// Replies that discard a capture.
    pub cancel_tokens: Vec<String>,
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            collecting_timeout_secs: 30 * 60,
            confirmation_timeout_secs: 10 * 60,
            expiry_sweep_interval_secs: 60,
            confirm_tokens: vec!["ok".to_owned(), "yes".to_owned()],
            cancel_tokens: vec!["cancel".to_owned()],
        }
    }
}

impl FlowSection {
    /// Engine configuration.
    pub fn to_flow_config(&self) -> FlowConfig {
        FlowConfig {
            collecting_timeout: Duration::from_secs(self.collecting_timeout_secs),
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            tokens: ReplyTokens::new(self.confirm_tokens.clone(), self.cancel_tokens.clone()),
        }
    }

    /// Expiry sweep period, at least one second.
    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs.max(1))
    }
}

// ── Router ──────────────────────────────────────────────────────

/// Routing and dedup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Texts that start a guided capture.
    pub start_keywords: Vec<String>,
    /// Dedup markers kept per session before pruning.
    pub dedup_max_entries: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            start_keywords: RouterConfig::default().start_keywords,
            dedup_max_entries: 10_000,
        }
    }
}

impl RouterSection {
    /// Router configuration.
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            start_keywords: self.start_keywords.clone(),
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────

/// Image ingestion limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Largest accepted image in bytes.
    pub max_image_bytes: usize,
    /// Budget for processing one image.
    pub processing_timeout_secs: u64,
    /// Budget for a broker to accept an entry.
    pub broker_deadline_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            max_image_bytes: defaults.max_image_bytes,
            processing_timeout_secs: defaults.processing_timeout.as_secs(),
            broker_deadline_secs: defaults.broker_deadline.as_secs(),
        }
    }
}

impl QueueSection {
    /// Queue configuration.
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_image_bytes: self.max_image_bytes,
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            broker_deadline: Duration::from_secs(self.broker_deadline_secs),
        }
    }
}

// ── Collaborators ───────────────────────────────────────────────

/// Extraction and storage service endpoints.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CollaboratorsConfig {
    /// AI extraction service base URL.
    pub extractor_url: String,
    /// Extraction service key.
    pub extractor_api_key: Option<String>,
    /// Storage service base URL.
    pub storage_url: String,
    /// Storage service key.
    pub storage_api_key: Option<String>,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for CollaboratorsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaboratorsConfig")
            .field("extractor_url", &self.extractor_url)
            .field(
                "extractor_api_key",
                &self.extractor_api_key.as_ref().map(|_| "__REDACTED__"),
            )
            .field("storage_url", &self.storage_url)
            .field(
                "storage_api_key",
                &self.storage_api_key.as_ref().map(|_| "__REDACTED__"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            extractor_url: "http://127.0.0.1:3002".to_owned(),
            extractor_api_key: None,
            storage_url: "http://127.0.0.1:3003".to_owned(),
            storage_api_key: None,
            request_timeout_secs: 60,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Persistent state locations. Relative entries resolve under `data_dir`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for state; defaults to `~/.spendwire`.
    pub data_dir: Option<PathBuf>,
    /// Settings database.
    pub settings_db: PathBuf,
    /// Credential files.
    pub credentials_dir: PathBuf,
    /// Rolling log files.
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            settings_db: PathBuf::from("spendwire.db"),
            credentials_dir: PathBuf::from("credentials"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    /// State root.
    ///
    /// # Errors
    ///
    /// Returns an error if unset and the home directory is unknown.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config_dir(),
        }
    }

    /// Absolute settings database path.
    ///
    /// # Errors
    ///
    /// See [`data_dir`](Self::data_dir).
    pub fn settings_db(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.settings_db))
    }

    /// Absolute credentials directory.
    ///
    /// # Errors
    ///
    /// See [`data_dir`](Self::data_dir).
    pub fn credentials_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.credentials_dir))
    }

    /// Absolute logs directory.
    ///
    /// # Errors
    ///
    /// See [`data_dir`](Self::data_dir).
    pub fn logs_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.logs_dir))
    }
}

// ── Tests ───────────────────────────────────────────────────────
