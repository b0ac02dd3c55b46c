//! Connection manager: at most one live platform session per
//! (tenant, identity).
//!
//! [`ConnectionManager::acquire`] is single-flight per key. The first caller
//! starts a session task; concurrent callers subscribe to the same
//! handshake and observe the same outcome. Each session task owns its
//! transport connection for its whole life: it drives the handshake,
//! pumps inbound signals onto the event bus, reconnects with backoff when
//! the link drops, and cleans up when the session ends.
//!
//! A per-key gate serializes credential access. Purging credentials on
//! logout happens under the gate, so no new handshake for that key can load
//! stale material.

pub mod bridge;
pub mod handshake;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use handshake::{ClosedReason, HandshakeState, PairingCode, ReconnectPolicy};
pub use transport::{
    CloseReason, Transport, TransportConnection, TransportError, TransportFault, TransportHandle,
    TransportSignal,
};

use crate::credentials::{AuthMaterial, CredentialStore};
use crate::error::ErrorClass;
use crate::events::{EventBus, EventKind};
use crate::service::{HealthStatus, Service};
use crate::store::settings::SettingsStore;
use crate::store::StateStore;
use crate::types::{chrono_duration, InboundEnvelope, Presence, SessionKey};

/// Event source name for everything this module emits.
const SOURCE: &str = "connection";

/// Extra time a waiting caller allows beyond the handshake timeout, so the
/// session task reports its own timeout first.
const WAIT_GRACE: Duration = Duration::from_secs(1);

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum concurrently live sessions. Further handshakes queue FIFO.
    pub max_sessions: usize,
    /// Budget for connect plus the first pairing code or open signal.
    pub handshake_timeout: Duration,
    /// How long a pairing code stays valid.
    pub pairing_ttl: Duration,
    /// Ready sessions idle longer than this are torn down by the sweep.
    pub inactivity_timeout: Duration,
    /// Reconnect schedule for degraded sessions.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            handshake_timeout: Duration::from_secs(60),
            pairing_ttl: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(60 * 60 * 24),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors surfaced by the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A transport call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session ended before the operation could complete.
    #[error("session closed: {0}")]
    Closed(ClosedReason),

    /// The handshake did not produce an outcome in time.
    #[error("handshake did not complete within {millis}ms")]
    HandshakeTimeout {
        /// Configured handshake timeout in milliseconds.
        millis: u64,
    },

    /// There is no ready session for the key.
    #[error("session {0} is not ready")]
    NotReady(SessionKey),

    /// The credential store failed.
    #[error("credential store failed: {0:#}")]
    Credentials(anyhow::Error),
}

impl ConnectionError {
    /// Classification driving recovery.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(e) => e.class(),
            Self::Closed(reason) if reason.purges_credentials() => ErrorClass::AuthInvalid,
            Self::Closed(_) | Self::HandshakeTimeout { .. } | Self::NotReady(_) => {
                ErrorClass::TransientTransport
            }
            Self::Credentials(_) => ErrorClass::ExternalDependency,
        }
    }
}

/// Outcome of [`ConnectionManager::acquire`].
#[derive(Debug, Clone)]
pub enum Acquired {
    /// The session is open and authenticated.
    Ready(SessionHandle),
    /// The user must link the device with this code first.
    PairingRequired(PairingCode),
}

/// Outbound access to one ready session.
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    transport: Arc<dyn TransportHandle>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Session this handle belongs to.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Send a text message to a thread.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn send_text(&self, thread: &str, text: &str) -> Result<(), TransportError> {
        self.transport.send_text(thread, text).await
    }

    /// Update presence on a thread.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn send_presence(&self, thread: &str, presence: Presence) -> Result<(), TransportError> {
        self.transport.send_presence(thread, presence).await
    }
}

/// Point-in-time view of a session, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session key.
    pub key: SessionKey,
    /// Lifecycle state.
    pub state: HandshakeState,
    /// Reconnect attempts since the last ready.
    pub reconnect_attempts: u32,
    /// When the session task started.
    pub started_at: DateTime<Utc>,
    /// Last inbound or outbound activity.
    pub last_active: DateTime<Utc>,
}

/// Sending side used by the router, flows, and queue.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send a text message on a ready session.
    async fn send_text(
        &self,
        key: &SessionKey,
        thread: &str,
        text: &str,
    ) -> Result<(), ConnectionError>;

    /// Update presence on a ready session.
    async fn update_presence(
        &self,
        key: &SessionKey,
        thread: &str,
        presence: Presence,
    ) -> Result<(), ConnectionError>;
}

struct SessionEntry {
    generation: u64,
    state: watch::Sender<HandshakeState>,
    handle: Option<Arc<dyn TransportHandle>>,
    started_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    reconnect_attempts: u32,
    task: Option<AbortHandle>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionEntry {
    fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), HandshakeState::Ready)
    }

    fn transition(&mut self, key: &SessionKey, next: HandshakeState) {
        let current = self.state.borrow().clone();
        if !current.allows(&next) {
            warn!(
                session = %key,
                from = current.label(),
                to = next.label(),
                "unexpected handshake transition"
            );
        }
        self.state.send_replace(next);
    }
}

/// What the signal pump does after handling one signal.
enum Step {
    Continue,
    Reconnect(String),
    Close(ClosedReason),
}

/// Why a single reconnect attempt failed.
enum AttemptError {
    Transient(String),
    Closed(ClosedReason),
}

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<SettingsStore>,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
    gates: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
    permits: Arc<Semaphore>,
    next_generation: AtomicU64,
}

/// Owns every live session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("sessions", &self.inner.lock_sessions().len())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager with no sessions.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        settings: Arc<SettingsStore>,
        state: Arc<StateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credentials,
                settings,
                state,
                bus,
                sessions: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                permits,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Get a ready session for `key`, starting a handshake if none is live.
    ///
    /// Concurrent calls for the same key share one handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the handshake ends the session
    /// and [`ConnectionError::HandshakeTimeout`] if no outcome arrives in time.
    pub async fn acquire(&self, key: &SessionKey) -> Result<Acquired, ConnectionError> {
        let (rx, spawn_generation) = {
            let mut sessions = self.inner.lock_sessions();
            if let Some(entry) = sessions.get_mut(key) {
                if entry.is_ready() {
                    if let Some(handle) = entry.handle.clone() {
                        entry.last_active = Utc::now();
                        return Ok(Acquired::Ready(SessionHandle {
                            key: key.clone(),
                            transport: handle,
                        }));
                    }
                }
                (entry.state.subscribe(), None)
            } else {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(HandshakeState::Queued);
                let now = Utc::now();
                sessions.insert(
                    key.clone(),
                    SessionEntry {
                        generation,
                        state: tx,
                        handle: None,
                        started_at: now,
                        last_active: now,
                        reconnect_attempts: 0,
                        task: None,
                        permit: None,
                    },
                );
                (rx, Some(generation))
            }
        };

        if let Some(generation) = spawn_generation {
            info!(session = %key, generation, "starting handshake");
            let task = tokio::spawn(run_session(
                Arc::clone(&self.inner),
                key.clone(),
                generation,
            ));
            self.inner
                .with_entry(key, generation, |e| e.task = Some(task.abort_handle()));
        } else {
            debug!(session = %key, "joining in-flight handshake");
        }

        self.wait_outcome(key, rx).await
    }

    async fn wait_outcome(
        &self,
        key: &SessionKey,
        mut rx: watch::Receiver<HandshakeState>,
    ) -> Result<Acquired, ConnectionError> {
        // Time spent behind the session cap does not count against the budget.
        while matches!(*rx.borrow_and_update(), HandshakeState::Queued) {
            if rx.changed().await.is_err() {
                return Err(ConnectionError::Closed(ClosedReason::Teardown));
            }
        }

        let timeout = self.inner.config.handshake_timeout;
        let budget = timeout.saturating_add(WAIT_GRACE);
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    HandshakeState::Ready => {
                        if let Some(handle) = self.inner.ready_handle(key) {
                            return Ok(Acquired::Ready(handle));
                        }
                    }
                    HandshakeState::AwaitingPairing { pairing } => {
                        return Ok(Acquired::PairingRequired(pairing));
                    }
                    HandshakeState::Closed { reason } => {
                        return Err(ConnectionError::Closed(reason));
                    }
                    HandshakeState::Queued
                    | HandshakeState::Init
                    | HandshakeState::Degraded
                    | HandshakeState::Reconnecting { .. } => {}
                }
                if rx.changed().await.is_err() {
                    return Err(ConnectionError::Closed(ClosedReason::Teardown));
                }
            }
        };
        match tokio::time::timeout(budget, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout {
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Close a session, release its capacity slot, drop its conversation
    /// state, and mark it unauthenticated. Credentials are kept.
    ///
    /// Returns `false` if no session was live. Calling it twice is harmless.
    pub async fn teardown(&self, key: &SessionKey) -> bool {
        self.inner.close(key, None, true, ClosedReason::Teardown).await
    }

    /// Log the identity out on the platform, close the session, and purge
    /// stored credentials under the key's gate.
    ///
    /// Works without a live session, in which case only local material is
    /// purged. Returns whether a live session was closed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Credentials`] if purging fails.
    pub async fn logout(&self, key: &SessionKey) -> Result<bool, ConnectionError> {
        let (handle, task) = {
            let mut sessions = self.inner.lock_sessions();
            match sessions.get_mut(key) {
                Some(entry) => (entry.handle.clone(), entry.task.take()),
                None => (None, None),
            }
        };
        // Stop the pump first so the platform's close signal is not handled twice.
        if let Some(task) = task {
            task.abort();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.logout().await {
                warn!(session = %key, error = %e, "platform logout failed, purging locally");
            }
        }

        if self
            .inner
            .close(key, None, true, ClosedReason::LoggedOut)
            .await
        {
            return Ok(true);
        }

        let gate = self.inner.gate(key);
        let _guard = gate.lock().await;
        self.inner
            .credentials
            .purge(key)
            .await
            .map_err(ConnectionError::Credentials)?;
        if let Err(e) = self.inner.settings.set_authenticated(key, false).await {
            warn!(session = %key, error = %e, "failed to clear authenticated flag");
        }
        info!(session = %key, "logged out without a live session");
        Ok(false)
    }

    /// Tear down sessions that are idle, have an expired pairing code, or
    /// have lost their credentials. Returns what was closed and why.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<(SessionKey, ClosedReason)> {
        let inactivity = chrono_duration(self.inner.config.inactivity_timeout);
        let mut doomed = Vec::new();
        let mut ready = Vec::new();
        {
            let sessions = self.inner.lock_sessions();
            for (key, entry) in sessions.iter() {
                match &*entry.state.borrow() {
                    HandshakeState::Ready => {
                        if now.signed_duration_since(entry.last_active) > inactivity {
                            doomed.push((key.clone(), entry.generation, ClosedReason::Inactive));
                        } else {
                            ready.push((key.clone(), entry.generation));
                        }
                    }
                    HandshakeState::AwaitingPairing { pairing } if pairing.is_expired(now) => {
                        doomed.push((key.clone(), entry.generation, ClosedReason::PairingExpired));
                    }
                    _ => {}
                }
            }
        }

        for (key, generation) in ready {
            if !self.inner.credentials.exists(&key).await {
                doomed.push((key, generation, ClosedReason::CredentialsMissing));
            }
        }

        let mut closed = Vec::new();
        for (key, generation, reason) in doomed {
            if self
                .inner
                .close(&key, Some(generation), true, reason.clone())
                .await
            {
                closed.push((key, reason));
            }
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "health sweep closed sessions");
        }
        closed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` flips.
    pub fn spawn_health_sweep(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        info!("health sweep shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Start handshakes for every session persisted as authenticated.
    ///
    /// Handshakes run in the background; returns how many were started.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings store cannot be read.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let sessions = self.inner.settings.sessions().await?;
        let mut started: usize = 0;
        for (key, authenticated) in sessions {
            if !authenticated {
                continue;
            }
            let manager = self.clone();
            tokio::spawn(async move {
                match manager.acquire(&key).await {
                    Ok(Acquired::Ready(_)) => debug!(session = %key, "session restored"),
                    Ok(Acquired::PairingRequired(_)) => {
                        warn!(session = %key, "restored session needs pairing again");
                    }
                    Err(e) => warn!(session = %key, error = %e, "failed to restore session"),
                }
            });
            started = started.saturating_add(1);
        }
        info!(count = started, "restoring authenticated sessions");
        Ok(started)
    }

    /// Close every session without touching credentials or the
    /// authenticated flag.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.inner.lock_sessions().keys().cloned().collect();
        for key in keys {
            self.inner.close(&key, None, true, ClosedReason::Shutdown).await;
        }
    }

    /// Lifecycle state of a session, if one is live.
    pub fn state(&self, key: &SessionKey) -> Option<HandshakeState> {
        self.inner
            .lock_sessions()
            .get(key)
            .map(|e| e.state.borrow().clone())
    }

    /// Snapshot of every live session, ordered by key.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.inner.lock_sessions();
        let mut out: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(key, e)| SessionSnapshot {
                key: key.clone(),
                state: e.state.borrow().clone(),
                reconnect_attempts: e.reconnect_attempts,
                started_at: e.started_at,
                last_active: e.last_active,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Capacity slots not held by a session.
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

#[async_trait]
impl Outbound for ConnectionManager {
    async fn send_text(
        &self,
        key: &SessionKey,
        thread: &str,
        text: &str,
    ) -> Result<(), ConnectionError> {
        let handle = self
            .inner
            .ready_handle(key)
            .ok_or_else(|| ConnectionError::NotReady(key.clone()))?;
        handle.send_text(thread, text).await?;
        self.inner.touch(key);
        Ok(())
    }

    async fn update_presence(
        &self,
        key: &SessionKey,
        thread: &str,
        presence: Presence,
    ) -> Result<(), ConnectionError> {
        let handle = self
            .inner
            .ready_handle(key)
            .ok_or_else(|| ConnectionError::NotReady(key.clone()))?;
        handle.send_presence(thread, presence).await?;
        Ok(())
    }
}

#[async_trait]
impl Service for ConnectionManager {
    fn name(&self) -> &'static str {
        "connections"
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.restore().await?;
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        let ready = snapshot
            .iter()
            .filter(|s| s.state == HandshakeState::Ready)
            .count();
        let degraded = snapshot
            .iter()
            .filter(|s| {
                matches!(
                    s.state,
                    HandshakeState::Degraded | HandshakeState::Reconnecting { .. }
                )
            })
            .count();
        let details = format!(
            "{ready} ready, {degraded} reconnecting, {} total",
            snapshot.len()
        );
        if degraded > 0 {
            HealthStatus::Degraded { details }
        } else {
            HealthStatus::Healthy { details }
        }
    }
}

impl Inner {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, SessionEntry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn gate(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    /// Run `f` on the entry for `key` if it still belongs to `generation`.
    fn with_entry<R>(
        &self,
        key: &SessionKey,
        generation: u64,
        f: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        let mut sessions = self.lock_sessions();
        match sessions.get_mut(key) {
            Some(entry) if entry.generation == generation => Some(f(entry)),
            _ => None,
        }
    }

    fn set_state(&self, key: &SessionKey, generation: u64, next: HandshakeState) -> bool {
        self.with_entry(key, generation, |e| e.transition(key, next))
            .is_some()
    }

    fn is_ready(&self, key: &SessionKey, generation: u64) -> bool {
        self.with_entry(key, generation, |e| e.is_ready())
            .unwrap_or(false)
    }

    fn ready_handle(&self, key: &SessionKey) -> Option<SessionHandle> {
        let sessions = self.lock_sessions();
        let entry = sessions.get(key)?;
        if !entry.is_ready() {
            return None;
        }
        entry.handle.clone().map(|transport| SessionHandle {
            key: key.clone(),
            transport,
        })
    }

    fn touch(&self, key: &SessionKey) {
        if let Some(entry) = self.lock_sessions().get_mut(key) {
            entry.last_active = Utc::now();
        }
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.bus.emit(kind, payload, SOURCE).await;
    }

    async fn save_credentials(&self, key: &SessionKey, material: &AuthMaterial) {
        if let Err(e) = self.credentials.save(key, material).await {
            error!(session = %key, error = %e, "failed to persist credentials");
        }
    }

    /// Remove and close a session.
    ///
    /// `generation` restricts the close to one incarnation of the key.
    /// `abort_task` must be false when the session task closes itself.
    async fn close(
        &self,
        key: &SessionKey,
        generation: Option<u64>,
        abort_task: bool,
        reason: ClosedReason,
    ) -> bool {
        let gate = self.gate(key);
        let guard = gate.lock().await;

        let entry = {
            let mut sessions = self.lock_sessions();
            match sessions.get(key) {
                Some(e) if generation.map_or(true, |g| g == e.generation) => sessions.remove(key),
                _ => None,
            }
        };
        let Some(mut entry) = entry else {
            return false;
        };

        if abort_task {
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        entry.transition(
            key,
            HandshakeState::Closed {
                reason: reason.clone(),
            },
        );
        if let Some(handle) = entry.handle.take() {
            handle.close().await;
        }
        // Releases the capacity slot and wakes remaining waiters.
        drop(entry);

        if reason.purges_credentials() {
            if let Err(e) = self.credentials.purge(key).await {
                error!(session = %key, error = %e, "failed to purge credentials");
            }
        }
        if reason != ClosedReason::Shutdown {
            if let Err(e) = self.settings.set_authenticated(key, false).await {
                warn!(session = %key, error = %e, "failed to clear authenticated flag");
            }
        }
        drop(guard);

        self.state.release_session(key);
        self.settings.evict(key);
        info!(session = %key, %reason, "session closed");
        self.emit(
            EventKind::SessionClosed,
            json!({ "session": key, "reason": reason }),
        )
        .await;
        true
    }

    /// Persist the flag and load settings before waiters see `Ready`. The
    /// gate keeps a concurrent close from interleaving with the write.
    async fn mark_ready(&self, key: &SessionKey, generation: u64) {
        let gate = self.gate(key);
        let guard = gate.lock().await;
        if self.with_entry(key, generation, |_| ()).is_none() {
            return;
        }
        if let Err(e) = self.settings.set_authenticated(key, true).await {
            warn!(session = %key, error = %e, "failed to persist authenticated flag");
        }
        if let Err(e) = self.settings.reload(key).await {
            warn!(session = %key, error = %e, "failed to load tenant settings");
        }
        let now = Utc::now();
        let updated = self.with_entry(key, generation, |e| {
            e.reconnect_attempts = 0;
            e.last_active = now;
            e.transition(key, HandshakeState::Ready);
        });
        drop(guard);
        if updated.is_none() {
            return;
        }
        info!(session = %key, "session ready");
        self.emit(EventKind::SessionReady, json!({ "session": key }))
            .await;
    }

    /// Handshake, pump, and reconnect until the session ends.
    async fn drive(&self, key: &SessionKey, generation: u64) -> ClosedReason {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return ClosedReason::Shutdown,
        };
        let admitted = self.with_entry(key, generation, move |e| {
            e.permit = Some(permit);
            e.transition(key, HandshakeState::Init);
        });
        if admitted.is_none() {
            return ClosedReason::Teardown;
        }
        let dispatch = spawn_dispatcher(Arc::clone(&self.bus), key.clone());

        let connection = {
            let gate = self.gate(key);
            let _guard = gate.lock().await;
            let credentials = match self.credentials.load(key).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(session = %key, error = %e, "unreadable credentials, pairing from scratch");
                    None
                }
            };
            let resumed = credentials.is_some();
            match tokio::time::timeout(
                self.config.handshake_timeout,
                self.transport.connect(key, credentials),
            )
            .await
            {
                Ok(Ok(connection)) => {
                    debug!(session = %key, resumed, "transport connected");
                    connection
                }
                Ok(Err(e)) if e.class() == ErrorClass::AuthInvalid => {
                    return ClosedReason::AuthInvalid;
                }
                Ok(Err(e)) => return ClosedReason::HandshakeFailed(e.to_string()),
                Err(_) => return ClosedReason::HandshakeFailed("connect timed out".to_owned()),
            }
        };

        let TransportConnection {
            mut handle,
            mut signals,
        } = connection;
        if self
            .with_entry(key, generation, |e| e.handle = Some(Arc::clone(&handle)))
            .is_none()
        {
            handle.close().await;
            return ClosedReason::Teardown;
        }

        let mut deadline = Some((
            deadline_after(self.config.handshake_timeout),
            ClosedReason::HandshakeFailed("no pairing code or open signal in time".to_owned()),
        ));

        loop {
            let signal = if let Some((at, reason)) = &deadline {
                tokio::select! {
                    signal = signals.recv() => signal,
                    () = tokio::time::sleep_until(*at) => return reason.clone(),
                }
            } else {
                signals.recv().await
            };

            let step = match signal {
                Some(signal) => {
                    self.handle_signal(key, generation, signal, &dispatch, &mut deadline)
                        .await
                }
                None => Step::Reconnect("signal stream ended".to_owned()),
            };

            match step {
                Step::Continue => {}
                Step::Close(reason) => return reason,
                Step::Reconnect(cause) => {
                    if !self.is_ready(key, generation) {
                        return ClosedReason::HandshakeFailed(cause);
                    }
                    match self.reconnect(key, generation, &handle, &cause).await {
                        Ok(connection) => {
                            handle = connection.handle;
                            signals = connection.signals;
                            let swapped = self.with_entry(key, generation, |e| {
                                e.handle = Some(Arc::clone(&handle));
                            });
                            if swapped.is_none() {
                                handle.close().await;
                                return ClosedReason::Teardown;
                            }
                            self.mark_ready(key, generation).await;
                        }
                        Err(reason) => return reason,
                    }
                }
            }
        }
    }

    async fn handle_signal(
        &self,
        key: &SessionKey,
        generation: u64,
        signal: TransportSignal,
        dispatch: &mpsc::UnboundedSender<serde_json::Value>,
        deadline: &mut Option<(Instant, ClosedReason)>,
    ) -> Step {
        match signal {
            TransportSignal::PairingCode(code) => {
                if self.is_ready(key, generation) {
                    warn!(session = %key, "pairing requested on a ready session");
                    return Step::Close(ClosedReason::AuthInvalid);
                }
                let now = Utc::now();
                let ttl = self.config.pairing_ttl;
                let pairing = PairingCode {
                    code,
                    expires_at: now
                        .checked_add_signed(chrono_duration(ttl))
                        .unwrap_or(now),
                };
                if !self.set_state(
                    key,
                    generation,
                    HandshakeState::AwaitingPairing {
                        pairing: pairing.clone(),
                    },
                ) {
                    return Step::Close(ClosedReason::Teardown);
                }
                *deadline = Some((deadline_after(ttl), ClosedReason::PairingExpired));
                info!(session = %key, expires_at = %pairing.expires_at, "awaiting pairing");
                self.emit(
                    EventKind::SessionPairing,
                    json!({
                        "session": key,
                        "code": pairing.code,
                        "expires_at": pairing.expires_at,
                    }),
                )
                .await;
                Step::Continue
            }
            TransportSignal::Open => {
                *deadline = None;
                self.mark_ready(key, generation).await;
                Step::Continue
            }
            TransportSignal::Closed(CloseReason::LoggedOut) => Step::Close(ClosedReason::LoggedOut),
            TransportSignal::Closed(other) => Step::Reconnect(format!("closed: {other:?}")),
            TransportSignal::Error(TransportFault::AuthInvalid(detail)) => {
                warn!(session = %key, %detail, "credentials rejected");
                Step::Close(ClosedReason::AuthInvalid)
            }
            TransportSignal::Error(TransportFault::Transport(detail)) => Step::Reconnect(detail),
            TransportSignal::Message(message) => {
                if !self.is_ready(key, generation) {
                    debug!(session = %key, message_id = %message.id, "message before ready dropped");
                    return Step::Continue;
                }
                self.touch(key);
                let envelope = InboundEnvelope {
                    session: key.clone(),
                    message,
                };
                match serde_json::to_value(&envelope) {
                    Ok(payload) => {
                        if dispatch.send(payload).is_err() {
                            error!(session = %key, "message dispatcher stopped");
                        }
                    }
                    Err(e) => error!(session = %key, error = %e, "failed to encode inbound message"),
                }
                Step::Continue
            }
            TransportSignal::CredentialsUpdated(material) => {
                self.save_credentials(key, &material).await;
                Step::Continue
            }
        }
    }

    /// Reconnect a degraded session with exponential backoff.
    async fn reconnect(
        &self,
        key: &SessionKey,
        generation: u64,
        stale: &Arc<dyn TransportHandle>,
        cause: &str,
    ) -> Result<TransportConnection, ClosedReason> {
        stale.close().await;
        if !self.set_state(key, generation, HandshakeState::Degraded) {
            return Err(ClosedReason::Teardown);
        }
        warn!(session = %key, cause, "session degraded");
        self.emit(
            EventKind::SessionDegraded,
            json!({ "session": key, "reason": cause }),
        )
        .await;

        let policy = self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            let moved = self.with_entry(key, generation, |e| {
                e.reconnect_attempts = attempt;
                e.transition(key, HandshakeState::Reconnecting { attempt });
            });
            if moved.is_none() {
                return Err(ClosedReason::Teardown);
            }
            let delay = policy.delay_for(attempt);
            debug!(session = %key, attempt, delay_ms = delay.as_millis(), "reconnect scheduled");
            tokio::time::sleep(delay).await;

            let credentials = {
                let gate = self.gate(key);
                let _guard = gate.lock().await;
                match self.credentials.load(key).await {
                    Ok(Some(material)) => material,
                    Ok(None) => return Err(ClosedReason::CredentialsMissing),
                    Err(e) => {
                        warn!(session = %key, attempt, error = %e, "failed to load credentials");
                        continue;
                    }
                }
            };

            match tokio::time::timeout(policy.attempt_timeout, self.open(key, credentials)).await {
                Ok(Ok(connection)) => {
                    info!(session = %key, attempt, "reconnected");
                    return Ok(connection);
                }
                Ok(Err(AttemptError::Closed(reason))) => return Err(reason),
                Ok(Err(AttemptError::Transient(detail))) => {
                    warn!(session = %key, attempt, %detail, "reconnect attempt failed");
                }
                Err(_) => warn!(session = %key, attempt, "reconnect attempt timed out"),
            }
        }
        warn!(session = %key, attempts = policy.max_attempts, "giving up on session");
        Err(ClosedReason::RetriesExhausted)
    }

    /// Connect with stored credentials and wait for the open signal.
    async fn open(
        &self,
        key: &SessionKey,
        credentials: AuthMaterial,
    ) -> Result<TransportConnection, AttemptError> {
        let TransportConnection {
            handle,
            mut signals,
        } = match self.transport.connect(key, Some(credentials)).await {
            Ok(connection) => connection,
            Err(e) if e.class() == ErrorClass::AuthInvalid => {
                return Err(AttemptError::Closed(ClosedReason::AuthInvalid));
            }
            Err(e) => return Err(AttemptError::Transient(e.to_string())),
        };

        let failure = loop {
            match signals.recv().await {
                Some(TransportSignal::Open) => return Ok(TransportConnection { handle, signals }),
                Some(TransportSignal::CredentialsUpdated(material)) => {
                    self.save_credentials(key, &material).await;
                }
                Some(TransportSignal::Message(message)) => {
                    debug!(session = %key, message_id = %message.id, "message before open dropped");
                }
                // A fresh pairing code means the stored material no longer works.
                Some(TransportSignal::PairingCode(_))
                | Some(TransportSignal::Error(TransportFault::AuthInvalid(_))) => {
                    break AttemptError::Closed(ClosedReason::AuthInvalid);
                }
                Some(TransportSignal::Closed(CloseReason::LoggedOut)) => {
                    break AttemptError::Closed(ClosedReason::LoggedOut);
                }
                Some(TransportSignal::Closed(other)) => {
                    break AttemptError::Transient(format!("closed: {other:?}"));
                }
                Some(TransportSignal::Error(TransportFault::Transport(detail))) => {
                    break AttemptError::Transient(detail);
                }
                None => break AttemptError::Transient("signal stream ended".to_owned()),
            }
        };
        handle.close().await;
        Err(failure)
    }
}

async fn run_session(inner: Arc<Inner>, key: SessionKey, generation: u64) {
    let reason = inner.drive(&key, generation).await;
    inner.close(&key, Some(generation), false, reason).await;
}

/// Publish a session's inbound messages in arrival order.
///
/// Handlers run here rather than in the session task, so closing a session
/// never cancels an upload or write already under way. The worker drains
/// what was queued and exits once the session task drops its sender.
fn spawn_dispatcher(
    bus: Arc<EventBus>,
    key: SessionKey,
) -> mpsc::UnboundedSender<serde_json::Value> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            bus.emit(EventKind::MessageReceived, payload, SOURCE).await;
        }
        debug!(session = %key, "message dispatcher finished");
    });
    tx
}

fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration).unwrap_or(now)
}
