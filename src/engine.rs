//! Runtime wiring.
//!
//! [`Engine`] owns one of each component, connects them through the event
//! bus, and drives their [`Service`] lifecycle plus the background sweeps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collaborators::http::{HttpExtractor, HttpStorage};
use crate::collaborators::{ExpenseStorage, Extractor};
use crate::config::Config;
use crate::connection::bridge::BridgeTransport;
use crate::connection::{ConnectionConfig, ConnectionManager, Outbound, Transport};
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::events::{Event, EventBus, Middleware};
use crate::flow::{FlowConfig, FlowEngine};
use crate::queue::{Broker, ImageProcessor, ImageQueue, QueueConfig};
use crate::router::{MessageRouter, RouterConfig};
use crate::service::{HealthStatus, Service};
use crate::store::settings::SettingsStore;
use crate::store::StateStore;

/// How long [`Engine::stop`] waits for the image queue to go idle.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Component tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Connection manager.
    pub connection: ConnectionConfig,
    /// Flow engine.
    pub flow: FlowConfig,
    /// Router.
    pub router: RouterConfig,
    /// Image queue.
    pub queue: QueueConfig,
    /// Dedup markers kept per session.
    pub dedup_max_entries: usize,
    /// Connection health sweep period.
    pub health_sweep_interval: Duration,
    /// Flow expiry sweep period.
    pub expiry_sweep_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    /// Settings from loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection: config.connection.to_connection_config(),
            flow: config.flow.to_flow_config(),
            router: config.router.to_router_config(),
            queue: config.queue.to_queue_config(),
            dedup_max_entries: config.router.dedup_max_entries,
            health_sweep_interval: config.connection.health_sweep_interval(),
            expiry_sweep_interval: config.flow.expiry_sweep_interval(),
        }
    }
}

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Messaging platform.
    pub transport: Arc<dyn Transport>,
    /// Session credentials.
    pub credentials: Arc<dyn CredentialStore>,
    /// AI extraction.
    pub extractor: Arc<dyn Extractor>,
    /// Record and image storage.
    pub storage: Arc<dyn ExpenseStorage>,
    /// Optional work broker for image processing.
    pub broker: Option<Arc<dyn Broker>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("broker", &self.broker.is_some())
            .finish_non_exhaustive()
    }
}

/// Logs every event at debug level.
struct EventLog;

#[async_trait]
impl Middleware for EventLog {
    fn name(&self) -> &str {
        "event_log"
    }

    async fn process(&self, event: &Event) -> anyhow::Result<()> {
        debug!(
            kind = %event.kind,
            source = %event.source,
            event_id = %event.id,
            "event"
        );
        Ok(())
    }
}

/// The assembled engine.
pub struct Engine {
    settings: EngineSettings,
    bus: Arc<EventBus>,
    state: Arc<StateStore>,
    store: Arc<SettingsStore>,
    connections: ConnectionManager,
    flow: Arc<FlowEngine>,
    queue: ImageQueue,
    router: Arc<MessageRouter>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.connections)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Wire components together. Nothing runs until [`start`](Self::start).
    pub fn new(
        settings: EngineSettings,
        store: Arc<SettingsStore>,
        collaborators: Collaborators,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        bus.use_middleware(Arc::new(EventLog));

        let state = Arc::new(StateStore::new(settings.dedup_max_entries));

        let connections = ConnectionManager::new(
            settings.connection.clone(),
            collaborators.transport,
            collaborators.credentials,
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&bus),
        );
        let outbound: Arc<dyn Outbound> = Arc::new(connections.clone());

        let flow = Arc::new(FlowEngine::new(
            settings.flow.clone(),
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&outbound),
            collaborators.extractor,
            collaborators.storage,
            Arc::clone(&bus),
        ));
        flow.register_terminal_handler(&bus);

        let processor: Arc<dyn ImageProcessor> = Arc::clone(&flow) as Arc<dyn ImageProcessor>;
        let queue = ImageQueue::new(
            settings.queue.clone(),
            processor,
            collaborators.broker,
            Arc::clone(&outbound),
            Arc::clone(&state),
            Arc::clone(&bus),
        );

        let router = Arc::new(MessageRouter::new(
            settings.router.clone(),
            Arc::clone(&state),
            Arc::clone(&store),
            Arc::clone(&flow),
            queue.clone(),
            outbound,
        ));
        router.register(&bus);

        let (shutdown, _) = watch::channel(false);

        Self {
            settings,
            bus,
            state,
            store,
            connections,
            flow,
            queue,
            router,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build an engine from configuration with the HTTP collaborators and
    /// file-backed credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if state directories cannot be created, the
    /// settings database cannot be opened, or the bridge URL is invalid.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db_path = config.paths.settings_db()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            SettingsStore::open(&db_path)
                .await
                .with_context(|| format!("failed to open {}", db_path.display()))?,
        );

        let transport = BridgeTransport::new(&config.bridge.base_url, config.bridge.api_key.clone())
            .context("failed to configure bridge transport")?;

        let timeout = config.collaborators.request_timeout_secs;
        let collaborators = Collaborators {
            transport: Arc::new(transport),
            credentials: Arc::new(FileCredentialStore::new(config.paths.credentials_dir()?)),
            extractor: Arc::new(HttpExtractor::new(
                config.collaborators.extractor_url.clone(),
                config.collaborators.extractor_api_key.clone(),
                timeout,
            )),
            storage: Arc::new(HttpStorage::new(
                config.collaborators.storage_url.clone(),
                config.collaborators.storage_api_key.clone(),
                timeout,
            )),
            broker: None,
        };

        Ok(Self::new(
            EngineSettings::from_config(config),
            store,
            collaborators,
        ))
    }

    /// Event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// In-memory conversation state.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Persisted settings.
    pub fn settings_store(&self) -> &Arc<SettingsStore> {
        &self.store
    }

    /// Connection manager.
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Flow engine.
    pub fn flow(&self) -> &Arc<FlowEngine> {
        &self.flow
    }

    /// Image queue.
    pub fn queue(&self) -> &ImageQueue {
        &self.queue
    }

    /// Message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Services in start order. Stop runs them in reverse.
    fn services(&self) -> [&dyn Service; 4] {
        [&*self.bus, &*self.state, &self.queue, &self.connections]
    }

    /// Initialize every service and start the background sweeps.
    ///
    /// Initializing the connection manager restores sessions persisted as
    /// authenticated.
    ///
    /// # Errors
    ///
    /// Returns the first service initialization failure.
    pub async fn start(&self) -> anyhow::Result<()> {
        for service in self.services() {
            service
                .initialize()
                .await
                .with_context(|| format!("failed to initialize {}", service.name()))?;
            debug!(service = service.name(), "service initialized");
        }

        let health = self
            .connections
            .spawn_health_sweep(self.settings.health_sweep_interval, self.shutdown.subscribe());
        let expiry = self
            .flow
            .spawn_expiry_sweep(self.settings.expiry_sweep_interval, self.shutdown.subscribe());
        self.lock_tasks().extend([health, expiry]);

        info!("engine started");
        Ok(())
    }

    /// Health of every service, in start order.
    pub async fn health(&self) -> Vec<(&'static str, HealthStatus)> {
        let mut report = Vec::with_capacity(4);
        for service in self.services() {
            report.push((service.name(), service.health_check().await));
        }
        report
    }

    /// Stop sweeps, let the image queue drain, and clean up services in
    /// reverse start order. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }

        if tokio::time::timeout(SHUTDOWN_DRAIN, self.queue.wait_idle())
            .await
            .is_err()
        {
            warn!(
                pending = self.queue.len(),
                "image queue did not drain before shutdown"
            );
        }

        for service in self.services().into_iter().rev() {
            if let Err(e) = service.cleanup().await {
                warn!(service = service.name(), error = %e, "service cleanup failed");
            }
        }
        info!("engine stopped");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
