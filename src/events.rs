//! In-process publish/subscribe hub with priority ordering and middleware.
//!
//! Producers call [`EventBus::emit`]; consumers register an
//! [`EventHandler`] with [`EventBus::on`]. Middleware runs first, in
//! registration order, and can only observe. Handlers then run one after
//! another in descending priority (ties keep registration order), and each
//! handler's outcome is collected instead of aborting the emission.
//!
//! The registry sits behind a sync [`Mutex`] whose critical sections never
//! span an `.await`: the handler list is snapshotted, the lock released,
//! and handlers awaited afterwards.

use std::cmp::Reverse;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::service::{HealthStatus, Service};

/// Errors raised while decoding events.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The payload does not have the shape its kind promises.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        /// Kind of the offending event.
        kind: EventKind,
        /// Decode failure.
        source: serde_json::Error,
    },
}

impl BusError {
    /// Classification for logs.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidPayload { .. } => ErrorClass::MalformedInput,
        }
    }
}

/// Kinds of events flowing through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The platform issued a pairing code for a session.
    SessionPairing,
    /// A session's transport reported open.
    SessionReady,
    /// A session hit a recoverable transport error.
    SessionDegraded,
    /// A session was torn down.
    SessionClosed,
    /// An inbound message arrived on a ready session.
    MessageReceived,
    /// An image entered the ingestion queue.
    ImageQueued,
    /// A capture flow wrote its record.
    FlowCompleted,
    /// The user cancelled a flow.
    FlowCancelled,
    /// A flow ended in failure.
    FlowFailed,
    /// A flow timed out.
    FlowExpired,
}

impl EventKind {
    /// Whether this kind ends a conversation flow.
    pub fn is_terminal_flow(self) -> bool {
        matches!(
            self,
            Self::FlowCompleted | Self::FlowCancelled | Self::FlowFailed | Self::FlowExpired
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An immutable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Event data.
    pub payload: Value,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Unique event id.
    pub id: Uuid,
    /// Component that produced the event.
    pub source: String,
}

impl Event {
    /// Create an event stamped with the current time and a fresh id.
    pub fn new(kind: EventKind, payload: Value, source: impl Into<String>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source: source.into(),
        }
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidPayload`] when the payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, BusError> {
        T::deserialize(&self.payload).map_err(|source| BusError::InvalidPayload {
            kind: self.kind,
            source,
        })
    }
}

/// Consumer of events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are caught and recorded by the bus.
    async fn handle(&self, event: &Event) -> anyhow::Result<Value>;
}

/// Observer that sees every event before handlers do.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs when the middleware fails.
    fn name(&self) -> &str;

    /// Inspect an event. An error is logged and never blocks delivery.
    async fn process(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<Value> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<Value> {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as an [`EventHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Remove after the first invocation.
    pub once: bool,
}

impl SubscribeOptions {
    /// Options with the given priority.
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            once: false,
        }
    }

    /// Mark the subscription as fire-once.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }
}

/// Handle returned by [`EventBus::on`], usable with [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Result of one handler invocation during an emission.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    /// Which subscription ran.
    pub subscription: SubscriptionId,
    /// Handler return value or its error rendered as text.
    pub result: Result<Value, String>,
}

impl HandlerOutcome {
    /// Whether the handler succeeded.
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }
}

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    priority: i32,
    once: bool,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
    middleware: Vec<Arc<dyn Middleware>>,
}

/// The event bus.
#[derive(Default)]
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (subs, mw) = match self.registry.lock() {
            Ok(r) => (r.subscriptions.len(), r.middleware.len()),
            Err(_) => (0, 0),
        };
        f.debug_struct("EventBus")
            .field("subscriptions", &subs)
            .field("middleware", &mw)
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = SubscriptionId(registry.next_id);
        registry.next_id = registry.next_id.saturating_add(1);
        registry.subscriptions.push(Subscription {
            id,
            kind,
            priority: options.priority,
            once: options.once,
            handler,
        });
        debug!(%kind, priority = options.priority, once = options.once, "handler registered");
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = registry.subscriptions.len();
        registry.subscriptions.retain(|s| s.id != id);
        registry.subscriptions.len() != before
    }

    /// Append a middleware. Middleware run in registration order.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.middleware.push(middleware);
    }

    /// Number of live subscriptions for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        match self.registry.lock() {
            Ok(r) => r.subscriptions.iter().filter(|s| s.kind == kind).count(),
            Err(_) => 0,
        }
    }

    /// Build an event and deliver it.
    pub async fn emit(
        &self,
        kind: EventKind,
        payload: Value,
        source: &str,
    ) -> Vec<HandlerOutcome> {
        self.publish(Event::new(kind, payload, source)).await
    }

    /// Deliver a pre-built event.
    pub async fn publish(&self, event: Event) -> Vec<HandlerOutcome> {
        let (middleware, handlers) = self.select(event.kind);

        for mw in &middleware {
            if let Err(e) = mw.process(&event).await {
                warn!(middleware = mw.name(), kind = %event.kind, error = %e, "middleware failed");
            }
        }

        let mut outcomes = Vec::with_capacity(handlers.len());
        for (id, handler) in handlers {
            let result = match handler.handle(&event).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!(kind = %event.kind, event_id = %event.id, error = %e, "event handler failed");
                    Err(format!("{e:#}"))
                }
            };
            outcomes.push(HandlerOutcome {
                subscription: id,
                result,
            });
        }
        outcomes
    }

    /// Snapshot middleware and matching handlers in run order, removing
    /// `once` subscriptions as they are selected.
    #[allow(clippy::type_complexity)]
    fn select(
        &self,
        kind: EventKind,
    ) -> (
        Vec<Arc<dyn Middleware>>,
        Vec<(SubscriptionId, Arc<dyn EventHandler>)>,
    ) {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut matching: Vec<(Reverse<i32>, SubscriptionId, Arc<dyn EventHandler>)> = registry
            .subscriptions
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| (Reverse(s.priority), s.id, Arc::clone(&s.handler)))
            .collect();
        // Ids grow with registration, so they break priority ties in order.
        matching.sort_by_key(|(priority, id, _)| (*priority, id.0));

        registry.subscriptions.retain(|s| !(s.kind == kind && s.once));

        (
            registry.middleware.clone(),
            matching.into_iter().map(|(_, id, h)| (id, h)).collect(),
        )
    }
}

#[async_trait]
impl Service for EventBus {
    fn name(&self) -> &'static str {
        "event_bus"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.subscriptions.clear();
        registry.middleware.clear();
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.registry.lock() {
            Ok(r) => HealthStatus::Healthy {
                details: format!("{} subscriptions", r.subscriptions.len()),
            },
            Err(_) => HealthStatus::Degraded {
                details: "registry lock poisoned".to_owned(),
            },
        }
    }
}
