//! FIFO ingestion queue for receipt images.
//!
//! At most one image is processed in-process at a time. The in-flight flag
//! is set under the queue lock before any external call starts and cleared
//! once processing ends, after which the queue drains again. With a broker
//! configured, each image is offered to the broker first; an accepted image
//! frees the slot immediately and comes back through
//! [`ImageQueue::process_from_broker`]. If the broker fails or misses its
//! deadline, the image is processed locally and a late broker delivery is
//! skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::CollaboratorError;
use crate::connection::Outbound;
use crate::error::{ErrorClass, FailureNotice};
use crate::events::{EventBus, EventKind};
use crate::flow::render::BROKER_DEGRADED;
use crate::flow::{FlowError, FlowEvent};
use crate::service::{HealthStatus, Service};
use crate::store::StateStore;
use crate::types::{FieldMap, ImagePayload, SessionKey};

/// Event source name for queue events.
const SOURCE: &str = "queue";

/// Ids remembered to suppress duplicate broker deliveries.
const CLAIMED_CAPACITY: usize = 4096;

/// One image waiting for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue-assigned id.
    pub id: Uuid,
    /// Session the image arrived on.
    pub session: SessionKey,
    /// Thread the image arrived in.
    pub thread: String,
    /// The image message id.
    pub origin_message_id: String,
    /// The image.
    pub image: ImagePayload,
    /// When the entry was queued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// New entry stamped now.
    pub fn new(
        session: SessionKey,
        thread: impl Into<String>,
        origin_message_id: impl Into<String>,
        image: ImagePayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            thread: thread.into(),
            origin_message_id: origin_message_id.into(),
            image,
            enqueued_at: Utc::now(),
        }
    }
}

/// Why an image could not be processed.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Not an image MIME type.
    #[error("unsupported file type {mime_type}")]
    Format {
        /// Reported MIME type.
        mime_type: String,
    },

    /// Larger than the configured limit.
    #[error("image is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Image size.
        size: usize,
        /// Limit.
        limit: usize,
    },

    /// Processing exceeded its budget.
    #[error("processing timed out after {seconds}s")]
    Timeout {
        /// Budget in seconds.
        seconds: u64,
    },

    /// The extractor failed.
    #[error("extraction failed: {0}")]
    Extraction(#[source] CollaboratorError),

    /// Starting the follow-up flow failed.
    #[error("flow failed: {0}")]
    Flow(#[source] FlowError),
}

impl ProcessingError {
    /// Classification for logs.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Format { .. } | Self::TooLarge { .. } => ErrorClass::MalformedInput,
            Self::Timeout { .. } => ErrorClass::ExternalDependency,
            Self::Extraction(e) => e.class(),
            Self::Flow(e) => e.class(),
        }
    }

    /// User-facing notice for this failure.
    pub fn notice(&self) -> FailureNotice {
        match self {
            Self::Format { .. } | Self::Extraction(CollaboratorError::Rejected(_)) => {
                FailureNotice::Format
            }
            Self::TooLarge { limit, .. } => FailureNotice::Size {
                limit_bytes: *limit,
            },
            Self::Timeout { .. } | Self::Extraction(CollaboratorError::Timeout { .. }) => {
                FailureNotice::Timeout
            }
            Self::Extraction(_) | Self::Flow(_) => FailureNotice::Generic,
        }
    }
}

/// Work done for each image.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Process one image. Errors become user notices.
    async fn process(&self, entry: &QueueEntry) -> Result<(), ProcessingError>;
}

/// External work queue offering more concurrency than the in-process slot.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Hand an entry to the broker. `Ok` means the broker will deliver it
    /// back through [`ImageQueue::process_from_broker`].
    async fn enqueue(&self, entry: &QueueEntry) -> anyhow::Result<()>;
}

/// Queue limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Largest accepted image.
    pub max_image_bytes: usize,
    /// Budget for processing one image.
    pub processing_timeout: Duration,
    /// Budget for the broker to accept an entry.
    pub broker_deadline: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * 1024 * 1024,
            processing_timeout: Duration::from_secs(120),
            broker_deadline: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    backlog: VecDeque<QueueEntry>,
    in_flight: bool,
    claimed: HashSet<Uuid>,
    claimed_order: VecDeque<Uuid>,
}

impl QueueState {
    /// Record that an entry is being processed. `false` if it already was.
    fn claim(&mut self, id: Uuid) -> bool {
        if !self.claimed.insert(id) {
            return false;
        }
        self.claimed_order.push_back(id);
        while self.claimed_order.len() > CLAIMED_CAPACITY {
            if let Some(old) = self.claimed_order.pop_front() {
                self.claimed.remove(&old);
            }
        }
        true
    }
}

struct QueueInner {
    config: QueueConfig,
    processor: Arc<dyn ImageProcessor>,
    broker: Option<Arc<dyn Broker>>,
    outbound: Arc<dyn Outbound>,
    state: Arc<StateStore>,
    bus: Arc<EventBus>,
    queue: Mutex<QueueState>,
    idle: Notify,
}

/// The image ingestion queue. Cheap to clone.
#[derive(Clone)]
pub struct ImageQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for ImageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageQueue")
            .field("len", &self.len())
            .field("in_flight", &self.is_in_flight())
            .field("broker", &self.inner.broker.is_some())
            .finish()
    }
}

impl ImageQueue {
    /// Create a queue.
    pub fn new(
        config: QueueConfig,
        processor: Arc<dyn ImageProcessor>,
        broker: Option<Arc<dyn Broker>>,
        outbound: Arc<dyn Outbound>,
        state: Arc<StateStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                processor,
                broker,
                outbound,
                state,
                bus,
                queue: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.inner.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append an entry and try to start it.
    pub async fn enqueue(&self, entry: QueueEntry) {
        let payload = json!({
            "id": entry.id,
            "session": entry.session,
            "thread": entry.thread,
            "origin_message_id": entry.origin_message_id,
            "bytes": entry.image.data.len(),
        });
        let depth = {
            let mut queue = self.lock();
            queue.backlog.push_back(entry);
            queue.backlog.len()
        };
        debug!(depth, "image queued");
        self.inner
            .bus
            .emit(EventKind::ImageQueued, payload, SOURCE)
            .await;
        self.drain();
    }

    /// Start the head entry unless one is in flight. Returns whether an
    /// entry was started.
    pub fn drain(&self) -> bool {
        let entry = {
            let mut queue = self.lock();
            if queue.in_flight {
                return false;
            }
            let Some(entry) = queue.backlog.pop_front() else {
                return false;
            };
            queue.in_flight = true;
            entry
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.run(entry).await;
        });
        true
    }

    /// Entries waiting (not counting the one in flight).
    pub fn len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().backlog.is_empty()
    }

    /// Whether an entry holds the in-process slot.
    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Wait until nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let queue = self.lock();
                if !queue.in_flight && queue.backlog.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Broker callback: process an entry the broker accepted.
    ///
    /// Returns `false` without doing anything when the entry was already
    /// processed locally.
    pub async fn process_from_broker(&self, entry: QueueEntry) -> bool {
        if !self.lock().claim(entry.id) {
            debug!(entry = %entry.id, "broker delivery already handled locally");
            return false;
        }
        self.handle(&entry).await;
        true
    }

    async fn run(&self, entry: QueueEntry) {
        if let Some(broker) = &self.inner.broker {
            let deadline = self.inner.config.broker_deadline;
            let offered = tokio::time::timeout(deadline, broker.enqueue(&entry)).await;
            match offered {
                Ok(Ok(())) => {
                    debug!(entry = %entry.id, "broker accepted image");
                    self.release();
                    return;
                }
                Ok(Err(e)) => {
                    warn!(entry = %entry.id, error = %e, "broker rejected image, processing locally");
                }
                Err(_) => {
                    warn!(
                        entry = %entry.id,
                        deadline_ms = deadline.as_millis(),
                        "broker missed its deadline, processing locally"
                    );
                }
            }
            if let Err(e) = self
                .inner
                .outbound
                .send_text(&entry.session, &entry.thread, BROKER_DEGRADED)
                .await
            {
                debug!(session = %entry.session, error = %e, "degraded notice not delivered");
            }
        }

        if self.lock().claim(entry.id) {
            self.handle(&entry).await;
        } else {
            debug!(entry = %entry.id, "image already handled by broker");
        }
        self.release();
    }

    /// Clear the in-flight flag and start the next entry.
    fn release(&self) {
        let idle = {
            let mut queue = self.lock();
            queue.in_flight = false;
            queue.backlog.is_empty()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
        self.drain();
    }

    /// Validate and process one entry, then clean up on failure.
    async fn handle(&self, entry: &QueueEntry) {
        let result = match self.validate(entry) {
            Ok(()) => {
                let budget = self.inner.config.processing_timeout;
                match tokio::time::timeout(budget, self.inner.processor.process(entry)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProcessingError::Timeout {
                        seconds: budget.as_secs(),
                    }),
                }
            }
            Err(e) => Err(e),
        };
        self.inner
            .state
            .clear_processing(&entry.session, &entry.thread);

        match result {
            Ok(()) => info!(session = %entry.session, entry = %entry.id, "image processed"),
            Err(e) => self.fail(entry, e).await,
        }
    }

    fn validate(&self, entry: &QueueEntry) -> Result<(), ProcessingError> {
        if !entry.image.is_image() {
            return Err(ProcessingError::Format {
                mime_type: entry.image.mime_type.clone(),
            });
        }
        let limit = self.inner.config.max_image_bytes;
        let size = entry.image.data.len();
        if size > limit {
            return Err(ProcessingError::TooLarge { size, limit });
        }
        Ok(())
    }

    async fn fail(&self, entry: &QueueEntry, failure: ProcessingError) {
        warn!(
            session = %entry.session,
            thread = %entry.thread,
            entry = %entry.id,
            class = %failure.class(),
            error = %failure,
            "image processing failed"
        );
        self.inner
            .state
            .remove_flow_for(&entry.session, &entry.thread, &entry.origin_message_id);

        let notice = failure.notice().message();
        if let Err(e) = self
            .inner
            .outbound
            .send_text(&entry.session, &entry.thread, &notice)
            .await
        {
            error!(session = %entry.session, error = %e, "failure notice not delivered");
        }

        let event = FlowEvent {
            session: entry.session.clone(),
            thread: entry.thread.clone(),
            origin_message_id: entry.origin_message_id.clone(),
            fields: FieldMap::new(),
            image_url: None,
            error: Some(failure.to_string()),
        };
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.inner
                    .bus
                    .emit(EventKind::FlowFailed, payload, SOURCE)
                    .await;
            }
            Err(e) => error!(error = %e, "failed to encode flow event"),
        }
    }
}

#[async_trait]
impl Service for ImageQueue {
    fn name(&self) -> &'static str {
        "image_queue"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let dropped = {
            let mut queue = self.lock();
            let dropped = queue.backlog.len();
            queue.backlog.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "image queue cleared with pending entries");
        }
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        let (len, in_flight) = {
            let queue = self.lock();
            (queue.backlog.len(), queue.in_flight)
        };
        HealthStatus::Healthy {
            details: format!("{len} queued, in flight: {in_flight}"),
        }
    }
}
