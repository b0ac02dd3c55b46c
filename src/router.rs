//! Inbound message routing with exactly-once dedup.
//!
//! Every message id is claimed in the dedup ledger before anything else
//! happens. The router then decides, from the thread's current flow, where
//! the message goes:
//!
//! 1. an AI confirmation waiting on the thread,
//! 2. a guided capture in progress,
//! 3. a new flow: images go to the queue, a start keyword starts a capture.
//!
//! Everything else is suppressed. Handler errors stop here: they are logged
//! and the message is still marked processed, so it is never re-run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::connection::Outbound;
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscribeOptions};
use crate::flow::render::FINISH_CURRENT_FIRST;
use crate::flow::{FlowEngine, FlowError};
use crate::queue::{ImageQueue, QueueEntry};
use crate::store::dedup::Duplicate;
use crate::store::settings::SettingsStore;
use crate::store::{FlowKind, StateStore};
use crate::types::{InboundEnvelope, InboundMessage, MessageBody, SessionKey};

/// Router options.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Texts that start a guided capture, compared case-insensitively.
    pub start_keywords: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            start_keywords: vec!["expense".to_owned(), "new expense".to_owned()],
        }
    }
}

/// Where a message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Image queued for extraction.
    ImageQueue,
    /// A new guided capture.
    StartCapture,
    /// An answer to the capture in progress.
    Answer,
    /// A reply to an AI confirmation.
    Confirmation,
}

/// Why a message was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Sent by the session itself.
    FromSelf,
    /// Not from the tenant's configured group.
    OtherThread,
    /// The thread is writing its record.
    Finalizing,
    /// An image arrived while the thread was busy.
    ImageWhileBusy,
    /// Text with nothing to attach to.
    NoActiveFlow,
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The id was already seen.
    Duplicate,
    /// Ignored on purpose.
    Suppressed(Suppression),
    /// Handled.
    Handled(Route),
    /// The handler failed. The message is still marked processed.
    Failed(Route),
}

enum Decision {
    Suppress(Suppression),
    Dispatch(Route),
}

/// Decides where each inbound message goes.
pub struct MessageRouter {
    config: RouterConfig,
    state: Arc<StateStore>,
    settings: Arc<SettingsStore>,
    flow: Arc<FlowEngine>,
    queue: ImageQueue,
    outbound: Arc<dyn Outbound>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl MessageRouter {
    /// Create a router.
    pub fn new(
        config: RouterConfig,
        state: Arc<StateStore>,
        settings: Arc<SettingsStore>,
        flow: Arc<FlowEngine>,
        queue: ImageQueue,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let start_keywords = config
            .start_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            config: RouterConfig { start_keywords },
            state,
            settings,
            flow,
            queue,
            outbound,
        }
    }

    /// Subscribe the router to inbound messages on `bus`.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        bus.on(
            EventKind::MessageReceived,
            Arc::new(RouterHandler {
                router: Arc::clone(self),
            }),
            SubscribeOptions::default(),
        );
    }

    /// Route one message. Never fails; see [`RouteOutcome`].
    pub async fn route(&self, key: &SessionKey, message: &InboundMessage) -> RouteOutcome {
        if let Err(Duplicate(marker)) = self.state.begin_message(key, &message.id) {
            debug!(session = %key, message_id = %message.id, ?marker, "duplicate message");
            return RouteOutcome::Duplicate;
        }

        match self.classify(key, message) {
            Decision::Suppress(reason) => {
                if reason == Suppression::ImageWhileBusy {
                    if let Err(e) = self
                        .outbound
                        .send_text(key, &message.thread, FINISH_CURRENT_FIRST)
                        .await
                    {
                        warn!(session = %key, error = %e, "busy notice not delivered");
                    }
                }
                self.state.suppress_message(key, &message.id);
                debug!(session = %key, message_id = %message.id, ?reason, "message suppressed");
                RouteOutcome::Suppressed(reason)
            }
            Decision::Dispatch(route) => {
                let result = self.dispatch(key, message, route).await;
                self.state.complete_message(key, &message.id);
                match result {
                    Ok(()) => RouteOutcome::Handled(route),
                    Err(e) => {
                        error!(
                            session = %key,
                            thread = %message.thread,
                            message_id = %message.id,
                            ?route,
                            class = %e.class(),
                            error = %e,
                            "message handler failed"
                        );
                        RouteOutcome::Failed(route)
                    }
                }
            }
        }
    }

    fn classify(&self, key: &SessionKey, message: &InboundMessage) -> Decision {
        if message.from_me {
            return Decision::Suppress(Suppression::FromSelf);
        }
        if !self
            .settings
            .cached(key)
            .accepts_thread(message.thread_name.as_deref())
        {
            return Decision::Suppress(Suppression::OtherThread);
        }

        let thread = message.thread.as_str();
        let flow = self.state.flow_kind(key, thread);
        let processing = self.state.is_processing(key, thread);
        let is_image = matches!(message.body, MessageBody::Image { .. });

        match flow {
            Some(FlowKind::Finalizing) => Decision::Suppress(Suppression::Finalizing),
            Some(_) if is_image => Decision::Suppress(Suppression::ImageWhileBusy),
            Some(FlowKind::Confirming) => Decision::Dispatch(Route::Confirmation),
            Some(FlowKind::Collecting) => Decision::Dispatch(Route::Answer),
            None if is_image && processing => Decision::Suppress(Suppression::ImageWhileBusy),
            None if is_image => Decision::Dispatch(Route::ImageQueue),
            None if !processing && self.is_start_keyword(message) => {
                Decision::Dispatch(Route::StartCapture)
            }
            None => Decision::Suppress(Suppression::NoActiveFlow),
        }
    }

    fn is_start_keyword(&self, message: &InboundMessage) -> bool {
        message.text().is_some_and(|text| {
            let text = text.to_lowercase();
            self.config.start_keywords.iter().any(|k| *k == text)
        })
    }

    async fn dispatch(
        &self,
        key: &SessionKey,
        message: &InboundMessage,
        route: Route,
    ) -> Result<(), FlowError> {
        let thread = message.thread.as_str();
        match route {
            Route::ImageQueue => {
                let MessageBody::Image { image } = &message.body else {
                    return Err(FlowError::Invariant {
                        thread: thread.to_owned(),
                        detail: "queued a message without an image".to_owned(),
                    });
                };
                self.state.mark_processing(key, thread);
                self.queue
                    .enqueue(QueueEntry::new(
                        key.clone(),
                        thread,
                        message.id.clone(),
                        image.clone(),
                    ))
                    .await;
                Ok(())
            }
            Route::StartCapture => {
                self.flow
                    .start_capture(key, thread, &message.id, None)
                    .await
            }
            Route::Answer => self.flow.handle_answer(key, thread, message).await,
            Route::Confirmation => {
                self.flow
                    .handle_confirmation_reply(key, thread, message)
                    .await
            }
        }
    }
}

struct RouterHandler {
    router: Arc<MessageRouter>,
}

#[async_trait]
impl EventHandler for RouterHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<Value> {
        let envelope: InboundEnvelope = event.payload_as()?;
        let outcome = self
            .router
            .route(&envelope.session, &envelope.message)
            .await;
        Ok(json!({ "outcome": format!("{outcome:?}") }))
    }
}
