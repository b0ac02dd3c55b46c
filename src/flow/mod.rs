//! Conversation flows that turn chat messages into expense records.
//!
//! Two flows exist, and a thread holds at most one of them:
//!
//! - **Guided capture**: questions are asked one at a time and each text
//!   reply fills the current field. After the last answer the flow
//!   finalizes: upload the image (if any), write the record, and send one
//!   completion message.
//! - **AI confirmation**: extracted fields are shown to the user, who
//!   confirms, cancels, or corrects them. Corrections re-present the data.
//!
//! Terminal outcomes are published on the event bus. The handler installed
//! by [`FlowEngine::register_terminal_handler`] clears the thread and resets
//! presence.

pub mod edits;
pub mod render;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use self::edits::{parse_field_edits, Reply, ReplyTokens};
use crate::collaborators::{CollaboratorError, ExpenseRecord, ExpenseStorage, Extractor};
use crate::connection::{ConnectionError, Outbound};
use crate::error::{ErrorClass, RESTART_NOTICE};
use crate::events::{Event, EventBus, EventHandler, EventKind, SubscribeOptions};
use crate::queue::{ImageProcessor, ProcessingError, QueueEntry};
use crate::store::settings::SettingsStore;
use crate::store::{
    AiConfirmationState, AnswerOutcome, ConversationState, StateStore, StoreError, ThreadFlow,
};
use crate::types::{
    chrono_duration, FieldMap, ImagePayload, InboundMessage, Presence, Question, SessionKey,
    StorageDestination,
};

/// Event source name for flow events.
const SOURCE: &str = "flow";

/// Errors from flow operations.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// State-store conflict.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An external collaborator failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Sending to the user failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The flow reached a state it should never be in.
    #[error("flow invariant violated on thread {thread}: {detail}")]
    Invariant {
        /// Thread id.
        thread: String,
        /// What went wrong.
        detail: String,
    },
}

impl FlowError {
    /// Classification for recovery and logs.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(e) => e.class(),
            Self::Collaborator(e) => e.class(),
            Self::Connection(e) => e.class(),
            Self::Invariant { .. } => ErrorClass::InternalInvariant,
        }
    }
}

/// Payload of the terminal flow events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Session the flow ran on.
    pub session: SessionKey,
    /// Thread id.
    pub thread: String,
    /// Message that started the flow.
    pub origin_message_id: String,
    /// Field values at the end of the flow.
    #[serde(default)]
    pub fields: FieldMap,
    /// Link to the uploaded image, on completion.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Failure description, on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Flow timeouts and reply tokens.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Guided captures idle longer than this are dropped silently.
    pub collecting_timeout: Duration,
    /// AI confirmations idle longer than this are dropped with a notice.
    pub confirmation_timeout: Duration,
    /// Confirm/cancel tokens.
    pub tokens: ReplyTokens,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            collecting_timeout: Duration::from_secs(30 * 60),
            confirmation_timeout: Duration::from_secs(10 * 60),
            tokens: ReplyTokens::default(),
        }
    }
}

/// Everything needed to write a record.
struct Finalization {
    origin_message_id: String,
    fields: FieldMap,
    questions: Vec<Question>,
    image: Option<ImagePayload>,
    destination: StorageDestination,
}

/// Drives capture and confirmation flows.
pub struct FlowEngine {
    config: FlowConfig,
    state: Arc<StateStore>,
    settings: Arc<SettingsStore>,
    outbound: Arc<dyn Outbound>,
    extractor: Arc<dyn Extractor>,
    storage: Arc<dyn ExpenseStorage>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FlowEngine {
    /// Create an engine.
    pub fn new(
        config: FlowConfig,
        state: Arc<StateStore>,
        settings: Arc<SettingsStore>,
        outbound: Arc<dyn Outbound>,
        extractor: Arc<dyn Extractor>,
        storage: Arc<dyn ExpenseStorage>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            state,
            settings,
            outbound,
            extractor,
            storage,
            bus,
        }
    }

    /// Reply tokens in effect.
    pub fn tokens(&self) -> &ReplyTokens {
        &self.config.tokens
    }

    // ── Guided capture ───────────────────────────────────────────

    /// Start a guided capture on an idle thread and ask the first question.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Store`] if the thread already has a flow.
    pub async fn start_capture(
        &self,
        key: &SessionKey,
        thread: &str,
        origin_message_id: &str,
        image: Option<ImagePayload>,
    ) -> Result<(), FlowError> {
        let questions = self.settings.cached(key).effective_questions();
        let capture = ConversationState::new(origin_message_id, questions, image, Utc::now());
        let Some(first) = capture.current_question().cloned() else {
            return Err(FlowError::Invariant {
                thread: thread.to_owned(),
                detail: "empty question list".to_owned(),
            });
        };
        self.state
            .start_flow(key, thread, ThreadFlow::Collecting(capture))?;
        info!(session = %key, thread, origin = origin_message_id, "guided capture started");
        self.say(key, thread, &first.prompt).await
    }

    /// Feed a reply into the guided capture on `thread`.
    ///
    /// Repeated message ids are ignored. The cancel token discards the
    /// capture. The last answer finalizes.
    ///
    /// # Errors
    ///
    /// Returns an error if a reply cannot be sent.
    pub async fn handle_answer(
        &self,
        key: &SessionKey,
        thread: &str,
        message: &InboundMessage,
    ) -> Result<(), FlowError> {
        let Some(text) = message.text() else {
            debug!(session = %key, thread, "non-text reply ignored during capture");
            return Ok(());
        };
        if self.config.tokens.classify(text) == Reply::Cancel {
            return self.cancel(key, thread).await;
        }

        let now = Utc::now();
        let outcome = self
            .state
            .update_flow(key, thread, |flow| match flow {
                ThreadFlow::Collecting(capture) => Some(capture.record_answer(&message.id, text, now)),
                _ => None,
            })
            .flatten();

        match outcome {
            None | Some(AnswerOutcome::Duplicate) => Ok(()),
            Some(AnswerOutcome::Next(question)) => self.say(key, thread, &question.prompt).await,
            Some(AnswerOutcome::Invalid) => {
                self.reset(key, thread, "answer index past the question list")
                    .await
            }
            Some(AnswerOutcome::Complete) => match self.enter_finalizing(key, thread) {
                Some(ThreadFlow::Collecting(capture)) => {
                    let destination = self.settings.cached(key).destination;
                    self.finalize(
                        key,
                        thread,
                        Finalization {
                            origin_message_id: capture.origin_message_id,
                            fields: capture.answers,
                            questions: capture.questions,
                            image: capture.image,
                            destination,
                        },
                    )
                    .await
                }
                _ => self.reset(key, thread, "capture vanished while finalizing").await,
            },
        }
    }

    // ── AI confirmation ──────────────────────────────────────────

    /// Present AI-extracted fields for confirmation on an idle thread.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Store`] if the thread already has a flow.
    pub async fn begin_confirmation(
        &self,
        key: &SessionKey,
        thread: &str,
        origin_message_id: &str,
        image: ImagePayload,
        fields: FieldMap,
    ) -> Result<(), FlowError> {
        let settings = self.settings.cached(key);
        let questions = settings.effective_questions();
        let prompt = render::confirmation_prompt(&fields, &questions, &self.config.tokens, false);
        let confirmation = AiConfirmationState {
            origin_message_id: origin_message_id.to_owned(),
            fields,
            questions,
            image,
            destination: settings.destination,
            modified: false,
            last_message_id: None,
            last_active: Utc::now(),
        };
        self.state
            .start_flow(key, thread, ThreadFlow::Confirming(confirmation))?;
        info!(session = %key, thread, origin = origin_message_id, "awaiting confirmation");
        self.say(key, thread, &prompt).await
    }

    /// Handle a reply to a confirmation prompt.
    ///
    /// Confirm token saves, cancel token discards. Anything else is read as
    /// edits, first with the local `field: value` parser and then by the
    /// extractor. No detected edit counts as a confirm; an unreadable edit
    /// re-prompts and keeps the data.
    ///
    /// # Errors
    ///
    /// Returns an error if a reply cannot be sent.
    pub async fn handle_confirmation_reply(
        &self,
        key: &SessionKey,
        thread: &str,
        message: &InboundMessage,
    ) -> Result<(), FlowError> {
        let Some(text) = message.text() else {
            debug!(session = %key, thread, "non-text reply ignored during confirmation");
            return Ok(());
        };
        let now = Utc::now();
        let current = self
            .state
            .update_flow(key, thread, |flow| match flow {
                ThreadFlow::Confirming(c) if c.last_message_id.as_deref() == Some(message.id.as_str()) => {
                    None
                }
                ThreadFlow::Confirming(c) => {
                    c.last_message_id = Some(message.id.clone());
                    c.last_active = now;
                    Some((c.fields.clone(), c.questions.clone()))
                }
                _ => None,
            })
            .flatten();
        let Some((fields, questions)) = current else {
            return Ok(());
        };

        let edit_text = match self.config.tokens.classify(text) {
            Reply::Confirm => return self.confirm(key, thread).await,
            Reply::Cancel => return self.cancel(key, thread).await,
            Reply::Edit(edit_text) => edit_text,
        };

        let local = parse_field_edits(&edit_text, &questions);
        let proposed = if local.is_empty() {
            match self
                .extractor
                .apply_edits(&edit_text, &questions, &fields)
                .await
            {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(session = %key, thread, error = %e, class = %e.class(), "edit parsing failed");
                    let prompt = render::edit_not_understood(&self.config.tokens);
                    return self.say(key, thread, &prompt).await;
                }
            }
        } else {
            local
        };
        // Restating a current value is not an edit.
        let edits: FieldMap = proposed
            .into_iter()
            .filter(|(field, value)| fields.get(field) != Some(value))
            .collect();
        if edits.is_empty() {
            debug!(session = %key, thread, "reply held no edits, confirming");
            return self.confirm(key, thread).await;
        }

        let updated = self
            .state
            .update_flow(key, thread, |flow| match flow {
                ThreadFlow::Confirming(c) => {
                    let changed = c.apply_edits(&edits);
                    Some((changed, c.fields.clone(), c.modified))
                }
                _ => None,
            })
            .flatten();
        let Some((changed, fields, modified)) = updated else {
            return Ok(());
        };
        info!(session = %key, thread, changed = ?changed, "confirmation edited");
        let prompt = render::confirmation_prompt(&fields, &questions, &self.config.tokens, modified);
        self.say(key, thread, &prompt).await
    }

    async fn confirm(&self, key: &SessionKey, thread: &str) -> Result<(), FlowError> {
        match self.enter_finalizing(key, thread) {
            Some(ThreadFlow::Confirming(c)) => {
                self.finalize(
                    key,
                    thread,
                    Finalization {
                        origin_message_id: c.origin_message_id,
                        fields: c.fields,
                        questions: c.questions,
                        image: Some(c.image),
                        destination: c.destination,
                    },
                )
                .await
            }
            Some(_) => self.reset(key, thread, "confirm outside a confirmation").await,
            None => Ok(()),
        }
    }

    /// Discard the flow on a thread.
    async fn cancel(&self, key: &SessionKey, thread: &str) -> Result<(), FlowError> {
        let Some(flow) = self.state.remove_flow(key, thread) else {
            return Ok(());
        };
        self.state.clear_processing(key, thread);
        info!(session = %key, thread, kind = ?flow.kind(), "flow cancelled");
        let sent = self.say(key, thread, render::CANCELLED).await;
        self.emit(
            EventKind::FlowCancelled,
            FlowEvent {
                session: key.clone(),
                thread: thread.to_owned(),
                origin_message_id: flow.origin_message_id().to_owned(),
                fields: FieldMap::new(),
                image_url: None,
                error: None,
            },
        )
        .await;
        sent
    }

    // ── Finalizing ───────────────────────────────────────────────

    /// Swap the thread's flow for `Finalizing`, returning what it was.
    fn enter_finalizing(&self, key: &SessionKey, thread: &str) -> Option<ThreadFlow> {
        let since = Utc::now();
        self.state
            .update_flow(key, thread, |flow| {
                if matches!(flow, ThreadFlow::Finalizing { .. }) {
                    return None;
                }
                let origin_message_id = flow.origin_message_id().to_owned();
                Some(std::mem::replace(
                    flow,
                    ThreadFlow::Finalizing {
                        origin_message_id,
                        since,
                    },
                ))
            })
            .flatten()
    }

    /// Upload, write, and report. Exactly one message reaches the user.
    async fn finalize(
        &self,
        key: &SessionKey,
        thread: &str,
        job: Finalization,
    ) -> Result<(), FlowError> {
        self.presence(key, thread, Presence::Composing).await;
        let captured_at = Utc::now();

        let (image_url, image_failed) = match &job.image {
            Some(image) => {
                let file_name = image_file_name(captured_at, &job.origin_message_id, image);
                match self
                    .storage
                    .upload_image(image, &job.destination, &file_name)
                    .await
                {
                    Ok(url) => (Some(url), false),
                    Err(e) => {
                        warn!(session = %key, thread, error = %e, "receipt upload failed");
                        (None, true)
                    }
                }
            }
            None => (None, false),
        };

        let template = self.settings.cached(key).message_template;
        let record = ExpenseRecord {
            session: key.clone(),
            thread: thread.to_owned(),
            summary: template
                .as_deref()
                .map(|t| render::fill_template(t, &job.fields))
                .unwrap_or_else(|| render::summary(&job.fields, &job.questions)),
            fields: job.fields.clone(),
            questions: job.questions.clone(),
            destination: job.destination,
            image_url: image_url.clone(),
            captured_at,
        };

        let mut event = FlowEvent {
            session: key.clone(),
            thread: thread.to_owned(),
            origin_message_id: job.origin_message_id,
            fields: job.fields,
            image_url,
            error: None,
        };

        match self.storage.write_record(&record).await {
            Ok(()) => {
                info!(session = %key, thread, image_failed, "expense recorded");
                let text = render::completion_message(
                    &event.fields,
                    &job.questions,
                    template.as_deref(),
                    image_failed,
                );
                let sent = self.say(key, thread, &text).await;
                self.emit(EventKind::FlowCompleted, event).await;
                sent
            }
            Err(e) => {
                error!(session = %key, thread, error = %e, class = %e.class(), "record write failed");
                let sent = self
                    .say(
                        key,
                        thread,
                        "Sorry, the expense could not be saved. Please try again later.",
                    )
                    .await;
                event.error = Some(e.to_string());
                self.emit(EventKind::FlowFailed, event).await;
                sent
            }
        }
    }

    /// Drop the thread's state after an invariant violation and ask the
    /// user to start over.
    async fn reset(&self, key: &SessionKey, thread: &str, detail: &str) -> Result<(), FlowError> {
        let origin = self
            .state
            .flow(key, thread)
            .map(|f| f.origin_message_id().to_owned())
            .unwrap_or_default();
        self.state.purge_thread(key, thread);
        error!(
            session = %key,
            thread,
            class = %ErrorClass::InternalInvariant,
            detail,
            "flow reset"
        );
        let sent = self.say(key, thread, RESTART_NOTICE).await;
        self.emit(
            EventKind::FlowFailed,
            FlowEvent {
                session: key.clone(),
                thread: thread.to_owned(),
                origin_message_id: origin,
                fields: FieldMap::new(),
                image_url: None,
                error: Some(detail.to_owned()),
            },
        )
        .await;
        sent
    }

    // ── Expiry ───────────────────────────────────────────────────

    /// Drop flows idle past their timeout. Confirmations get a notice,
    /// captures expire silently. Returns how many expired.
    pub async fn expire(&self, now: DateTime<Utc>) -> usize {
        let expired = self.state.take_expired(
            now,
            chrono_duration(self.config.collecting_timeout),
            chrono_duration(self.config.confirmation_timeout),
        );
        let count = expired.len();
        for item in expired {
            info!(session = %item.key, thread = %item.thread, kind = ?item.flow.kind(), "flow expired");
            if matches!(item.flow, ThreadFlow::Confirming(_)) {
                if let Err(e) = self
                    .say(&item.key, &item.thread, render::CONFIRMATION_EXPIRED)
                    .await
                {
                    debug!(session = %item.key, error = %e, "expiry notice not delivered");
                }
            }
            self.emit(
                EventKind::FlowExpired,
                FlowEvent {
                    session: item.key.clone(),
                    thread: item.thread.clone(),
                    origin_message_id: item.flow.origin_message_id().to_owned(),
                    fields: FieldMap::new(),
                    image_url: None,
                    error: None,
                },
            )
            .await;
        }
        count
    }

    /// Run [`expire`](Self::expire) every `interval` until `shutdown` flips.
    pub fn spawn_expiry_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.expire(Utc::now()).await;
                    }
                    _ = shutdown.changed() => {
                        info!("flow expiry sweep shutting down");
                        break;
                    }
                }
            }
        })
    }

    // ── Terminal cleanup ─────────────────────────────────────────

    /// Subscribe the cleanup handler to every terminal flow event.
    pub fn register_terminal_handler(self: &Arc<Self>, bus: &EventBus) {
        let handler: Arc<dyn EventHandler> = Arc::new(TerminalCleanup {
            engine: Arc::clone(self),
        });
        for kind in [
            EventKind::FlowCompleted,
            EventKind::FlowCancelled,
            EventKind::FlowFailed,
            EventKind::FlowExpired,
        ] {
            bus.on(kind, Arc::clone(&handler), SubscribeOptions::default());
        }
    }

    /// Clear the thread a terminal event refers to and reset presence.
    pub async fn finish(&self, event: &FlowEvent) {
        if self
            .state
            .remove_flow_for(&event.session, &event.thread, &event.origin_message_id)
            .is_some()
        {
            debug!(session = %event.session, thread = %event.thread, "thread cleared");
        }
        self.presence(&event.session, &event.thread, Presence::Paused)
            .await;
    }

    // ── Helpers ──────────────────────────────────────────────────

    async fn say(&self, key: &SessionKey, thread: &str, text: &str) -> Result<(), FlowError> {
        self.outbound.send_text(key, thread, text).await?;
        Ok(())
    }

    async fn presence(&self, key: &SessionKey, thread: &str, presence: Presence) {
        if let Err(e) = self.outbound.update_presence(key, thread, presence).await {
            debug!(session = %key, thread, error = %e, "presence update failed");
        }
    }

    async fn emit(&self, kind: EventKind, event: FlowEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.bus.emit(kind, payload, SOURCE).await;
            }
            Err(e) => error!(%kind, error = %e, "failed to encode flow event"),
        }
    }
}

struct TerminalCleanup {
    engine: Arc<FlowEngine>,
}

#[async_trait]
impl EventHandler for TerminalCleanup {
    async fn handle(&self, event: &Event) -> anyhow::Result<Value> {
        let flow_event: FlowEvent = event.payload_as()?;
        self.engine.finish(&flow_event).await;
        Ok(Value::Null)
    }
}

#[async_trait]
impl ImageProcessor for FlowEngine {
    async fn process(&self, entry: &QueueEntry) -> Result<(), ProcessingError> {
        let settings = self.settings.cached(&entry.session);
        if !settings.ai_enabled {
            return self
                .start_capture(
                    &entry.session,
                    &entry.thread,
                    &entry.origin_message_id,
                    Some(entry.image.clone()),
                )
                .await
                .map_err(ProcessingError::Flow);
        }

        self.presence(&entry.session, &entry.thread, Presence::Composing)
            .await;
        let questions = settings.effective_questions();
        let fields = self
            .extractor
            .extract(&entry.image, &questions)
            .await
            .map_err(ProcessingError::Extraction)?;
        debug!(session = %entry.session, fields = fields.len(), "fields extracted");
        self.begin_confirmation(
            &entry.session,
            &entry.thread,
            &entry.origin_message_id,
            entry.image.clone(),
            fields,
        )
        .await
        .map_err(ProcessingError::Flow)
    }
}

/// `20240131-142501-<origin>.jpeg`, with the origin reduced to safe chars.
fn image_file_name(at: DateTime<Utc>, origin_message_id: &str, image: &ImagePayload) -> String {
    let extension = image
        .mime_type
        .split_once('/')
        .map(|(_, subtype)| subtype)
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin");
    let origin: String = origin_message_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(32)
        .collect();
    format!("{}-{origin}.{extension}", at.format("%Y%m%d-%H%M%S"))
}
