//! Per-tenant conversation state, dedup markers, and processing flags.
//!
//! The [`StateStore`] is the single owner of everything the router and the
//! flow engine need to agree on. Each thread holds at most one
//! [`ThreadFlow`], so a guided capture and an AI confirmation can never be
//! active together. All access goes through a sync [`Mutex`] whose critical
//! sections are short and never cross an `.await`.

pub mod dedup;
pub mod settings;

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::error::ErrorClass;
use crate::service::{HealthStatus, Service};
use crate::types::{FieldMap, ImagePayload, Question, SessionKey, StorageDestination};

use self::dedup::{DedupLedger, Duplicate, Marker};

/// Errors from state-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A flow is already active on the thread.
    #[error("thread {thread} already has an active flow")]
    FlowActive {
        /// Thread id.
        thread: String,
    },

    /// Settings database failure.
    #[error("settings database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Settings could not be (de)serialized.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Classification for recovery and logs.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::FlowActive { .. } => ErrorClass::InternalInvariant,
            Self::Database(_) | Self::Serialization(_) => ErrorClass::ExternalDependency,
        }
    }
}

/// Guided Q&A capture in progress.
#[derive(Debug, Clone)]
pub struct ConversationState {
    /// Message that started the flow.
    pub origin_message_id: String,
    /// Index of the question awaiting an answer.
    pub step: usize,
    /// Ordered questions.
    pub questions: Vec<Question>,
    /// Answers collected so far.
    pub answers: FieldMap,
    /// Receipt image to upload when finalizing, if the flow started from one.
    pub image: Option<ImagePayload>,
    /// Last message consumed by this flow.
    pub last_message_id: Option<String>,
    /// Last time the user interacted.
    pub last_active: DateTime<Utc>,
}

/// Outcome of feeding an answer into a [`ConversationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// The message was already consumed.
    Duplicate,
    /// Stored; ask the next question.
    Next(Question),
    /// Stored the last answer; the flow must finalize.
    Complete,
    /// The step index points past the question list.
    Invalid,
}

impl ConversationState {
    /// Start a capture over `questions`.
    pub fn new(
        origin_message_id: impl Into<String>,
        questions: Vec<Question>,
        image: Option<ImagePayload>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            origin_message_id: origin_message_id.into(),
            step: 0,
            questions,
            answers: FieldMap::new(),
            image,
            last_message_id: None,
            last_active: now,
        }
    }

    /// Question awaiting an answer.
    pub fn current_question(&self) -> Option<&Question> {
        self.questions.get(self.step)
    }

    /// Store `answer` under the current step's field and advance one step.
    pub fn record_answer(
        &mut self,
        message_id: &str,
        answer: &str,
        now: DateTime<Utc>,
    ) -> AnswerOutcome {
        if self.last_message_id.as_deref() == Some(message_id) {
            return AnswerOutcome::Duplicate;
        }
        let Some(question) = self.questions.get(self.step) else {
            return AnswerOutcome::Invalid;
        };
        self.answers
            .insert(question.field.clone(), answer.trim().to_owned());
        self.step = self.step.saturating_add(1);
        self.last_message_id = Some(message_id.to_owned());
        self.last_active = now;
        match self.questions.get(self.step) {
            Some(next) => AnswerOutcome::Next(next.clone()),
            None => AnswerOutcome::Complete,
        }
    }
}

/// AI-extracted data awaiting the user's confirmation.
#[derive(Debug, Clone)]
pub struct AiConfirmationState {
    /// Message (the image) that started the flow.
    pub origin_message_id: String,
    /// Current field values, including user edits.
    pub fields: FieldMap,
    /// Declared questions, used as the edit schema.
    pub questions: Vec<Question>,
    /// Receipt image.
    pub image: ImagePayload,
    /// Where the record and image go.
    pub destination: StorageDestination,
    /// Whether the user edited the extraction.
    pub modified: bool,
    /// Last message consumed by this flow.
    pub last_message_id: Option<String>,
    /// Last time the user interacted.
    pub last_active: DateTime<Utc>,
}

impl AiConfirmationState {
    /// Merge edits into the fields. Returns the names of fields that changed.
    pub fn apply_edits(&mut self, edits: &FieldMap) -> Vec<String> {
        let mut changed = Vec::new();
        for (field, value) in edits {
            if self.fields.get(field) != Some(value) {
                self.fields.insert(field.clone(), value.clone());
                changed.push(field.clone());
            }
        }
        if !changed.is_empty() {
            self.modified = true;
        }
        changed
    }
}

/// The single flow a thread may hold.
#[derive(Debug, Clone)]
pub enum ThreadFlow {
    /// Guided capture.
    Collecting(ConversationState),
    /// Waiting for the user to confirm AI-extracted data.
    Confirming(AiConfirmationState),
    /// Upload/write in progress; further messages are ignored.
    Finalizing {
        /// Message that started the flow.
        origin_message_id: String,
        /// When finalizing began.
        since: DateTime<Utc>,
    },
}

/// Discriminant of [`ThreadFlow`], cheap to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    /// Guided capture.
    Collecting,
    /// AI confirmation.
    Confirming,
    /// Finalizing.
    Finalizing,
}

impl ThreadFlow {
    /// Which kind of flow this is.
    pub fn kind(&self) -> FlowKind {
        match self {
            Self::Collecting(_) => FlowKind::Collecting,
            Self::Confirming(_) => FlowKind::Confirming,
            Self::Finalizing { .. } => FlowKind::Finalizing,
        }
    }

    /// Message that started the flow.
    pub fn origin_message_id(&self) -> &str {
        match self {
            Self::Collecting(s) => &s.origin_message_id,
            Self::Confirming(s) => &s.origin_message_id,
            Self::Finalizing {
                origin_message_id, ..
            } => origin_message_id,
        }
    }
}

/// A flow removed by [`StateStore::take_expired`].
#[derive(Debug, Clone)]
pub struct ExpiredFlow {
    /// Session the flow belonged to.
    pub key: SessionKey,
    /// Thread id.
    pub thread: String,
    /// The flow as it was when it expired.
    pub flow: ThreadFlow,
}

#[derive(Debug)]
struct TenantState {
    flows: HashMap<String, ThreadFlow>,
    dedup: DedupLedger,
    processing: HashSet<String>,
}

impl TenantState {
    fn new(dedup_max_entries: usize) -> Self {
        Self {
            flows: HashMap::new(),
            dedup: DedupLedger::new(dedup_max_entries),
            processing: HashSet::new(),
        }
    }
}

/// Process-wide state registry, partitioned per session.
#[derive(Debug)]
pub struct StateStore {
    tenants: Mutex<HashMap<SessionKey, TenantState>>,
    dedup_max_entries: usize,
}

impl StateStore {
    /// Create an empty store. Dedup ledgers prune past `dedup_max_entries`.
    pub fn new(dedup_max_entries: usize) -> Self {
        Self {
            tenants: Mutex::new(HashMap::new()),
            dedup_max_entries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, TenantState>> {
        match self.tenants.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_tenant<R>(&self, key: &SessionKey, f: impl FnOnce(&mut TenantState) -> R) -> R {
        let mut tenants = self.lock();
        let tenant = tenants
            .entry(key.clone())
            .or_insert_with(|| TenantState::new(self.dedup_max_entries));
        f(tenant)
    }

    // ── Dedup ────────────────────────────────────────────────────

    /// Claim a message id for processing (check-then-mark, atomically).
    ///
    /// # Errors
    ///
    /// Returns [`Duplicate`] when the id was already seen.
    pub fn begin_message(&self, key: &SessionKey, message_id: &str) -> Result<(), Duplicate> {
        self.with_tenant(key, |t| t.dedup.begin(message_id))
    }

    /// Mark a processing message as handled.
    pub fn complete_message(&self, key: &SessionKey, message_id: &str) -> bool {
        self.with_tenant(key, |t| t.dedup.complete(message_id))
    }

    /// Mark a processing message as intentionally ignored.
    pub fn suppress_message(&self, key: &SessionKey, message_id: &str) -> bool {
        self.with_tenant(key, |t| t.dedup.suppress(message_id))
    }

    /// Current dedup marker for a message.
    pub fn marker(&self, key: &SessionKey, message_id: &str) -> Option<Marker> {
        self.lock()
            .get(key)
            .and_then(|t| t.dedup.marker(message_id))
    }

    // ── Flows ────────────────────────────────────────────────────

    /// Kind of the flow active on a thread, if any.
    pub fn flow_kind(&self, key: &SessionKey, thread: &str) -> Option<FlowKind> {
        self.lock()
            .get(key)
            .and_then(|t| t.flows.get(thread))
            .map(ThreadFlow::kind)
    }

    /// Clone of the flow active on a thread.
    pub fn flow(&self, key: &SessionKey, thread: &str) -> Option<ThreadFlow> {
        self.lock()
            .get(key)
            .and_then(|t| t.flows.get(thread))
            .cloned()
    }

    /// Install a flow on an idle thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FlowActive`] if the thread already has one.
    pub fn start_flow(
        &self,
        key: &SessionKey,
        thread: &str,
        flow: ThreadFlow,
    ) -> Result<(), StoreError> {
        self.with_tenant(key, |t| {
            if t.flows.contains_key(thread) {
                return Err(StoreError::FlowActive {
                    thread: thread.to_owned(),
                });
            }
            debug!(session = %key, thread, kind = ?flow.kind(), "flow started");
            t.flows.insert(thread.to_owned(), flow);
            Ok(())
        })
    }

    /// Mutate the flow on a thread in place. Returns `None` when idle.
    pub fn update_flow<R>(
        &self,
        key: &SessionKey,
        thread: &str,
        f: impl FnOnce(&mut ThreadFlow) -> R,
    ) -> Option<R> {
        let mut tenants = self.lock();
        tenants
            .get_mut(key)
            .and_then(|t| t.flows.get_mut(thread))
            .map(f)
    }

    /// Remove and return the flow on a thread.
    pub fn remove_flow(&self, key: &SessionKey, thread: &str) -> Option<ThreadFlow> {
        let removed = self
            .lock()
            .get_mut(key)
            .and_then(|t| t.flows.remove(thread));
        if removed.is_some() {
            debug!(session = %key, thread, "flow removed");
        }
        removed
    }

    /// Remove the flow on a thread only if it was started by
    /// `origin_message_id`, clearing the processing flag with it.
    pub fn remove_flow_for(
        &self,
        key: &SessionKey,
        thread: &str,
        origin_message_id: &str,
    ) -> Option<ThreadFlow> {
        let mut tenants = self.lock();
        let tenant = tenants.get_mut(key)?;
        let matches = tenant
            .flows
            .get(thread)
            .is_some_and(|f| f.origin_message_id() == origin_message_id);
        if !matches {
            return None;
        }
        tenant.processing.remove(thread);
        tenant.flows.remove(thread)
    }

    /// Number of active flows across all sessions.
    pub fn active_flows(&self) -> usize {
        self.lock().values().map(|t| t.flows.len()).sum()
    }

    /// Remove flows idle past their timeout and return them.
    ///
    /// Collecting flows expire after `collecting_ttl`, confirmations after
    /// `confirmation_ttl`. Finalizing flows are left alone.
    pub fn take_expired(
        &self,
        now: DateTime<Utc>,
        collecting_ttl: Duration,
        confirmation_ttl: Duration,
    ) -> Vec<ExpiredFlow> {
        let mut expired = Vec::new();
        let mut tenants = self.lock();
        for (key, tenant) in tenants.iter_mut() {
            let stale: Vec<String> = tenant
                .flows
                .iter()
                .filter(|(_, flow)| match flow {
                    ThreadFlow::Collecting(s) => now.signed_duration_since(s.last_active) > collecting_ttl,
                    ThreadFlow::Confirming(s) => {
                        now.signed_duration_since(s.last_active) > confirmation_ttl
                    }
                    ThreadFlow::Finalizing { .. } => false,
                })
                .map(|(thread, _)| thread.clone())
                .collect();
            for thread in stale {
                if let Some(flow) = tenant.flows.remove(&thread) {
                    expired.push(ExpiredFlow {
                        key: key.clone(),
                        thread,
                        flow,
                    });
                }
            }
        }
        expired
    }

    // ── Processing flags ─────────────────────────────────────────

    /// Flag a thread as having an image in processing. Returns `false` if
    /// it was already flagged.
    pub fn mark_processing(&self, key: &SessionKey, thread: &str) -> bool {
        self.with_tenant(key, |t| t.processing.insert(thread.to_owned()))
    }

    /// Clear a thread's processing flag.
    pub fn clear_processing(&self, key: &SessionKey, thread: &str) {
        if let Some(t) = self.lock().get_mut(key) {
            t.processing.remove(thread);
        }
    }

    /// Whether a thread has an image in processing.
    pub fn is_processing(&self, key: &SessionKey, thread: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|t| t.processing.contains(thread))
    }

    /// Drop a thread's flow and processing flag together.
    pub fn purge_thread(&self, key: &SessionKey, thread: &str) {
        if let Some(t) = self.lock().get_mut(key) {
            t.flows.remove(thread);
            t.processing.remove(thread);
        }
    }

    /// Drop a session's flows and processing flags when it closes.
    ///
    /// The dedup ledger survives, so a platform redelivery after the session
    /// is re-acquired is still recognised. Returns whether anything was
    /// dropped.
    pub fn release_session(&self, key: &SessionKey) -> bool {
        let mut tenants = self.lock();
        let Some(tenant) = tenants.get_mut(key) else {
            return false;
        };
        let had_work = !tenant.flows.is_empty() || !tenant.processing.is_empty();
        tenant.flows.clear();
        tenant.processing.clear();
        had_work
    }
}

#[async_trait]
impl Service for StateStore {
    fn name(&self) -> &'static str {
        "state_store"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy {
            details: format!("{} active flows", self.active_flows()),
        }
    }
}
