//! External collaborators: AI extraction and record/image storage.
//!
//! The engine only depends on the [`Extractor`] and [`ExpenseStorage`]
//! traits. [`http`] provides implementations that talk JSON over HTTP to
//! companion services.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::types::{FieldMap, ImagePayload, Question, SessionKey, StorageDestination};

/// Errors from collaborator calls. Never partial results.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// HTTP transport failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The service rejected the input (bad image, unparseable edit).
    #[error("rejected input: {0}")]
    Rejected(String),

    /// The call did not finish in time.
    #[error("timed out after {seconds}s")]
    Timeout {
        /// Budget in seconds.
        seconds: u64,
    },
}

impl CollaboratorError {
    /// Classification used for recovery and user notices.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Rejected(_) => ErrorClass::MalformedInput,
            _ => ErrorClass::ExternalDependency,
        }
    }
}

/// A completed expense ready to be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpenseRecord {
    /// Session that captured it.
    pub session: SessionKey,
    /// Thread it was captured in.
    pub thread: String,
    /// Field values.
    pub fields: FieldMap,
    /// Declared schema, in column order.
    pub questions: Vec<Question>,
    /// Destination ids.
    pub destination: StorageDestination,
    /// The tenant's message template rendered with `fields`.
    pub summary: String,
    /// Link to the uploaded receipt image, if the upload succeeded.
    pub image_url: Option<String>,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
}

/// AI extraction collaborator.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract expense fields from a receipt image.
    async fn extract(
        &self,
        image: &ImagePayload,
        questions: &[Question],
    ) -> Result<FieldMap, CollaboratorError>;

    /// Apply free-text edits to `current`, returning the full edited map.
    async fn apply_edits(
        &self,
        text: &str,
        questions: &[Question],
        current: &FieldMap,
    ) -> Result<FieldMap, CollaboratorError>;
}

/// Record and image storage collaborator.
///
/// The two operations succeed or fail independently.
#[async_trait]
pub trait ExpenseStorage: Send + Sync {
    /// Append a record to the destination sheet.
    async fn write_record(&self, record: &ExpenseRecord) -> Result<(), CollaboratorError>;

    /// Upload a receipt image, returning a link to it.
    async fn upload_image(
        &self,
        image: &ImagePayload,
        destination: &StorageDestination,
        file_name: &str,
    ) -> Result<String, CollaboratorError>;
}
