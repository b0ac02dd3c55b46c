//! Domain types shared by the connection, routing, flow, and queue layers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Extracted or collected expense fields, keyed by field name.
pub type FieldMap = BTreeMap<String, String>;

/// Identifies one live session: a tenant's linked platform identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// Tenant (account) that owns the identity.
    pub tenant: String,
    /// Platform identity (phone number or account id).
    pub identity: String,
}

impl SessionKey {
    /// Build a key from its parts.
    pub fn new(tenant: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.identity)
    }
}

/// An image attached to an inbound message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    /// MIME type reported by the platform (e.g. `image/jpeg`).
    pub mime_type: String,
    /// Raw image bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Optional caption sent with the image.
    #[serde(default)]
    pub caption: Option<String>,
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .field("caption", &self.caption)
            .finish()
    }
}

impl ImagePayload {
    /// Whether the MIME type names an image.
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Content of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
    /// Image (photo or image document).
    Image {
        /// The image.
        image: ImagePayload,
    },
    /// Stickers, voice notes, reactions, and anything else we ignore.
    Other,
}

/// A message delivered by the platform on a ready session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform-assigned message id, unique per session.
    pub id: String,
    /// Chat/channel the message belongs to.
    pub thread: String,
    /// Display name of the chat, when the platform reports one.
    #[serde(default)]
    pub thread_name: Option<String>,
    /// Sender identifier.
    pub sender: String,
    /// Whether the session itself sent this message.
    #[serde(default)]
    pub from_me: bool,
    /// Message content.
    pub body: MessageBody,
    /// Platform timestamp.
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Trimmed text content, if this is a text message.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { text } => Some(text.trim()),
            _ => None,
        }
    }
}

/// An inbound message together with the session it arrived on.
///
/// This is the payload of [`EventKind::MessageReceived`](crate::events::EventKind::MessageReceived).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Receiving session.
    pub session: SessionKey,
    /// The message.
    pub message: InboundMessage,
}

/// A question asked during guided capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Field name the answer is stored under.
    pub field: String,
    /// Prompt shown to the user.
    pub prompt: String,
}

impl Question {
    /// Build a question.
    pub fn new(field: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            prompt: prompt.into(),
        }
    }
}

/// Default questions used when a tenant has not configured its own list.
pub fn default_questions() -> Vec<Question> {
    vec![
        Question::new("merchant", "Where was this expense? (shop or merchant name)"),
        Question::new("amount", "How much was it?"),
        Question::new("date", "What was the date? (YYYY-MM-DD)"),
    ]
}

/// Where completed records and images are stored for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDestination {
    /// Spreadsheet (or table) id receiving records.
    #[serde(default)]
    pub sheet_id: Option<String>,
    /// Folder id receiving receipt images.
    #[serde(default)]
    pub folder_id: Option<String>,
}

/// Chat presence shown to the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Typing indicator on.
    Composing,
    /// Typing indicator off.
    Paused,
    /// Online.
    Available,
}

/// Convert a std duration for timestamp arithmetic, saturating at a year.
pub fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
