//! Failure taxonomy shared across the engine.
//!
//! Module errors are `thiserror` enums that each map onto one
//! [`ErrorClass`]. The class decides the recovery path: retry, purge
//! credentials, tell the user, or reset state.

use std::fmt;

/// Coarse classification of every failure the engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network or platform hiccup. Retryable.
    TransientTransport,
    /// Credentials rejected by the platform. Terminal, purge credentials.
    AuthInvalid,
    /// Input from the user that cannot be processed. Tell them, no retry.
    MalformedInput,
    /// AI, storage, or broker failed. Notify, clean up, keep going.
    ExternalDependency,
    /// The engine's own bookkeeping is inconsistent. Reset and notify.
    InternalInvariant,
}

impl ErrorClass {
    /// Whether the operation may be retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientTransport)
    }

    /// Stable label for structured logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientTransport => "transient_transport",
            Self::AuthInvalid => "auth_invalid",
            Self::MalformedInput => "malformed_input",
            Self::ExternalDependency => "external_dependency",
            Self::InternalInvariant => "internal_invariant",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing category for a failed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureNotice {
    /// The file is not an image we can read.
    Format,
    /// The file exceeds the size limit.
    Size {
        /// Configured limit in bytes.
        limit_bytes: usize,
    },
    /// Processing took too long.
    Timeout,
    /// Anything else.
    Generic,
}

impl FailureNotice {
    /// Human-readable message sent to the chat.
    pub fn message(self) -> String {
        match self {
            Self::Format => {
                "Sorry, I couldn't read that file. Please send a photo of the receipt (JPEG or PNG)."
                    .to_owned()
            }
            Self::Size { limit_bytes } => format!(
                "That image is too large. Please send one smaller than {} MB.",
                limit_bytes.checked_div(1024 * 1024).unwrap_or(0)
            ),
            Self::Timeout => {
                "Processing the receipt took too long. Please try sending it again.".to_owned()
            }
            Self::Generic => {
                "Something went wrong while processing the receipt. Please try again.".to_owned()
            }
        }
    }
}

/// Message sent when the engine had to reset a conversation.
pub const RESTART_NOTICE: &str =
    "Something went wrong on my side and this expense was reset. Please start again.";
