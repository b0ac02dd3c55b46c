//! Seam between the connection manager and the messaging platform.
//!
//! A [`Transport`] opens a connection for one session and returns a
//! [`TransportHandle`] for outbound calls plus a stream of
//! [`TransportSignal`]s delivered in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::credentials::AuthMaterial;
use crate::error::ErrorClass;
use crate::types::{InboundMessage, Presence, SessionKey};

/// Why the platform closed a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The user unlinked the device or logged out.
    LoggedOut,
    /// Network drop, platform restart, stream error.
    ConnectionLost,
    /// Anything else the platform reports.
    Other(String),
}

/// A fault reported on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Recoverable transport problem.
    Transport(String),
    /// The platform rejected our credentials.
    AuthInvalid(String),
}

impl TransportFault {
    /// Classification driving recovery.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(_) => ErrorClass::TransientTransport,
            Self::AuthInvalid(_) => ErrorClass::AuthInvalid,
        }
    }
}

/// Everything the platform can tell us about a session.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    /// A pairing code to show the user (QR payload or link code).
    PairingCode(String),
    /// The connection is open and authenticated.
    Open,
    /// The connection closed.
    Closed(CloseReason),
    /// A fault occurred.
    Error(TransportFault),
    /// An inbound message.
    Message(InboundMessage),
    /// The platform rotated auth material; persist it.
    CredentialsUpdated(AuthMaterial),
}

/// Errors from transport calls.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request to the bridge failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The bridge is not reachable or answered unexpectedly.
    #[error("bridge unavailable: {0}")]
    Unavailable(String),

    /// Credentials were rejected.
    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    /// No open connection for this session.
    #[error("not connected")]
    NotConnected,

    /// The platform refused the request (bad recipient, rate limit).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Classification driving recovery.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthInvalid(_) => ErrorClass::AuthInvalid,
            Self::Rejected(_) => ErrorClass::MalformedInput,
            Self::Http(_) | Self::Unavailable(_) | Self::NotConnected => {
                ErrorClass::TransientTransport
            }
        }
    }
}

/// Outbound side of an open connection.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send a text message to a thread.
    async fn send_text(&self, thread: &str, text: &str) -> Result<(), TransportError>;

    /// Update chat presence for a thread.
    async fn send_presence(&self, thread: &str, presence: Presence) -> Result<(), TransportError>;

    /// Log the identity out on the platform.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the connection and stop signal delivery. Idempotent.
    async fn close(&self);
}

/// An open connection.
pub struct TransportConnection {
    /// Outbound handle.
    pub handle: Arc<dyn TransportHandle>,
    /// Signal stream, in arrival order.
    pub signals: mpsc::Receiver<TransportSignal>,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection").finish_non_exhaustive()
    }
}

/// Factory for platform connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for `key`, resuming with `credentials` when given.
    async fn connect(
        &self,
        key: &SessionKey,
        credentials: Option<AuthMaterial>,
    ) -> Result<TransportConnection, TransportError>;
}
