//! Session handshake states and reconnect backoff.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A pairing code the user must enter or scan, with its expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCode {
    /// Code or QR payload as issued by the platform.
    pub code: String,
    /// After this instant the code is useless and the session is torn down.
    pub expires_at: DateTime<Utc>,
}

impl PairingCode {
    /// Whether the code has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum ClosedReason {
    /// The user logged out or unlinked the device.
    LoggedOut,
    /// The platform rejected stored credentials.
    AuthInvalid,
    /// Reconnect attempts exceeded the configured bound.
    RetriesExhausted,
    /// The pairing code expired before the user linked.
    PairingExpired,
    /// The initial handshake failed or timed out.
    HandshakeFailed(String),
    /// No activity within the inactivity timeout.
    Inactive,
    /// A ready session has no usable credentials on disk.
    CredentialsMissing,
    /// Explicit teardown.
    Teardown,
    /// Engine shutdown. Leaves the authenticated flag set so the session is
    /// restored on the next start.
    Shutdown,
}

impl ClosedReason {
    /// Whether this end invalidates stored credentials.
    pub fn purges_credentials(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::AuthInvalid | Self::RetriesExhausted
        )
    }
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::AuthInvalid => f.write_str("credentials rejected"),
            Self::RetriesExhausted => f.write_str("reconnect attempts exhausted"),
            Self::PairingExpired => f.write_str("pairing code expired"),
            Self::HandshakeFailed(detail) => write!(f, "handshake failed: {detail}"),
            Self::Inactive => f.write_str("inactive"),
            Self::CredentialsMissing => f.write_str("credentials missing"),
            Self::Teardown => f.write_str("torn down"),
            Self::Shutdown => f.write_str("shutting down"),
        }
    }
}

/// Where a session is in its lifecycle.
///
/// ```text
/// Queued ──► Init ──► AwaitingPairing ──► Ready ──► Degraded ──► Reconnecting(n) ──► Ready
///   │          │            │               │                          │
///   └──────────┴────────────┴───────────────┴──────────► Closed ◄──────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum HandshakeState {
    /// Waiting for a capacity slot. No handshake budget is spent here.
    Queued,
    /// Connecting, no outcome yet.
    Init,
    /// Waiting for the user to enter a pairing code.
    AwaitingPairing {
        /// The code shown to the user.
        pairing: PairingCode,
    },
    /// Open and authenticated.
    Ready,
    /// Connection lost, reconnect pending.
    Degraded,
    /// Reconnect attempt `attempt` in progress.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Terminal.
    Closed {
        /// Why it ended.
        reason: ClosedReason,
    },
}

impl HandshakeState {
    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Init => "init",
            Self::AwaitingPairing { .. } => "awaiting_pairing",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Closed { .. } => "closed",
        }
    }

    /// Whether the session has ended.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Whether moving to `next` is a legal lifecycle step.
    pub fn allows(&self, next: &HandshakeState) -> bool {
        use HandshakeState as S;
        match (self, next) {
            (S::Closed { .. }, _) => false,
            (_, S::Closed { .. }) => true,
            (S::Queued, S::Init) => true,
            (S::Init, S::AwaitingPairing { .. } | S::Ready) => true,
            (S::AwaitingPairing { .. }, S::AwaitingPairing { .. } | S::Ready) => true,
            (S::Ready, S::Degraded) => true,
            (S::Degraded, S::Reconnecting { attempt }) => *attempt == 1,
            (S::Reconnecting { attempt: a }, S::Reconnecting { attempt: b }) => {
                a.checked_add(1) == Some(*b)
            }
            (S::Reconnecting { .. }, S::Ready) => true,
            _ => false,
        }
    }
}

/// Reconnect schedule for degraded sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before the session is torn down.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Budget for a single attempt to reach `Open`.
    pub attempt_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Percentage of the computed delay added at most as jitter.
const JITTER_PERCENT: u64 = 20;

impl ReconnectPolicy {
    /// Delay without jitter before 1-based `attempt`: `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before 1-based `attempt`, with up to 20% random jitter added.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let max_jitter = base_ms
            .saturating_mul(JITTER_PERCENT)
            .checked_div(100)
            .unwrap_or(0);
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        Duration::from_millis(base_ms.saturating_add(jitter))
    }
}
