//! [`Transport`] backed by the messaging bridge sidecar.
//!
//! The sidecar hosts one platform socket per session and exposes it over
//! HTTP. Each session lives under `/sessions/{tenant}/{identity}/` with
//! `connect`, `events/poll` (long poll), `send`, `presence`, `logout`, and
//! `close` endpoints. Responses use the `{success, data, error}` envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::transport::{
    CloseReason, Transport, TransportConnection, TransportError, TransportFault, TransportHandle,
    TransportSignal,
};
use crate::credentials::AuthMaterial;
use crate::types::{InboundMessage, Presence, SessionKey};

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Timeout for ordinary requests.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Long-poll timeout. The sidecar answers with an empty list before this.
const POLL_TIMEOUT_SECS: u64 = 60;

/// First delay after a failed poll.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum delay between failed polls.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Consecutive poll failures before the stream is reported lost.
const MAX_POLL_FAILURES: u32 = 5;

/// Signals buffered between the poller and the session task.
const SIGNAL_BUFFER: usize = 64;

/// Maximum response body kept in error messages.
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[serde(default)]
    success: bool,
    #[allow(dead_code)]
    data: Option<T>,
    error: Option<String>,
}

/// An event as delivered by the sidecar's poll endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        code: String,
    },
    Open,
    Close {
        #[serde(default)]
        logged_out: bool,
        reason: Option<String>,
    },
    Error {
        message: String,
        #[serde(default)]
        auth: bool,
    },
    Message {
        message: InboundMessage,
    },
    Creds {
        material: serde_json::Value,
    },
}

impl From<BridgeEvent> for TransportSignal {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { code } => Self::PairingCode(code),
            BridgeEvent::Open => Self::Open,
            BridgeEvent::Close {
                logged_out: true, ..
            } => Self::Closed(CloseReason::LoggedOut),
            BridgeEvent::Close { reason: None, .. } => Self::Closed(CloseReason::ConnectionLost),
            BridgeEvent::Close {
                reason: Some(reason),
                ..
            } => Self::Closed(CloseReason::Other(reason)),
            BridgeEvent::Error {
                message,
                auth: true,
            } => Self::Error(TransportFault::AuthInvalid(message)),
            BridgeEvent::Error { message, .. } => Self::Error(TransportFault::Transport(message)),
            BridgeEvent::Message { message } => Self::Message(message),
            BridgeEvent::Creds { material } => Self::CredentialsUpdated(AuthMaterial(material)),
        }
    }
}

#[derive(Clone)]
struct BridgeClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl BridgeClient {
    fn session_url(&self, key: &SessionKey, tail: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TransportError::Unavailable("bridge URL cannot hold a path".to_owned()))?;
            segments
                .pop_if_empty()
                .push("sessions")
                .push(&key.tenant)
                .push(&key.identity)
                .extend(tail);
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post(
        &self,
        key: &SessionKey,
        tail: &[&str],
        body: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let url = self.session_url(key, tail)?;
        let resp = self.authorized(self.http.post(url)).json(body).send().await?;
        check_status(resp).await
    }
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

/// Map a bridge response onto a transport error.
async fn check_status(resp: reqwest::Response) -> Result<(), TransportError> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let detail: String = serde_json::from_str::<BridgeResponse<serde_json::Value>>(&body)
        .ok()
        .and_then(|r| if r.success { None } else { r.error })
        .unwrap_or_else(|| body.chars().take(ERROR_BODY_LIMIT).collect());

    if status.is_success() {
        return match serde_json::from_str::<BridgeResponse<serde_json::Value>>(&body) {
            Ok(r) if !r.success => Err(TransportError::Rejected(detail)),
            _ => Ok(()),
        };
    }
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::AuthInvalid(detail),
        StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::GONE => {
            TransportError::NotConnected
        }
        s if s.is_client_error() => TransportError::Rejected(detail),
        s => TransportError::Unavailable(format!("{s}: {detail}")),
    })
}

/// Connects sessions through the bridge sidecar.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    client: BridgeClient,
    poll_http: reqwest::Client,
}

impl BridgeTransport {
    /// Transport for the sidecar at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not a valid URL.
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Unavailable(format!("invalid bridge URL: {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let poll_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build poll client with timeouts, using default");
                reqwest::Client::default()
            });
        Ok(Self {
            client: BridgeClient {
                http,
                base_url,
                api_key,
            },
            poll_http,
        })
    }

    /// Whether the sidecar answers its status endpoint.
    pub async fn health_check(&self) -> bool {
        let mut url = self.client.base_url.clone();
        url.set_path("/status");
        match self.client.authorized(self.client.http.get(url)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(
        &self,
        key: &SessionKey,
        credentials: Option<AuthMaterial>,
    ) -> Result<TransportConnection, TransportError> {
        let body = json!({ "credentials": credentials.map(|c| c.0) });
        self.client.post(key, &["connect"], &body).await?;
        debug!(session = %key, "bridge session connected");

        let poll_url = self.client.session_url(key, &["events", "poll"])?;
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let poller = tokio::spawn(poll_events(
            self.poll_http.clone(),
            self.client.clone(),
            poll_url,
            key.clone(),
            tx,
        ));

        let handle = BridgeSession {
            client: self.client.clone(),
            key: key.clone(),
            poller: poller.abort_handle(),
            closed: AtomicBool::new(false),
        };
        Ok(TransportConnection {
            handle: Arc::new(handle),
            signals: rx,
        })
    }
}

/// One open bridge session.
#[derive(Debug)]
struct BridgeSession {
    client: BridgeClient,
    key: SessionKey,
    poller: AbortHandle,
    closed: AtomicBool,
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl TransportHandle for BridgeSession {
    async fn send_text(&self, thread: &str, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.client
            .post(&self.key, &["send"], &json!({ "jid": thread, "text": text }))
            .await?;
        debug!(session = %self.key, thread, "message sent");
        Ok(())
    }

    /// Presence is cosmetic: failures are logged and swallowed.
    async fn send_presence(&self, thread: &str, presence: Presence) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let body = json!({ "jid": thread, "presence": presence });
        if let Err(e) = self.client.post(&self.key, &["presence"], &body).await {
            debug!(session = %self.key, error = %e, "presence update failed");
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.client
            .post(&self.key, &["logout"], &json!({}))
            .await?;
        info!(session = %self.key, "logged out on the platform");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.poller.abort();
        if let Err(e) = self.client.post(&self.key, &["close"], &json!({})).await {
            debug!(session = %self.key, error = %e, "bridge close failed");
        }
    }
}

/// Long-poll the sidecar and forward events as signals.
///
/// Ends when the receiver is dropped, when the sidecar reports the session
/// gone or unauthorized, or after too many consecutive failures.
async fn poll_events(
    http: reqwest::Client,
    client: BridgeClient,
    poll_url: Url,
    key: SessionKey,
    tx: mpsc::Sender<TransportSignal>,
) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut failures: u32 = 0;

    loop {
        let request = client.authorized(http.get(poll_url.clone()));
        let failure = match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<Vec<BridgeEvent>>().await {
                    Ok(events) => {
                        failures = 0;
                        backoff_ms = INITIAL_BACKOFF_MS;
                        for event in events {
                            debug!(session = %key, ?event, "bridge event");
                            if tx.send(event.into()).await.is_err() {
                                // Receiver dropped: the session is gone.
                                return;
                            }
                        }
                        continue;
                    }
                    Err(e) => format!("undecodable events: {e}"),
                }
            }
            Ok(resp) => match resp.status() {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    let fault = TransportFault::AuthInvalid("bridge refused event poll".to_owned());
                    let _ = tx.send(TransportSignal::Error(fault)).await;
                    return;
                }
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    let _ = tx
                        .send(TransportSignal::Closed(CloseReason::ConnectionLost))
                        .await;
                    return;
                }
                status => format!("event poll returned {status}"),
            },
            // Normal: the long poll expired with nothing to report.
            Err(e) if e.is_timeout() => continue,
            Err(e) => e.to_string(),
        };

        failures = failures.saturating_add(1);
        if failures >= MAX_POLL_FAILURES {
            warn!(session = %key, failures, error = %failure, "event stream lost");
            let _ = tx
                .send(TransportSignal::Error(TransportFault::Transport(failure)))
                .await;
            return;
        }
        warn!(session = %key, backoff_ms, error = %failure, "event poll failed, retrying");
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
    }
}
