//! JSON-over-HTTP clients for the extraction and storage services.
//!
//! Both services answer with the same envelope as the messaging bridge:
//! `{ "success": bool, "data": ..., "error": "..." }`.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CollaboratorError, ExpenseRecord, ExpenseStorage, Extractor};
use crate::types::{FieldMap, ImagePayload, Question, StorageDestination};

/// HTTP connect timeout.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Maximum response body kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct FieldsData {
    fields: FieldMap,
}

#[derive(Deserialize)]
struct UploadData {
    url: String,
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    mime_type: &'a str,
    image_base64: String,
    questions: &'a [Question],
}

#[derive(Serialize)]
struct EditRequest<'a> {
    text: &'a str,
    questions: &'a [Question],
    current: &'a FieldMap,
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    mime_type: &'a str,
    image_base64: String,
    folder_id: Option<&'a str>,
    file_name: &'a str,
}

/// Shared request plumbing.
#[derive(Clone)]
struct JsonService {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl std::fmt::Debug for JsonService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonService")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "__REDACTED__"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl JsonService {
    fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            timeout_secs,
        }
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        let envelope: Envelope<T> = self.send(path, body).await?;
        match (envelope.success, envelope.data) {
            (true, Some(data)) => Ok(data),
            (_, _) => Err(CollaboratorError::InvalidResponse(
                envelope
                    .error
                    .unwrap_or_else(|| "response carried no data".to_owned()),
            )),
        }
    }

    /// POST where only the success flag matters.
    async fn post_ack<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), CollaboratorError> {
        let envelope: Envelope<serde_json::Value> = self.send(path, body).await?;
        if envelope.success {
            Ok(())
        } else {
            Err(CollaboratorError::InvalidResponse(
                envelope
                    .error
                    .unwrap_or_else(|| "service reported failure".to_owned()),
            ))
        }
    }

    async fn send<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Envelope<T>, CollaboratorError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Timeout {
                    seconds: self.timeout_secs,
                }
            } else {
                CollaboratorError::Http(e)
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Rejected(truncate(&body)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        Ok(resp.json().await?)
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}

/// Extraction service client.
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    service: JsonService,
}

impl HttpExtractor {
    /// Client for the service at `base_url`.
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            service: JsonService::new(base_url, api_key, timeout_secs),
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        image: &ImagePayload,
        questions: &[Question],
    ) -> Result<FieldMap, CollaboratorError> {
        let request = ExtractRequest {
            mime_type: &image.mime_type,
            image_base64: STANDARD.encode(&image.data),
            questions,
        };
        let data: FieldsData = self.service.post("/extract", &request).await?;
        debug!(fields = data.fields.len(), "receipt extracted");
        Ok(data.fields)
    }

    async fn apply_edits(
        &self,
        text: &str,
        questions: &[Question],
        current: &FieldMap,
    ) -> Result<FieldMap, CollaboratorError> {
        let request = EditRequest {
            text,
            questions,
            current,
        };
        let data: FieldsData = self.service.post("/edits", &request).await?;
        Ok(data.fields)
    }
}

/// Storage service client.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    service: JsonService,
}

impl HttpStorage {
    /// Client for the service at `base_url`.
    pub fn new(base_url: String, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            service: JsonService::new(base_url, api_key, timeout_secs),
        }
    }
}

#[async_trait]
impl ExpenseStorage for HttpStorage {
    async fn write_record(&self, record: &ExpenseRecord) -> Result<(), CollaboratorError> {
        self.service.post_ack("/records", record).await?;
        debug!(session = %record.session, thread = %record.thread, "record written");
        Ok(())
    }

    async fn upload_image(
        &self,
        image: &ImagePayload,
        destination: &StorageDestination,
        file_name: &str,
    ) -> Result<String, CollaboratorError> {
        let request = UploadRequest {
            mime_type: &image.mime_type,
            image_base64: STANDARD.encode(&image.data),
            folder_id: destination.folder_id.as_deref(),
            file_name,
        };
        let data: UploadData = self.service.post("/images", &request).await?;
        Ok(data.url)
    }
}
