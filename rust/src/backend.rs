// Backend seam: the engine only ever talks to `dyn ChatBackend`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::core::config::AppConfig;
use crate::wire::{
    SendMessageRequest, UploadFile, UploadedResource, WireConversation, WireMessage,
};

const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("network is disabled")]
    Offline,
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(_) | BackendError::Timeout(_) | BackendError::Offline => true,
            BackendError::Status { status, .. } => *status >= 500 || *status == 429,
            BackendError::InvalidBaseUrl { .. } | BackendError::Decode(_) | BackendError::Io(_) => {
                false
            }
        }
    }
}

/// Request/response primitive the engine is built on. Implementations must be cheap to
/// share across tasks.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    async fn list_conversations(&self, user_id: &str)
        -> Result<Vec<WireConversation>, BackendError>;

    /// Full message set for a conversation.
    async fn list_messages(&self, conversation_id: &str)
        -> Result<Vec<WireMessage>, BackendError>;

    async fn send_message(&self, request: SendMessageRequest) -> Result<WireMessage, BackendError>;

    async fn upload(&self, file: UploadFile) -> Result<UploadedResource, BackendError>;
}

/// Backend used when `disable_network` is set or no base URL is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineBackend;

#[async_trait]
impl ChatBackend for OfflineBackend {
    async fn list_conversations(&self, _: &str) -> Result<Vec<WireConversation>, BackendError> {
        Err(BackendError::Offline)
    }

    async fn list_messages(&self, _: &str) -> Result<Vec<WireMessage>, BackendError> {
        Err(BackendError::Offline)
    }

    async fn send_message(&self, _: SendMessageRequest) -> Result<WireMessage, BackendError> {
        Err(BackendError::Offline)
    }

    async fn upload(&self, _: UploadFile) -> Result<UploadedResource, BackendError> {
        Err(BackendError::Offline)
    }
}

/// HTTP backend when the network is enabled in `config`, otherwise `OfflineBackend`.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn ChatBackend>, BackendError> {
    match config.api_base_url.as_deref() {
        Some(base_url) if config.network_enabled() => {
            let backend = HttpBackend::new(base_url, config.request_timeout())?;
            tracing::info!(base_url = %backend.base_url(), "backend: http");
            Ok(Arc::new(backend))
        }
        _ => {
            tracing::info!("backend: offline");
            Ok(Arc::new(OfflineBackend))
        }
    }
}

/// Run `fut` under `limit`. An elapsed deadline surfaces as `BackendError::Timeout`.
pub(crate) async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(limit)),
    }
}

/// JSON-over-HTTP backend.
///
/// Routes, relative to the base URL:
/// - `GET users/{user}/conversations`
/// - `GET conversations/{id}/messages`
/// - `POST conversations/{id}/messages`
/// - `POST uploads` (multipart, part `file`)
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base: Url,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let invalid = |reason: String| BackendError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason,
        };
        let base = Url::parse(base_url.trim()).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("expected an http(s) url".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { base, client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_BODY_MAX_CHARS)
                .collect(),
        });
    }
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<WireConversation>, BackendError> {
        let url = self.endpoint(&["users", user_id, "conversations"]);
        tracing::debug!(%url, "list_conversations");
        let resp = self.client.get(url).send().await?;
        read_json(resp).await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<WireMessage>, BackendError> {
        let url = self.endpoint(&["conversations", conversation_id, "messages"]);
        tracing::debug!(%url, "list_messages");
        let resp = self.client.get(url).send().await?;
        read_json(resp).await
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<WireMessage, BackendError> {
        let url = self.endpoint(&["conversations", &request.conversation_id, "messages"]);
        tracing::debug!(%url, client_ref = %request.client_ref, "send_message");
        let resp = self.client.post(url).json(&request).send().await?;
        read_json(resp).await
    }

    async fn upload(&self, file: UploadFile) -> Result<UploadedResource, BackendError> {
        let url = self.endpoint(&["uploads"]);
        tracing::debug!(%url, name = %file.name, bytes = file.bytes.len(), "upload");
        let part = reqwest::multipart::Part::bytes(file.bytes)
            .file_name(file.name)
            .mime_str(&file.mime_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self.client.post(url).multipart(form).send().await?;
        read_json(resp).await
    }
}
