//! HTTP client for the Ollama API.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Default timeout for every backend call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a streamed chat, including reading the whole body.
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("inference backend unreachable: {0}")]
    Unavailable(#[source] reqwest::Error),

    #[error("inference backend returned HTTP {status}")]
    Status { status: u16 },

    #[error("could not decode backend stream: {0}")]
    Decode(String),

    #[error("inference backend reported an error: {0}")]
    Reported(String),
}

impl BackendError {
    /// `true` when the backend answered but the answer made no sense.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

/// One line of a streamed `/api/chat` response. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub content: String,
}

impl ChatChunk {
    /// The message content, if any and non-empty.
    pub fn content(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Serialize)]
struct KeepAliveRequest<'a> {
    model: &'a str,
    keep_alive: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
}

impl OllamaClient {
    /// Build a client for the backend at `base_url` (e.g.
    /// `http://127.0.0.1:11434`). A trailing slash is ignored.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        // Local backend: plain HTTP/1.1 with a generous idle pool.
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .http1_only()
            .build()
            .map_err(BackendError::Client)?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
            })
        }
    }

    /// Start a streamed chat. The caller reads the NDJSON body.
    pub async fn chat_stream(&self, request: &ChatRequest) -> Result<Response, BackendError> {
        self.chat_raw(request).await
    }

    /// Post any serialisable body to `/api/chat` with the chat deadline.
    pub async fn chat_raw<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<Response, BackendError> {
        let response = self
            .http
            .post(self.url("/api/chat"))
            .timeout(CHAT_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(BackendError::Unavailable)?;
        Self::check_status(response)
    }

    /// Non-streaming chat; the body is read to completion and returned.
    pub async fn chat_once(&self, request: &ChatRequest) -> Result<Value, BackendError> {
        let response = self
            .http
            .post(self.url("/api/chat"))
            .json(request)
            .send()
            .await
            .map_err(BackendError::Unavailable)?;
        let response = Self::check_status(response)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Ask the backend to keep `model` resident for `duration` (e.g. `"5m"`).
    pub async fn keep_alive(&self, model: &str, duration: &str) -> Result<(), BackendError> {
        debug!(model, duration, "sending keep-alive");
        let response = self
            .http
            .post(self.url("/api/generate"))
            .json(&KeepAliveRequest {
                model,
                keep_alive: duration,
            })
            .send()
            .await
            .map_err(BackendError::Unavailable)?;
        Self::check_status(response)?;
        Ok(())
    }
}
