//! Chat streaming against the backend.
//!
//! [`StreamingProxy::stream_chat`] drives one data-channel chat: it resolves
//! the model, warms it, posts a streamed `/api/chat`, and turns each NDJSON
//! line into a [`StreamEvent`] for the caller's [`StreamSink`].
//! [`StreamingProxy::relay_http`] does the same for the HTTP endpoint but
//! hands the backend's lines through untouched.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BackendError, ChatChunk, ChatMessage, ChatRequest, OllamaClient};
use crate::lifecycle::{model_settings, ModelManager};
use crate::metrics::TtftMetrics;
use crate::ndjson::LineDecoder;
use crate::selection::{normalize_prompt, ModelChoice, ModelTiers, FALLBACK_MODEL};

/// Prompts shorter than this many characters get a smaller context window.
const SHORT_PROMPT_CHARS: usize = 50;

/// What the proxy reports back for one chat.
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(BackendError),
}

/// The receiving side went away; the stream stops quietly.
#[derive(Debug, Error)]
#[error("stream sink closed")]
pub struct SinkClosed;

/// Destination for [`StreamEvent`]s.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed>;
}

/// One chat request from a peer.
#[derive(Debug, Clone)]
pub struct ChatJob {
    pub model: ModelChoice,
    pub prompt: String,
}

enum Outcome {
    Finished,
    SinkGone,
}

/// Tracks the time from request to first non-empty content.
struct FirstToken {
    started: Instant,
    recorded: bool,
}

impl FirstToken {
    fn start() -> Self {
        Self {
            started: Instant::now(),
            recorded: false,
        }
    }

    fn observe(&mut self, metrics: &TtftMetrics, model: &str) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let ttft = self.started.elapsed();
        metrics.record(ttft);
        info!(model, ttft_ms = ttft.as_millis() as u64, "first token");
    }
}

pub struct StreamingProxy {
    client: OllamaClient,
    models: Arc<ModelManager>,
    metrics: Arc<TtftMetrics>,
    tiers: ModelTiers,
    default_model: Option<String>,
}

impl std::fmt::Debug for StreamingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProxy")
            .field("backend", &self.client.base_url())
            .field("default_model", &self.default_model)
            .finish_non_exhaustive()
    }
}

impl StreamingProxy {
    pub fn new(
        client: OllamaClient,
        models: Arc<ModelManager>,
        metrics: Arc<TtftMetrics>,
        tiers: ModelTiers,
        default_model: Option<String>,
    ) -> Self {
        Self {
            client,
            models,
            metrics,
            tiers,
            default_model,
        }
    }

    pub fn metrics(&self) -> &Arc<TtftMetrics> {
        &self.metrics
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn tiers(&self) -> &ModelTiers {
        &self.tiers
    }

    /// Model choice for a request naming `explicit` (or nothing).
    pub fn choose(&self, explicit: Option<&str>) -> ModelChoice {
        ModelChoice::from_request(explicit, self.default_model.as_deref())
    }

    /// Base sampling options, overlaid with the model's settings and with
    /// short-prompt tuning.
    pub fn chat_options(&self, model: &str, prompt: &str) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert("num_predict".into(), json!(512));
        options.insert("temperature".into(), json!(0.7));
        options.insert("top_k".into(), json!(40));
        options.insert("top_p".into(), json!(0.9));
        options.insert("repeat_penalty".into(), json!(1.1));
        options.insert("seed".into(), json!(42));
        options.extend(model_settings(model));

        if prompt.chars().count() < SHORT_PROMPT_CHARS {
            options.insert("num_ctx".into(), json!(512));
            options.insert("num_batch".into(), json!(256));
        }
        options
    }

    // -----------------------------------------------------------------------
    // Data-channel chat
    // -----------------------------------------------------------------------

    /// Run one chat to completion, reporting through `sink`.
    ///
    /// Ends with exactly one `Done` or one `Error`, unless `cancel` fires or
    /// the sink closes first, in which case nothing further is emitted.
    pub async fn stream_chat(
        &self,
        sink: &dyn StreamSink,
        job: ChatJob,
        cancel: CancellationToken,
    ) {
        let prompt = normalize_prompt(&job.prompt);
        let model = job.model.resolve(&self.tiers, &prompt);
        let request = ChatRequest {
            options: self.chat_options(&model, &prompt),
            model: model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            stream: true,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(model = %model, "chat cancelled");
                return;
            }
            result = self.run(sink, request) => result,
        };

        match result {
            Ok(Outcome::Finished) => {
                let _ = sink.emit(StreamEvent::Done).await;
            }
            Ok(Outcome::SinkGone) => debug!(model = %model, "sink closed mid-stream"),
            Err(err) => {
                warn!(model = %model, error = %err, "chat stream failed");
                let _ = sink.emit(StreamEvent::Error(err)).await;
            }
        }
    }

    async fn run(
        &self,
        sink: &dyn StreamSink,
        request: ChatRequest,
    ) -> Result<Outcome, BackendError> {
        self.models.ensure_warm(&request.model).await;
        self.models.touch(&request.model);

        let mut first = FirstToken::start();
        let response = self.client.chat_stream(&request).await?;
        let mut body = response.bytes_stream().boxed();
        let mut decoder = LineDecoder::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(BackendError::Unavailable)?;
            for line in decoder.push(&chunk)? {
                let outcome = self
                    .handle_line(sink, &line, &request.model, &mut first)
                    .await?;
                if let Some(outcome) = outcome {
                    return Ok(outcome);
                }
            }
        }
        if let Some(line) = decoder.finish() {
            let outcome = self
                .handle_line(sink, &line, &request.model, &mut first)
                .await?;
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        // Body ended without `done: true`.
        Ok(Outcome::Finished)
    }

    async fn handle_line(
        &self,
        sink: &dyn StreamSink,
        line: &[u8],
        model: &str,
        first: &mut FirstToken,
    ) -> Result<Option<Outcome>, BackendError> {
        let chunk: ChatChunk =
            serde_json::from_slice(line).map_err(|e| BackendError::Decode(e.to_string()))?;

        if let Some(message) = &chunk.error {
            return Err(BackendError::Reported(message.clone()));
        }
        if let Some(content) = chunk.content() {
            first.observe(&self.metrics, model);
            if sink.emit(StreamEvent::Delta(content.to_string())).await.is_err() {
                return Ok(Some(Outcome::SinkGone));
            }
        }
        Ok(chunk.done.then_some(Outcome::Finished))
    }

    // -----------------------------------------------------------------------
    // HTTP relay
    // -----------------------------------------------------------------------

    /// Fill in `model` and `options` when the caller left them out.
    fn complete_http_body(&self, body: &mut Map<String, Value>) -> String {
        let explicit = body
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let model = explicit.unwrap_or_else(|| {
            let first_content = body
                .get("messages")
                .and_then(Value::as_array)
                .and_then(|msgs| msgs.first())
                .and_then(|msg| msg.get("content"))
                .and_then(Value::as_str);
            match first_content {
                Some(content) => self.tiers.select(content.chars().count()).to_string(),
                None => self
                    .default_model
                    .clone()
                    .unwrap_or_else(|| FALLBACK_MODEL.to_string()),
            }
        });

        body.insert("model".into(), Value::String(model.clone()));
        if !body.contains_key("options") {
            body.insert("options".into(), Value::Object(model_settings(&model)));
        }
        model
    }

    /// Forward a raw `/api/chat` body and stream the backend's NDJSON back
    /// line by line. The first line carrying content records a TTFT sample.
    pub async fn relay_http(
        &self,
        mut body: Map<String, Value>,
    ) -> Result<BoxStream<'static, Result<Bytes, io::Error>>, BackendError> {
        let model = self.complete_http_body(&mut body);
        self.models.touch(&model);

        let first = FirstToken::start();
        let response = self.client.chat_raw(&body).await?;

        let state = Relay {
            body: response.bytes_stream().boxed(),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            first,
            metrics: Arc::clone(&self.metrics),
            model,
            finished: false,
        };
        Ok(stream::unfold(state, Relay::next_line).boxed())
    }
}

struct Relay {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: LineDecoder,
    pending: VecDeque<Bytes>,
    first: FirstToken,
    metrics: Arc<TtftMetrics>,
    model: String,
    finished: bool,
}

impl Relay {
    async fn next_line(mut self) -> Option<(Result<Bytes, io::Error>, Self)> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                let has_content = serde_json::from_slice::<ChatChunk>(&line)
                    .ok()
                    .is_some_and(|c| c.content().is_some());
                if has_content {
                    self.first.observe(&self.metrics, &self.model);
                }

                let mut out = BytesMut::with_capacity(line.len() + 1);
                out.extend_from_slice(&line);
                out.put_u8(b'\n');
                return Some((Ok(out.freeze()), self));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(chunk)) => match self.decoder.push(&chunk) {
                    Ok(lines) => self.pending.extend(lines),
                    Err(err) => {
                        self.finished = true;
                        return Some((Err(io::Error::other(err)), self));
                    }
                },
                Some(Err(err)) => {
                    self.finished = true;
                    return Some((Err(io::Error::other(err)), self));
                }
                None => {
                    self.finished = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}
