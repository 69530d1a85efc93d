//! # inference-proxy
//!
//! Everything between a chat request and the local Ollama backend:
//!
//! - [`client`]: the HTTP client and the slice of the Ollama wire format we
//!   use.
//! - [`ndjson`]: splits the backend's newline-delimited JSON stream.
//! - [`stream`]: turns one chat request into a sequence of
//!   [`StreamEvent`]s, and relays raw NDJSON for the HTTP endpoint.
//! - [`lifecycle`]: model warmup, keep-alive pings and usage tracking.
//! - [`selection`]: prompt normalisation and length-based model tiers.
//! - [`metrics`]: time-to-first-token samples and percentiles.

pub mod client;
pub mod lifecycle;
pub mod metrics;
pub mod ndjson;
pub mod selection;
pub mod stream;

pub use client::{BackendError, OllamaClient};
pub use lifecycle::{ModelManager, ModelSnapshot};
pub use metrics::{TtftMetrics, TtftSummary};
pub use selection::{normalize_prompt, ModelChoice, ModelTier, ModelTiers};
pub use stream::{ChatJob, SinkClosed, StreamEvent, StreamSink, StreamingProxy};
