//! The boundary between peer sessions and whatever carries their bytes.
//!
//! A [`TransportEngine`] turns a remote offer into a [`NegotiatedSession`]:
//! the local answer plus an ordered, reliable, message-oriented
//! [`DataChannel`] and a stream of [`ChannelEvent`]s for it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Something that happened on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
}

/// A frame to write to the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text, used before the session is sealed.
    Text(String),
    /// A sealed frame.
    Binary(Bytes),
}

#[derive(Debug, Error)]
#[error("data channel send failed: {0}")]
pub struct ChannelSendError(pub String);

/// Sending half of a data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, frame: OutboundFrame) -> Result<(), ChannelSendError>;

    /// Close the channel. Closing twice is harmless.
    async fn close(&self);
}

/// Output of a successful negotiation.
pub struct NegotiatedSession {
    pub answer_sdp: String,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for NegotiatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedSession")
            .field("answer_sdp_len", &self.answer_sdp.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("transport negotiation failed: {0}")]
    Engine(String),
}

/// Accepts remote offers. Negotiation is never retried.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn accept_offer(&self, offer_sdp: &str) -> Result<NegotiatedSession, NegotiationError>;
}
