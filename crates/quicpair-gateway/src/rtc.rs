//! WebRTC transport engine.
//!
//! Each accepted offer gets its own peer connection with one ordered data
//! channel labelled `llm`. The answer is only returned once ICE gathering has
//! finished, so it carries every candidate. The peer connection lives as long
//! as the data channel: closing the channel closes the connection.

use std::sync::Arc;

use async_trait::async_trait;
use peer_session::{
    ChannelEvent, ChannelSendError, DataChannel, NegotiatedSession, NegotiationError,
    OutboundFrame, TransportEngine,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RtcConfig;

/// Label of the single data channel created per peer.
pub const DATA_CHANNEL_LABEL: &str = "llm";

/// Buffered channel events per peer before the callbacks apply back-pressure.
const EVENT_BUFFER: usize = 256;

pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("ice_servers", &self.ice_servers.len())
            .finish_non_exhaustive()
    }
}

impl WebRtcEngine {
    pub fn new(config: &RtcConfig) -> Result<Self, webrtc::Error> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers(config),
        })
    }
}

/// STUN servers first, then the TURN relay when one is configured.
fn ice_servers(config: &RtcConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !config.turn.urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn.urls.clone(),
            username: config.turn.username.clone(),
            credential: config.turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn engine_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Engine(err.to_string())
}

#[async_trait]
impl TransportEngine for WebRtcEngine {
    async fn accept_offer(&self, offer_sdp: &str) -> Result<NegotiatedSession, NegotiationError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| NegotiationError::InvalidOffer(e.to_string()))?;

        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await
                .map_err(engine_error)?,
        );

        match negotiate(&pc, offer).await {
            Ok((answer_sdp, dc, events)) => {
                let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel { dc, pc });
                Ok(NegotiatedSession {
                    answer_sdp,
                    channel,
                    events,
                })
            }
            Err(err) => {
                if let Err(close_err) = pc.close().await {
                    debug!(error = %close_err, "closing failed peer connection");
                }
                Err(err)
            }
        }
    }
}

async fn negotiate(
    pc: &Arc<RTCPeerConnection>,
    offer: RTCSessionDescription,
) -> Result<(String, Arc<RTCDataChannel>, mpsc::Receiver<ChannelEvent>), NegotiationError> {
    let (tx, events) = mpsc::channel(EVENT_BUFFER);

    let dc = pc
        .create_data_channel(
            DATA_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(engine_error)?;
    wire_events(pc, &dc, tx);

    pc.set_remote_description(offer)
        .await
        .map_err(|e| NegotiationError::InvalidOffer(e.to_string()))?;
    let answer = pc.create_answer(None).await.map_err(engine_error)?;

    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(engine_error)?;
    let _ = gathered.recv().await;

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::Engine("no local description after gathering".into()))?;

    info!(sdp_len = local.sdp.len(), "webrtc answer ready");
    Ok((local.sdp, dc, events))
}

/// Forward data-channel and connection callbacks into the peer's event
/// queue.
fn wire_events(
    pc: &Arc<RTCPeerConnection>,
    dc: &Arc<RTCDataChannel>,
    tx: mpsc::Sender<ChannelEvent>,
) {
    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Open).await;
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Message(msg.data)).await;
        })
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Closed).await;
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(?state, "peer connection state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = tx.send(ChannelEvent::Closed).await;
            }
        })
    }));
}

/// A negotiated data channel. Owns its peer connection.
struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send(&self, frame: OutboundFrame) -> Result<(), ChannelSendError> {
        let result = match frame {
            OutboundFrame::Text(text) => self.dc.send_text(text).await,
            OutboundFrame::Binary(bytes) => self.dc.send(&bytes).await,
        };
        result
            .map(|_| ())
            .map_err(|e| ChannelSendError(e.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(error = %err, "data channel close");
        }
        if let Err(err) = self.pc.close().await {
            warn!(error = %err, "peer connection close failed");
        }
    }
}
