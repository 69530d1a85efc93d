//! One task per peer: the handshake state machine and op dispatch.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use inference_proxy::{ChatJob, StreamingProxy};
use secure_channel::SecureChannelManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::protocol::{decode_client, ClientMessage, ErrorKind, ServerMessage};
use crate::registry::{new_peer_id, PeerRegistry};
use crate::transport::{ChannelEvent, DataChannel};

/// Where a peer is in the secure-session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureState {
    Init,
    Handshaking,
    Secure,
    Closed,
}

/// Shared services every peer task needs.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub secure: Arc<SecureChannelManager>,
    pub proxy: Arc<StreamingProxy>,
    pub registry: Arc<PeerRegistry>,
    /// Cancelled on gateway shutdown. Each peer runs on a child token.
    pub shutdown: CancellationToken,
}

/// Register a new peer and spawn the task that drives it.
///
/// Returns the peer ID together with the task handle. The task ends when the
/// channel closes, the event stream ends, or the gateway shuts down; in
/// every case the peer's secure session and registry entry are removed.
pub fn spawn_peer(
    ctx: Arc<SessionContext>,
    channel: Arc<dyn DataChannel>,
    events: mpsc::Receiver<ChannelEvent>,
) -> (String, JoinHandle<()>) {
    let cancel = ctx.shutdown.child_token();
    let peer_id = loop {
        let candidate = new_peer_id();
        match ctx.registry.register(&candidate, cancel.clone()) {
            Ok(()) => break candidate,
            Err(err) => warn!(%err, "peer id collision, drawing again"),
        }
    };

    let (outbox, _writer) = Outbox::start(
        peer_id.clone(),
        Arc::clone(&channel),
        Arc::clone(&ctx.secure),
    );
    info!(peer_id = %peer_id, "peer attached");

    let session = PeerSession {
        peer_id: peer_id.clone(),
        state: SecureState::Init,
        ctx,
        channel,
        outbox,
        cancel,
        chat: None,
    };
    let handle = tokio::spawn(session.run(events));
    (peer_id, handle)
}

struct PeerSession {
    peer_id: String,
    state: SecureState,
    ctx: Arc<SessionContext>,
    channel: Arc<dyn DataChannel>,
    outbox: Outbox,
    cancel: CancellationToken,
    /// The chat currently streaming, if any. Frames carry no request id, so
    /// a peer has at most one.
    chat: Option<(CancellationToken, JoinHandle<()>)>,
}

impl PeerSession {
    async fn run(mut self, mut events: mpsc::Receiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(peer_id = %self.peer_id, "peer cancelled");
                    break;
                }
                event = events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Open) => self.on_open().await,
                Some(ChannelEvent::Message(bytes)) => self.on_message(bytes).await,
                Some(ChannelEvent::Closed) | None => break,
            }
        }

        self.teardown().await;
    }

    async fn on_open(&self) {
        debug!(peer_id = %self.peer_id, "data channel open");
        self.reply_plain(ServerMessage::NoisePubkey {
            public_key: self.ctx.secure.public_key_base64(),
        })
        .await;
    }

    async fn on_message(&mut self, bytes: Bytes) {
        self.ctx.registry.touch(&self.peer_id);

        let plaintext = if self.state == SecureState::Secure {
            match self.ctx.secure.decrypt(&self.peer_id, &bytes) {
                Ok(plain) => Bytes::from(plain),
                Err(err) => {
                    warn!(peer_id = %self.peer_id, %err, "inbound frame rejected");
                    self.reply(ServerMessage::error(ErrorKind::DecryptionFailed, err.to_string()))
                        .await;
                    return;
                }
            }
        } else {
            bytes
        };

        let message = match decode_client(&plaintext) {
            Ok(message) => message,
            Err(err) => {
                debug!(peer_id = %self.peer_id, %err, "unusable client frame");
                self.reply(ServerMessage::error(err.kind(), err.to_string()))
                    .await;
                return;
            }
        };

        match message {
            ClientMessage::NoiseInit { noise_init } => self.on_noise_init(&noise_init).await,
            ClientMessage::Ping => self.reply(ServerMessage::Pong).await,
            ClientMessage::Chat { model, prompt, .. } => self.on_chat(model, prompt).await,
        }
    }

    async fn on_noise_init(&mut self, encoded: &str) {
        if self.state == SecureState::Secure {
            self.reply(ServerMessage::error(
                ErrorKind::AlreadyEstablished,
                "secure session already established",
            ))
            .await;
            return;
        }

        let init = match BASE64.decode(encoded) {
            Ok(init) => init,
            Err(err) => {
                self.reply(ServerMessage::error(
                    ErrorKind::InvalidMessage,
                    format!("noise_init is not valid base64: {err}"),
                ))
                .await;
                return;
            }
        };

        self.state = SecureState::Handshaking;
        match self.ctx.secure.handle_handshake_init(&self.peer_id, &init) {
            Ok(response) => {
                self.reply_plain(ServerMessage::NoiseResponse {
                    noise_response: BASE64.encode(response),
                })
                .await;
                self.reply_plain(ServerMessage::E2eEstablished {
                    e2e_established: true,
                })
                .await;
                if self.outbox.enable_sealing().await.is_err() {
                    debug!(peer_id = %self.peer_id, "outbox closed before sealing");
                }
                self.state = SecureState::Secure;
                info!(peer_id = %self.peer_id, "peer secured");
            }
            Err(err) => {
                self.state = SecureState::Init;
                self.reply(ServerMessage::error(
                    ErrorKind::HandshakeFailed,
                    err.to_string(),
                ))
                .await;
            }
        }
    }

    async fn on_chat(&mut self, model: Option<String>, prompt: String) {
        if self.state != SecureState::Secure && !self.ctx.secure.plaintext_mode() {
            self.reply(ServerMessage::error(
                ErrorKind::NotSecure,
                "complete the noise handshake before chatting",
            ))
            .await;
            return;
        }

        self.supersede_chat().await;

        let job = ChatJob {
            model: self.ctx.proxy.choose(model.as_deref()),
            prompt,
        };
        debug!(peer_id = %self.peer_id, model = ?job.model, "chat accepted");

        let proxy = Arc::clone(&self.ctx.proxy);
        let outbox = self.outbox.clone();
        let cancel = self.cancel.child_token();
        let chat_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            proxy.stream_chat(&outbox, job, chat_cancel).await;
        });
        self.chat = Some((cancel, task));
    }

    /// Cancel the running chat and wait until it can emit nothing more.
    async fn supersede_chat(&mut self) {
        let Some((cancel, task)) = self.chat.take() else {
            return;
        };
        if !task.is_finished() {
            debug!(peer_id = %self.peer_id, "new chat replaces the one still streaming");
        }
        cancel.cancel();
        if let Err(err) = task.await {
            warn!(peer_id = %self.peer_id, %err, "chat task ended abnormally");
        }
    }

    async fn teardown(&mut self) {
        self.state = SecureState::Closed;
        self.cancel.cancel();
        self.ctx.secure.close_session(&self.peer_id);
        self.ctx.registry.deregister(&self.peer_id);
        self.channel.close().await;
        info!(peer_id = %self.peer_id, "peer closed");
    }

    async fn reply(&self, message: ServerMessage) {
        if self.outbox.send(message).await.is_err() {
            debug!(peer_id = %self.peer_id, "outbox closed, reply dropped");
        }
    }

    async fn reply_plain(&self, message: ServerMessage) {
        if self.outbox.send_plain(message).await.is_err() {
            debug!(peer_id = %self.peer_id, "outbox closed, reply dropped");
        }
    }
}
