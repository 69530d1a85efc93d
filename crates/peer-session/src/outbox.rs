//! Per-peer outbound queue.
//!
//! Every frame for a peer goes through its [`Outbox`]. A single background
//! writer drains the queue, so frames reach the data channel in the order
//! they were queued. The writer also owns the sealing switch and performs
//! encryption itself, which keeps transport nonces in wire order.
//!
//! No frame exceeds [`MAX_PLAINTEXT_LEN`]: long deltas are split into several
//! `delta` frames, and any other oversized frame is replaced by an `error`
//! frame of kind `message_too_large`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use inference_proxy::{SinkClosed, StreamEvent, StreamSink};
use secure_channel::{SecureChannelManager, MAX_PLAINTEXT_LEN};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{encode_server, ErrorKind, ServerMessage};
use crate::transport::{DataChannel, OutboundFrame};

/// Queue depth between producers and the writer task.
const CHANNEL_BUFFER: usize = 1024;

/// Encoded size of a `delta` frame with empty content.
const DELTA_OVERHEAD: usize = r#"{"op":"delta","content":""}"#.len();

#[derive(Debug)]
enum Command {
    /// Always JSON text, even after sealing is on.
    Plain(ServerMessage),
    /// Sealed once sealing is on, JSON text before that.
    Send(ServerMessage),
    EnableSealing,
}

/// Cloneable handle to a peer's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Command>,
}

impl Outbox {
    /// Spawn the writer task for `peer_id`.
    ///
    /// The task exits when every `Outbox` clone is dropped or the channel
    /// refuses a frame.
    pub fn start(
        peer_id: String,
        channel: Arc<dyn DataChannel>,
        secure: Arc<SecureChannelManager>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let handle = tokio::spawn(run_writer_loop(peer_id, channel, secure, rx));
        (Self { tx }, handle)
    }

    /// Queue a message, sealed if sealing has been enabled.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SinkClosed> {
        self.push(Command::Send(message)).await
    }

    /// Queue a message that always goes out as plaintext.
    pub async fn send_plain(&self, message: ServerMessage) -> Result<(), SinkClosed> {
        self.push(Command::Plain(message)).await
    }

    /// Seal every [`Outbox::send`] queued after this call.
    pub async fn enable_sealing(&self) -> Result<(), SinkClosed> {
        self.push(Command::EnableSealing).await
    }

    async fn push(&self, command: Command) -> Result<(), SinkClosed> {
        self.tx.send(command).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl StreamSink for Outbox {
    async fn emit(&self, event: StreamEvent) -> Result<(), SinkClosed> {
        let message = match event {
            StreamEvent::Delta(content) => {
                for content in split_delta(content) {
                    self.send(ServerMessage::Delta { content }).await?;
                }
                return Ok(());
            }
            StreamEvent::Done => ServerMessage::Done,
            StreamEvent::Error(err) => {
                let kind = if err.is_decode() {
                    ErrorKind::BackendDecode
                } else {
                    ErrorKind::BackendUnavailable
                };
                ServerMessage::error(kind, err.to_string())
            }
        };
        self.send(message).await
    }
}

/// Cut delta text so that each piece, once JSON-encoded into a `delta`
/// frame, fits in one transport frame. Cuts fall on char boundaries.
fn split_delta(content: String) -> Vec<String> {
    let budget = MAX_PLAINTEXT_LEN - DELTA_OVERHEAD;
    let escaped: usize = content.chars().map(escaped_len).sum();
    if escaped <= budget {
        return vec![content];
    }

    let mut pieces = Vec::with_capacity(escaped / budget + 1);
    let mut start = 0;
    let mut used = 0;
    for (idx, ch) in content.char_indices() {
        let cost = escaped_len(ch);
        if used + cost > budget {
            pieces.push(content[start..idx].to_string());
            start = idx;
            used = 0;
        }
        used += cost;
    }
    pieces.push(content[start..].to_string());
    pieces
}

/// Bytes `ch` takes inside a JSON string as written by `serde_json`.
fn escaped_len(ch: char) -> usize {
    match ch {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Encode `message`, swapping in a `message_too_large` error when the
/// encoding exceeds the frame ceiling.
fn frame_text(peer_id: &str, message: &ServerMessage) -> Option<String> {
    let text = match encode_server(message) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(peer_id = %peer_id, %err, "failed to encode frame");
            return None;
        }
    };
    if text.len() <= MAX_PLAINTEXT_LEN {
        return Some(text);
    }

    tracing::warn!(
        peer_id = %peer_id,
        len = text.len(),
        "frame exceeds the size ceiling, sending an error instead"
    );
    let notice = ServerMessage::error(
        ErrorKind::MessageTooLarge,
        format!("frame of {} bytes exceeds {MAX_PLAINTEXT_LEN}", text.len()),
    );
    encode_server(&notice).ok()
}

async fn run_writer_loop(
    peer_id: String,
    channel: Arc<dyn DataChannel>,
    secure: Arc<SecureChannelManager>,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut sealing = false;

    while let Some(command) = rx.recv().await {
        let (message, seal) = match command {
            Command::EnableSealing => {
                sealing = true;
                tracing::debug!(peer_id = %peer_id, "outbox sealing enabled");
                continue;
            }
            Command::Plain(message) => (message, false),
            Command::Send(message) => (message, sealing),
        };

        let Some(text) = frame_text(&peer_id, &message) else {
            continue;
        };

        let frame = if seal {
            match secure.encrypt(&peer_id, text.as_bytes()) {
                Ok(sealed) => OutboundFrame::Binary(Bytes::from(sealed)),
                // The session is gone or its nonces are spent. Later frames
                // cannot be sealed either, so the sink closes.
                Err(err) => {
                    tracing::warn!(peer_id = %peer_id, %err, "sealing failed, outbox stopping");
                    return;
                }
            }
        } else {
            OutboundFrame::Text(text)
        };

        if let Err(err) = channel.send(frame).await {
            tracing::debug!(peer_id = %peer_id, %err, "data channel gone, outbox stopping");
            return;
        }
    }

    tracing::debug!(peer_id = %peer_id, "outbox writer shutting down");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transport::ChannelSendError;
    use inference_proxy::BackendError;
    use secure_channel::{Initiator, StaticSecret, TransportState};

    #[derive(Default)]
    struct CapturingChannel {
        frames: Mutex<Vec<OutboundFrame>>,
        fail: bool,
    }

    #[async_trait]
    impl DataChannel for CapturingChannel {
        async fn send(&self, frame: OutboundFrame) -> Result<(), ChannelSendError> {
            if self.fail {
                return Err(ChannelSendError("closed".into()));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&self) {}
    }

    fn text(frame: &OutboundFrame) -> serde_json::Value {
        match frame {
            OutboundFrame::Text(t) => serde_json::from_str(t).unwrap(),
            OutboundFrame::Binary(_) => panic!("expected a text frame"),
        }
    }

    #[tokio::test]
    async fn frames_keep_queue_order() {
        let channel = Arc::new(CapturingChannel::default());
        let secure = Arc::new(SecureChannelManager::new());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel.clone(), secure);

        outbox.send(ServerMessage::Pong).await.unwrap();
        outbox
            .send(ServerMessage::Delta {
                content: "a".into(),
            })
            .await
            .unwrap();
        outbox.send(ServerMessage::Done).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        let frames = channel.frames.lock().unwrap();
        let ops: Vec<_> = frames.iter().map(|f| text(f)["op"].clone()).collect();
        assert_eq!(ops, vec!["pong", "delta", "done"]);
    }

    #[tokio::test]
    async fn sealing_applies_to_later_sends_only() {
        let secure = Arc::new(SecureChannelManager::new());
        let client_key = StaticSecret::random_from_rng(rand::thread_rng());
        let (initiator, init) =
            Initiator::initiate(client_key, secure.local_public_key(), &[]).unwrap();
        let response = secure.handle_handshake_init("peer-1", &init).unwrap();
        let (_, mut client) = initiator.finish(&response).unwrap();

        let channel = Arc::new(CapturingChannel::default());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel.clone(), secure);

        outbox.send(ServerMessage::Pong).await.unwrap();
        outbox.enable_sealing().await.unwrap();
        outbox.send(ServerMessage::Pong).await.unwrap();
        outbox.send_plain(ServerMessage::Pong).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        let frames = channel.frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(text(&frames[0])["op"], "pong");
        match &frames[1] {
            OutboundFrame::Binary(sealed) => {
                let plain = client.open(sealed).unwrap();
                let value: serde_json::Value = serde_json::from_slice(&plain).unwrap();
                assert_eq!(value["op"], "pong");
            }
            other => panic!("expected sealed frame, got {other:?}"),
        }
        assert_eq!(text(&frames[2])["op"], "pong");
    }

    #[tokio::test]
    async fn backend_errors_map_to_frame_kinds() {
        let channel = Arc::new(CapturingChannel::default());
        let secure = Arc::new(SecureChannelManager::new());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel.clone(), secure);

        outbox
            .emit(StreamEvent::Error(BackendError::Decode("eof".into())))
            .await
            .unwrap();
        outbox
            .emit(StreamEvent::Error(BackendError::Status { status: 500 }))
            .await
            .unwrap();
        drop(outbox);
        handle.await.unwrap();

        let frames = channel.frames.lock().unwrap();
        assert_eq!(text(&frames[0])["kind"], "backend_decode");
        assert_eq!(text(&frames[1])["kind"], "backend_unavailable");
    }

    #[tokio::test]
    async fn failed_channel_closes_the_sink() {
        let channel = Arc::new(CapturingChannel {
            fail: true,
            ..Default::default()
        });
        let secure = Arc::new(SecureChannelManager::new());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel, secure);

        outbox.send(ServerMessage::Pong).await.unwrap();
        handle.await.unwrap();
        assert!(outbox.emit(StreamEvent::Done).await.is_err());
    }
    fn secured_pair(peer_id: &str) -> (Arc<SecureChannelManager>, TransportState) {
        let secure = Arc::new(SecureChannelManager::new());
        let client_key = StaticSecret::random_from_rng(rand::thread_rng());
        let (initiator, init) =
            Initiator::initiate(client_key, secure.local_public_key(), &[]).unwrap();
        let response = secure.handle_handshake_init(peer_id, &init).unwrap();
        let (_, client) = initiator.finish(&response).unwrap();
        (secure, client)
    }

    #[tokio::test]
    async fn long_delta_is_split_across_sealed_frames() {
        let (secure, mut client) = secured_pair("peer-1");
        let channel = Arc::new(CapturingChannel::default());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel.clone(), secure);

        let content = "x".repeat(70_000);
        outbox.enable_sealing().await.unwrap();
        outbox
            .emit(StreamEvent::Delta(content.clone()))
            .await
            .unwrap();
        outbox.emit(StreamEvent::Done).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        let frames = channel.frames.lock().unwrap();
        let messages: Vec<serde_json::Value> = frames
            .iter()
            .map(|frame| match frame {
                OutboundFrame::Binary(sealed) => {
                    let plain = client.open(sealed).unwrap();
                    assert!(plain.len() <= MAX_PLAINTEXT_LEN);
                    serde_json::from_slice(&plain).unwrap()
                }
                other => panic!("expected sealed frame, got {other:?}"),
            })
            .collect();

        assert_eq!(messages.len(), 3);
        let (done, deltas) = messages.split_last().unwrap();
        assert_eq!(done["op"], "done");
        let joined: String = deltas
            .iter()
            .map(|m| {
                assert_eq!(m["op"], "delta");
                m["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(joined, content);
    }

    #[test]
    fn split_accounts_for_escapes_and_char_boundaries() {
        let content = "é\"\n\u{1}".repeat(20_000);
        let pieces = split_delta(content.clone());
        assert!(pieces.len() > 1);

        for piece in &pieces {
            let frame = encode_server(&ServerMessage::Delta {
                content: piece.clone(),
            })
            .unwrap();
            assert!(frame.len() <= MAX_PLAINTEXT_LEN);
        }
        assert_eq!(pieces.concat(), content);
    }

    #[test]
    fn short_delta_stays_whole() {
        assert_eq!(split_delta("hello".into()), vec!["hello".to_string()]);
        assert_eq!(
            DELTA_OVERHEAD,
            encode_server(&ServerMessage::Delta {
                content: String::new()
            })
            .unwrap()
            .len()
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_replaced_by_an_error() {
        let channel = Arc::new(CapturingChannel::default());
        let secure = Arc::new(SecureChannelManager::new());
        let (outbox, handle) = Outbox::start("peer-1".into(), channel.clone(), secure);

        outbox
            .send(ServerMessage::error(
                ErrorKind::BackendUnavailable,
                "e".repeat(70_000),
            ))
            .await
            .unwrap();
        outbox.send(ServerMessage::Pong).await.unwrap();
        drop(outbox);
        handle.await.unwrap();

        let frames = channel.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(text(&frames[0])["kind"], "message_too_large");
        assert_eq!(text(&frames[1])["op"], "pong");
    }

    #[tokio::test]
    async fn sealing_failure_closes_the_sink() {
        let (secure, _client) = secured_pair("peer-1");
        let channel = Arc::new(CapturingChannel::default());
        let (outbox, handle) =
            Outbox::start("peer-1".into(), channel.clone(), Arc::clone(&secure));

        outbox.enable_sealing().await.unwrap();
        secure.close_session("peer-1");
        outbox.send(ServerMessage::Pong).await.unwrap();
        handle.await.unwrap();

        assert!(outbox.emit(StreamEvent::Done).await.is_err());
        assert!(channel.frames.lock().unwrap().is_empty());
    }
}
