//! Transport-phase encryption: ChaCha20-Poly1305 with explicit nonces.
//!
//! Each sealed frame is laid out as
//!
//! ```text
//! +----------------+---------------------------+----------+
//! | nonce (8, BE)  | ciphertext (len(plain))   | tag (16) |
//! +----------------+---------------------------+----------+
//! ```
//!
//! The AEAD nonce is the Noise encoding of the counter: four zero bytes
//! followed by the counter in little-endian order.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Largest plaintext a single frame may carry.
pub const MAX_PLAINTEXT_LEN: usize = 65_535;

/// Length of the explicit nonce prefix on the wire.
pub const NONCE_LEN: usize = 8;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Errors from sealing or opening transport frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// No established session exists for the peer.
    #[error("no established secure session for peer '{peer_id}'")]
    NotEstablished { peer_id: String },

    /// The plaintext exceeds [`MAX_PLAINTEXT_LEN`].
    #[error("message of {len} bytes exceeds the 65535 byte limit")]
    MessageTooLarge { len: usize },

    /// Short frame, bad tag, or a nonce at or below the receive watermark.
    #[error("frame failed authentication")]
    AuthenticationFailed,

    /// The send counter reached its reserved maximum; the session must be
    /// re-established.
    #[error("send nonce space exhausted")]
    NonceExhausted,
}

fn aead_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// Encrypts `plaintext` under `key` with the Noise nonce for `counter`.
pub(crate) fn seal(key: &[u8; 32], counter: u64, ad: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(&aead_nonce(counter), Payload { msg: plaintext, aad: ad })
        .ok()
}

/// Decrypts and verifies `ciphertext`. `None` on any authentication failure.
pub(crate) fn open(key: &[u8; 32], counter: u64, ad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(&aead_nonce(counter), Payload { msg: ciphertext, aad: ad })
        .ok()
}

// ---------------------------------------------------------------------------
// TransportState
// ---------------------------------------------------------------------------

/// The pair of one-way keys produced by a completed handshake, with the
/// counters that go with them.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TransportState {
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_nonce: u64,
    /// Highest nonce accepted so far, `None` before the first frame.
    recv_watermark: Option<u64>,
}

impl std::fmt::Debug for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportState")
            .field("send_nonce", &self.send_nonce)
            .field("recv_watermark", &self.recv_watermark)
            .finish_non_exhaustive()
    }
}

impl TransportState {
    pub(crate) fn new(send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self {
            send_key,
            recv_key,
            send_nonce: 0,
            recv_watermark: None,
        }
    }

    /// Number of frames sealed so far (the next nonce to be used).
    pub fn send_nonce(&self) -> u64 {
        self.send_nonce
    }

    /// Seal one message into a wire frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(ChannelError::MessageTooLarge {
                len: plaintext.len(),
            });
        }
        // u64::MAX is reserved and never used as a nonce.
        if self.send_nonce == u64::MAX {
            return Err(ChannelError::NonceExhausted);
        }

        let nonce = self.send_nonce;
        let ciphertext =
            seal(&self.send_key, nonce, &[], plaintext).ok_or(ChannelError::AuthenticationFailed)?;
        self.send_nonce += 1;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a wire frame. The watermark only moves once the tag verifies.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if frame.len() < NONCE_LEN + TAG_LEN {
            return Err(ChannelError::AuthenticationFailed);
        }
        if frame.len() > NONCE_LEN + MAX_PLAINTEXT_LEN + TAG_LEN {
            return Err(ChannelError::MessageTooLarge {
                len: frame.len() - NONCE_LEN - TAG_LEN,
            });
        }

        let (prefix, ciphertext) = frame.split_at(NONCE_LEN);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(prefix);
        let nonce = u64::from_be_bytes(nonce_bytes);

        if nonce == u64::MAX || self.recv_watermark.is_some_and(|seen| nonce <= seen) {
            return Err(ChannelError::AuthenticationFailed);
        }

        let plaintext =
            open(&self.recv_key, nonce, &[], ciphertext).ok_or(ChannelError::AuthenticationFailed)?;
        self.recv_watermark = Some(nonce);
        Ok(plaintext)
    }

    #[cfg(test)]
    pub(crate) fn set_send_nonce(&mut self, nonce: u64) {
        self.send_nonce = nonce;
    }
}
