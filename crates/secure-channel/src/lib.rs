//! # secure-channel
//!
//! Authenticated encryption for peer sessions. A peer runs the initiator side
//! of `Noise_IK_25519_ChaChaPoly_SHA256` against the gateway's static key;
//! once the handshake completes every application message travels as a
//! ChaCha20-Poly1305 frame with an explicit, strictly increasing nonce.
//!
//! - [`handshake`]: the IK message patterns, for both sides.
//! - [`cipher`]: transport keys and frame layout.
//! - [`SecureChannelManager`]: per-peer sessions keyed by peer ID.

pub mod cipher;
pub mod handshake;
mod manager;

pub use cipher::{ChannelError, TransportState, MAX_PLAINTEXT_LEN};
pub use handshake::{HandshakeError, Initiator};
pub use manager::{SecureChannelManager, SessionStats};

// Re-exported so callers can build keys without depending on the curve crate.
pub use x25519_dalek::StaticSecret;
