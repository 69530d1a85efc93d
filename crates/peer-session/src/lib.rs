//! Peer sessions over a message-oriented data channel.
//!
//! Each connected peer gets its own task (see [`spawn_peer`]) that walks the
//! `Init → Handshaking → Secure → Closed` state machine, answers protocol
//! ops and hands chat requests to the streaming inference proxy. Outbound
//! frames for a peer are serialised through its [`Outbox`], which seals them
//! once the Noise handshake has completed.
//!
//! ```text
//! client ──data channel──▶ controller ──▶ secure-channel (decrypt)
//!                              │
//!                              ├──▶ inference-proxy ──▶ backend
//!                              ▼
//!                           outbox ──(seal)──▶ data channel
//! ```
//!
//! The transport itself sits behind [`TransportEngine`] and [`DataChannel`],
//! so the controller can be driven by WebRTC in the gateway and by an
//! in-memory channel in tests.

pub mod controller;
pub mod outbox;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use controller::{spawn_peer, SecureState, SessionContext};
pub use outbox::Outbox;
pub use protocol::{ClientMessage, ErrorKind, ProtocolError, ServerMessage};
pub use registry::{new_peer_id, DuplicatePeer, PeerRegistry};
pub use transport::{
    ChannelEvent, ChannelSendError, DataChannel, NegotiatedSession, NegotiationError,
    OutboundFrame, TransportEngine,
};
