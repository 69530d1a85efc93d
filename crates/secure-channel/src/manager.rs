use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use serde::Serialize;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cipher::{ChannelError, TransportState};
use crate::handshake::{self, HandshakeError};

/// One established session, keyed by peer ID in the manager.
#[derive(Debug)]
struct SecureSession {
    remote_static: [u8; 32],
    transport: TransportState,
    established_at: Instant,
}

/// Snapshot returned by [`SecureChannelManager::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub plaintext_mode: bool,
    pub public_key: String,
}

/// Owns the gateway's static Noise key and every peer's transport keys.
///
/// All methods take `&self`; the session map sits behind a single mutex that
/// is only held for the map lookup and the in-memory AEAD call.
pub struct SecureChannelManager {
    local_static: StaticSecret,
    public_key: [u8; 32],
    sessions: Mutex<HashMap<String, SecureSession>>,
    plaintext_mode: bool,
}

impl std::fmt::Debug for SecureChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannelManager")
            .field("public_key", &self.public_key_base64())
            .field("plaintext_mode", &self.plaintext_mode)
            .finish_non_exhaustive()
    }
}

impl Default for SecureChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureChannelManager {
    /// Create a manager with a fresh static key from the OS RNG.
    pub fn new() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Create a manager around an existing static key.
    pub fn from_secret(local_static: StaticSecret) -> Self {
        let public_key = PublicKey::from(&local_static).to_bytes();
        info!(public_key = %BASE64.encode(public_key), "secure channel key ready");
        Self {
            local_static,
            public_key,
            sessions: Mutex::new(HashMap::new()),
            plaintext_mode: false,
        }
    }

    /// Allow peers to chat before the handshake completes. Only available in
    /// debug builds.
    #[cfg(debug_assertions)]
    pub fn with_plaintext_mode(mut self, enabled: bool) -> Self {
        if enabled {
            warn!("plaintext mode enabled; chat frames may travel unencrypted (debug build only)");
        }
        self.plaintext_mode = enabled;
        self
    }

    pub fn plaintext_mode(&self) -> bool {
        self.plaintext_mode
    }

    pub fn local_public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Standard base64 form of [`local_public_key`](Self::local_public_key).
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.public_key)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SecureSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer an initiator's first handshake message and store the resulting
    /// session for `peer_id`.
    ///
    /// A repeated call replaces the previous session. On failure any previous
    /// session for the peer is removed as well.
    pub fn handle_handshake_init(
        &self,
        peer_id: &str,
        init: &[u8],
    ) -> Result<Vec<u8>, HandshakeError> {
        let outcome = handshake::respond(&self.local_static, init, &[]);

        let mut sessions = self.sessions();
        match outcome {
            Ok(responded) => {
                let replaced = sessions
                    .insert(
                        peer_id.to_string(),
                        SecureSession {
                            remote_static: responded.remote_static,
                            transport: responded.transport,
                            established_at: Instant::now(),
                        },
                    )
                    .is_some();
                info!(
                    peer_id,
                    replaced,
                    remote_key = %BASE64.encode(responded.remote_static),
                    "secure session established"
                );
                Ok(responded.response)
            }
            Err(err) => {
                if sessions.remove(peer_id).is_some() {
                    debug!(peer_id, "dropped previous session after failed handshake");
                }
                warn!(peer_id, error = %err, "handshake failed");
                Err(err)
            }
        }
    }

    /// Whether `peer_id` has completed a handshake.
    pub fn is_established(&self, peer_id: &str) -> bool {
        self.sessions().contains_key(peer_id)
    }

    /// The static key the peer authenticated with.
    pub fn remote_static(&self, peer_id: &str) -> Option<[u8; 32]> {
        self.sessions().get(peer_id).map(|s| s.remote_static)
    }

    /// Seal `plaintext` for `peer_id`.
    pub fn encrypt(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(peer_id)
            .ok_or_else(|| ChannelError::NotEstablished {
                peer_id: peer_id.to_string(),
            })?;
        session.transport.seal(plaintext)
    }

    /// Open a frame received from `peer_id`.
    pub fn decrypt(&self, peer_id: &str, frame: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut sessions = self.sessions();
        let session = sessions
            .get_mut(peer_id)
            .ok_or_else(|| ChannelError::NotEstablished {
                peer_id: peer_id.to_string(),
            })?;
        session.transport.open(frame)
    }

    /// Forget the session for `peer_id`. Closing an unknown peer is a no-op.
    pub fn close_session(&self, peer_id: &str) {
        if let Some(session) = self.sessions().remove(peer_id) {
            info!(
                peer_id,
                lifetime_ms = session.established_at.elapsed().as_millis() as u64,
                frames_sent = session.transport.send_nonce(),
                "secure session closed"
            );
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active_sessions: self.sessions().len(),
            plaintext_mode: self.plaintext_mode,
            public_key: self.public_key_base64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::MAX_PLAINTEXT_LEN;
    use crate::handshake::Initiator;

    /// Runs a full handshake for `peer_id` and returns the client transport.
    fn connect(manager: &SecureChannelManager, peer_id: &str) -> TransportState {
        let client = StaticSecret::random_from_rng(OsRng);
        let (initiator, msg1) =
            Initiator::initiate(client, manager.local_public_key(), &[]).unwrap();
        let msg2 = manager.handle_handshake_init(peer_id, &msg1).unwrap();
        let (_, transport) = initiator.finish(&msg2).unwrap();
        transport
    }

    #[test]
    fn public_key_is_stable_and_base64() {
        let manager = SecureChannelManager::new();
        let decoded = BASE64.decode(manager.public_key_base64()).unwrap();
        assert_eq!(decoded, manager.local_public_key());
        assert_eq!(manager.local_public_key(), manager.local_public_key());
    }

    #[test]
    fn encrypt_without_session_is_not_established() {
        let manager = SecureChannelManager::new();
        assert_eq!(
            manager.encrypt("peer-x", b"hi"),
            Err(ChannelError::NotEstablished {
                peer_id: "peer-x".into()
            })
        );
        assert!(matches!(
            manager.decrypt("peer-x", &[0u8; 32]),
            Err(ChannelError::NotEstablished { .. })
        ));
    }

    #[test]
    fn round_trip_up_to_the_frame_limit() {
        let manager = SecureChannelManager::new();
        let mut client = connect(&manager, "peer-a");

        for size in [0usize, 1, 17, 1024, MAX_PLAINTEXT_LEN] {
            let message: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

            let frame = manager.encrypt("peer-a", &message).unwrap();
            assert_eq!(client.open(&frame).unwrap(), message);

            let frame = client.seal(&message).unwrap();
            assert_eq!(manager.decrypt("peer-a", &frame).unwrap(), message);
        }
    }

    #[test]
    fn oversized_message_is_rejected() {
        let manager = SecureChannelManager::new();
        let _client = connect(&manager, "peer-a");
        let err = manager
            .encrypt("peer-a", &vec![0u8; MAX_PLAINTEXT_LEN + 1])
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::MessageTooLarge {
                len: MAX_PLAINTEXT_LEN + 1
            }
        );
    }

    #[test]
    fn nonces_strictly_increase() {
        let manager = SecureChannelManager::new();
        let _client = connect(&manager, "peer-a");

        let nonces: Vec<u64> = (0..5)
            .map(|_| {
                let frame = manager.encrypt("peer-a", b"x").unwrap();
                u64::from_be_bytes(frame[..8].try_into().unwrap())
            })
            .collect();
        assert!(nonces.windows(2).all(|w| w[1] > w[0]), "{nonces:?}");
    }

    #[test]
    fn replayed_frame_fails_and_session_survives() {
        let manager = SecureChannelManager::new();
        let mut client = connect(&manager, "peer-a");

        let frame = client.seal(b"ping").unwrap();
        manager.decrypt("peer-a", &frame).unwrap();
        assert_eq!(
            manager.decrypt("peer-a", &frame),
            Err(ChannelError::AuthenticationFailed)
        );

        let next = client.seal(b"ping again").unwrap();
        assert_eq!(manager.decrypt("peer-a", &next).unwrap(), b"ping again");
    }

    #[test]
    fn rehandshake_replaces_keys() {
        let manager = SecureChannelManager::new();
        let mut old_client = connect(&manager, "peer-a");
        let mut new_client = connect(&manager, "peer-a");
        assert_eq!(manager.stats().active_sessions, 1);

        let frame = manager.encrypt("peer-a", b"fresh").unwrap();
        assert_eq!(new_client.open(&frame).unwrap(), b"fresh");

        let stale = old_client.seal(b"stale").unwrap();
        assert_eq!(
            manager.decrypt("peer-a", &stale),
            Err(ChannelError::AuthenticationFailed)
        );
    }

    #[test]
    fn failed_handshake_removes_existing_session() {
        let manager = SecureChannelManager::new();
        let _client = connect(&manager, "peer-a");
        assert!(manager.is_established("peer-a"));

        assert!(manager.handle_handshake_init("peer-a", b"garbage").is_err());
        assert!(!manager.is_established("peer-a"));
    }

    #[test]
    fn sessions_are_isolated_per_peer() {
        let manager = SecureChannelManager::new();
        let mut a = connect(&manager, "peer-a");
        let _b = connect(&manager, "peer-b");

        let frame = a.seal(b"for a only").unwrap();
        assert_eq!(
            manager.decrypt("peer-b", &frame),
            Err(ChannelError::AuthenticationFailed)
        );
        assert_eq!(manager.decrypt("peer-a", &frame).unwrap(), b"for a only");
    }

    #[test]
    fn remote_static_is_learned() {
        let manager = SecureChannelManager::new();
        let client = StaticSecret::random_from_rng(OsRng);
        let client_pub = PublicKey::from(&client).to_bytes();

        let (_, msg1) = Initiator::initiate(client, manager.local_public_key(), &[]).unwrap();
        manager.handle_handshake_init("peer-a", &msg1).unwrap();
        assert_eq!(manager.remote_static("peer-a"), Some(client_pub));
    }

    #[test]
    fn close_session_is_idempotent() {
        let manager = SecureChannelManager::new();
        let _client = connect(&manager, "peer-a");

        manager.close_session("peer-a");
        manager.close_session("peer-a");
        manager.close_session("never-existed");

        assert!(!manager.is_established("peer-a"));
        assert_eq!(manager.stats().active_sessions, 0);
    }

    #[test]
    fn stats_serialize_with_expected_fields() {
        let manager = SecureChannelManager::new();
        let json = serde_json::to_value(manager.stats()).unwrap();
        assert_eq!(json["active_sessions"], 0);
        assert_eq!(json["plaintext_mode"], false);
        assert_eq!(json["public_key"], manager.public_key_base64());
    }
}
