//! `Noise_IK_25519_ChaChaPoly_SHA256`.
//!
//! ```text
//! IK:
//!   <- s
//!   ...
//!   -> e, es, s, ss
//!   <- e, ee, se
//! ```
//!
//! The gateway is always the responder. Its static key is announced to the
//! initiator out of band (the `noise_pubkey` frame) before message 1.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{self, TransportState, MAX_PLAINTEXT_LEN, TAG_LEN};

/// Full protocol name. Exactly 32 bytes, so it is used as the initial hash
/// without padding.
pub const PROTOCOL_NAME: &[u8; 32] = b"Noise_IK_25519_ChaChaPoly_SHA256";

const DH_LEN: usize = 32;

/// Smallest valid message 1: `e`, encrypted `s`, and an empty encrypted
/// payload.
pub const MIN_INIT_LEN: usize = DH_LEN + (DH_LEN + TAG_LEN) + TAG_LEN;

/// Smallest valid message 2: `e` and an empty encrypted payload.
pub const MIN_RESPONSE_LEN: usize = DH_LEN + TAG_LEN;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake message too short: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    #[error("handshake payload of {len} bytes is too large")]
    PayloadTooLarge { len: usize },

    #[error("handshake message failed authentication")]
    Decrypt,

    #[error("remote public key is not contributory")]
    WeakKey,

    #[error("handshake key derivation failed")]
    KeyDerivation,
}

// ---------------------------------------------------------------------------
// Symmetric state
// ---------------------------------------------------------------------------

fn hmac_sha256(key: &[u8; 32], parts: &[&[u8]]) -> Result<[u8; 32], HandshakeError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| HandshakeError::KeyDerivation)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Two-output HKDF as defined by the Noise framework.
fn hkdf2(chaining_key: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
    let mut temp_key = hmac_sha256(chaining_key, &[ikm])?;
    let out1 = hmac_sha256(&temp_key, &[&[0x01]])?;
    let out2 = hmac_sha256(&temp_key, &[&out1, &[0x02]])?;
    temp_key.zeroize();
    Ok((out1, out2))
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    k: Option<[u8; 32]>,
    n: u64,
}

impl SymmetricState {
    /// InitializeSymmetric followed by the IK pre-message pattern
    /// (empty prologue, then the responder's static key).
    fn new(responder_static: &PublicKey) -> Self {
        let mut state = Self {
            ck: *PROTOCOL_NAME,
            h: *PROTOCOL_NAME,
            k: None,
            n: 0,
        };
        state.mix_hash(&[]);
        state.mix_hash(responder_static.as_bytes());
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, input_key_material: &[u8]) -> Result<(), HandshakeError> {
        let (ck, k) = hkdf2(&self.ck, input_key_material)?;
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
        Ok(())
    }

    fn mix_dh(&mut self, secret: &StaticSecret, public: &PublicKey) -> Result<(), HandshakeError> {
        let shared = secret.diffie_hellman(public);
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKey);
        }
        self.mix_key(shared.as_bytes())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let out = match &self.k {
            Some(k) => {
                let sealed = cipher::seal(k, self.n, &self.h, plaintext).ok_or(
                    HandshakeError::PayloadTooLarge {
                        len: plaintext.len(),
                    },
                )?;
                self.n += 1;
                sealed
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let out = match &self.k {
            Some(k) => {
                let opened =
                    cipher::open(k, self.n, &self.h, ciphertext).ok_or(HandshakeError::Decrypt)?;
                self.n += 1;
                opened
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    /// Returns `(initiator → responder, responder → initiator)` keys.
    fn split(&self) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
        hkdf2(&self.ck, &[])
    }
}

fn public_from(bytes: &[u8]) -> Result<PublicKey, HandshakeError> {
    let array: [u8; DH_LEN] = bytes
        .try_into()
        .map_err(|_| HandshakeError::Truncated {
            len: bytes.len(),
            min: DH_LEN,
        })?;
    Ok(PublicKey::from(array))
}

fn check_payload(payload: &[u8]) -> Result<(), HandshakeError> {
    // The whole handshake message has to fit in one frame.
    if payload.len() > MAX_PLAINTEXT_LEN - MIN_INIT_LEN {
        return Err(HandshakeError::PayloadTooLarge { len: payload.len() });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Responder
// ---------------------------------------------------------------------------

/// Result of answering an initiator's first message.
#[derive(Debug)]
pub struct Responded {
    /// Message 2, to be sent back to the initiator.
    pub response: Vec<u8>,
    /// The initiator's static public key, learned from message 1.
    pub remote_static: [u8; 32],
    /// Payload the initiator attached to message 1.
    pub payload: Vec<u8>,
    /// Ready-to-use transport keys.
    pub transport: TransportState,
}

/// Process message 1 as the responder and produce message 2.
pub fn respond(
    local_static: &StaticSecret,
    message: &[u8],
    payload: &[u8],
) -> Result<Responded, HandshakeError> {
    if message.len() < MIN_INIT_LEN {
        return Err(HandshakeError::Truncated {
            len: message.len(),
            min: MIN_INIT_LEN,
        });
    }
    check_payload(payload)?;

    let local_public = PublicKey::from(local_static);
    let mut state = SymmetricState::new(&local_public);

    // -> e
    let (re_bytes, rest) = message.split_at(DH_LEN);
    let re = public_from(re_bytes)?;
    state.mix_hash(re.as_bytes());

    // -> es
    state.mix_dh(local_static, &re)?;

    // -> s
    let (enc_static, enc_payload) = rest.split_at(DH_LEN + TAG_LEN);
    let rs = public_from(&state.decrypt_and_hash(enc_static)?)?;

    // -> ss
    state.mix_dh(local_static, &rs)?;

    let received_payload = state.decrypt_and_hash(enc_payload)?;

    // <- e
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    state.mix_hash(ephemeral_public.as_bytes());
    let mut response = Vec::with_capacity(MIN_RESPONSE_LEN + payload.len());
    response.extend_from_slice(ephemeral_public.as_bytes());

    // <- ee, se
    state.mix_dh(&ephemeral, &re)?;
    state.mix_dh(&ephemeral, &rs)?;

    response.extend_from_slice(&state.encrypt_and_hash(payload)?);

    let (initiator_to_responder, responder_to_initiator) = state.split()?;
    Ok(Responded {
        response,
        remote_static: rs.to_bytes(),
        payload: received_payload,
        transport: TransportState::new(responder_to_initiator, initiator_to_responder),
    })
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// Client half of the handshake, waiting for message 2.
pub struct Initiator {
    state: SymmetricState,
    local_static: StaticSecret,
    ephemeral: StaticSecret,
}

impl std::fmt::Debug for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Initiator").finish_non_exhaustive()
    }
}

impl Initiator {
    /// Build message 1 towards a responder whose static key is already known.
    ///
    /// Returns the pending initiator together with the bytes to send.
    pub fn initiate(
        local_static: StaticSecret,
        responder_static: [u8; 32],
        payload: &[u8],
    ) -> Result<(Self, Vec<u8>), HandshakeError> {
        check_payload(payload)?;

        let rs = PublicKey::from(responder_static);
        let mut state = SymmetricState::new(&rs);

        // -> e
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        state.mix_hash(ephemeral_public.as_bytes());
        let mut message = Vec::with_capacity(MIN_INIT_LEN + payload.len());
        message.extend_from_slice(ephemeral_public.as_bytes());

        // -> es
        state.mix_dh(&ephemeral, &rs)?;

        // -> s
        let local_public = PublicKey::from(&local_static);
        message.extend_from_slice(&state.encrypt_and_hash(local_public.as_bytes())?);

        // -> ss
        state.mix_dh(&local_static, &rs)?;

        message.extend_from_slice(&state.encrypt_and_hash(payload)?);

        Ok((
            Self {
                state,
                local_static,
                ephemeral,
            },
            message,
        ))
    }

    /// Consume message 2. Returns the responder's payload and the transport
    /// keys.
    pub fn finish(mut self, response: &[u8]) -> Result<(Vec<u8>, TransportState), HandshakeError> {
        if response.len() < MIN_RESPONSE_LEN {
            return Err(HandshakeError::Truncated {
                len: response.len(),
                min: MIN_RESPONSE_LEN,
            });
        }

        // <- e
        let (re_bytes, enc_payload) = response.split_at(DH_LEN);
        let re = public_from(re_bytes)?;
        self.state.mix_hash(re.as_bytes());

        // <- ee, se
        self.state.mix_dh(&self.ephemeral, &re)?;
        self.state.mix_dh(&self.local_static, &re)?;

        let payload = self.state.decrypt_and_hash(enc_payload)?;

        let (initiator_to_responder, responder_to_initiator) = self.state.split()?;
        Ok((
            payload,
            TransportState::new(initiator_to_responder, responder_to_initiator),
        ))
    }
}
