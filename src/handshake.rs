//! The key exchange run over a fresh endpoint channel.
//!
//! A three-step UKEY2-shaped exchange, reduced to its essentials: each side
//! contributes an ephemeral X25519 key, the Diffie-Hellman output is run
//! through HKDF bound to the full message transcript, and both directions
//! get their own ChaCha20-Poly1305 key. The same transcript also yields the
//! short authentication token both users can compare out-of-band.
//!
//! From the connection state machine's point of view this module is a
//! collaborator: it either succeeds with an [`EncryptionContext`] plus the
//! token, or fails with [`Status::Authentication`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use log::debug;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::channel::EndpointChannel;
use crate::Status;

/// Digits in the derived authentication token.
pub const AUTH_TOKEN_LENGTH: usize = 4;

const MAGIC: &[u8; 2] = b"NL";
const VERSION: u8 = 1;
const ROLE_INITIATOR: u8 = 0;
const ROLE_RESPONDER: u8 = 1;
const MESSAGE_LENGTH: usize = 4 + 32;

/// A duplex AEAD context derived from one completed key exchange.
///
/// Message nonces are per-direction counters; the channel serializes reads
/// and writes, which keeps the counters in lockstep with the wire.
pub struct EncryptionContext {
    to_peer: ChaCha20Poly1305,
    from_peer: ChaCha20Poly1305,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
}

impl EncryptionContext {
    fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        EncryptionContext {
            to_peer: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            from_peer: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_counter: AtomicU64::new(0),
            recv_counter: AtomicU64::new(0),
        }
    }

    /// Seals one outgoing frame.
    pub fn encode_to_peer(&self, plaintext: &[u8]) -> Vec<u8> {
        let counter = self.send_counter.fetch_add(1, Ordering::SeqCst);
        self.to_peer
            .encrypt(&message_nonce(counter), plaintext)
            // Sealing fails only on absurd plaintext sizes, which the frame
            // size cap rules out.
            .unwrap_or_default()
    }

    /// Opens one incoming frame. `None` when the bytes do not authenticate;
    /// the receive counter only advances on success, so a plaintext frame
    /// slipping in ahead of the peer's encryption does not desynchronize
    /// the stream.
    pub fn decode_from_peer(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let counter = self.recv_counter.load(Ordering::SeqCst);
        match self.from_peer.decrypt(&message_nonce(counter), ciphertext) {
            Ok(plaintext) => {
                self.recv_counter.store(counter + 1, Ordering::SeqCst);
                Some(plaintext)
            }
            Err(_) => None,
        }
    }
}

/// Outcome of a successful exchange.
pub struct HandshakeResult {
    pub context: Arc<EncryptionContext>,
    /// Stable 4-digit decimal string; both endpoints compute the same one.
    pub auth_token: String,
}

/// Runs the exchange as the dialing side.
pub fn initiate(channel: &EndpointChannel) -> Result<HandshakeResult, Status> {
    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let local_message = build_message(ROLE_INITIATOR, &PublicKey::from(&secret));

    channel
        .write(&local_message)
        .map_err(|_| Status::Authentication)?;
    let remote_message = channel.read().map_err(|_| Status::Authentication)?;
    let remote_public = parse_message(ROLE_RESPONDER, &remote_message)?;

    let shared = secret.diffie_hellman(&remote_public);
    derive(shared.as_bytes(), &local_message, &remote_message, true)
}

/// Runs the exchange as the accepting side.
pub fn respond(channel: &EndpointChannel) -> Result<HandshakeResult, Status> {
    let remote_message = channel.read().map_err(|_| Status::Authentication)?;
    let remote_public = parse_message(ROLE_INITIATOR, &remote_message)?;

    let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let local_message = build_message(ROLE_RESPONDER, &PublicKey::from(&secret));
    channel
        .write(&local_message)
        .map_err(|_| Status::Authentication)?;

    let shared = secret.diffie_hellman(&remote_public);
    derive(shared.as_bytes(), &remote_message, &local_message, false)
}

fn build_message(role: u8, public: &PublicKey) -> Vec<u8> {
    let mut message = Vec::with_capacity(MESSAGE_LENGTH);
    message.extend_from_slice(MAGIC);
    message.push(VERSION);
    message.push(role);
    message.extend_from_slice(public.as_bytes());
    message
}

fn parse_message(expected_role: u8, message: &[u8]) -> Result<PublicKey, Status> {
    if message.len() != MESSAGE_LENGTH
        || &message[..2] != MAGIC
        || message[2] != VERSION
        || message[3] != expected_role
    {
        debug!("malformed key exchange message ({} bytes)", message.len());
        return Err(Status::Authentication);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&message[4..]);
    Ok(PublicKey::from(key))
}

/// Transcript = initiator message then responder message, identical on both
/// sides.
fn derive(
    shared_secret: &[u8; 32],
    initiator_message: &[u8],
    responder_message: &[u8],
    is_initiator: bool,
) -> Result<HandshakeResult, Status> {
    let mut transcript = Vec::with_capacity(initiator_message.len() + responder_message.len());
    transcript.extend_from_slice(initiator_message);
    transcript.extend_from_slice(responder_message);

    let hkdf = Hkdf::<Sha256>::new(Some(&transcript), shared_secret);
    let mut initiator_key = [0u8; 32];
    let mut responder_key = [0u8; 32];
    hkdf.expand(b"initiator frames", &mut initiator_key)
        .map_err(|_| Status::Authentication)?;
    hkdf.expand(b"responder frames", &mut responder_key)
        .map_err(|_| Status::Authentication)?;

    let context = if is_initiator {
        EncryptionContext::new(&initiator_key, &responder_key)
    } else {
        EncryptionContext::new(&responder_key, &initiator_key)
    };

    let mut token_hasher = Sha256::new();
    token_hasher.update(b"auth token");
    token_hasher.update(shared_secret);
    token_hasher.update(&transcript);
    let digest = token_hasher.finalize();
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let auth_token = format!("{:04}", value % 10_000);

    Ok(HandshakeResult {
        context: Arc::new(context),
        auth_token,
    })
}

fn message_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}
