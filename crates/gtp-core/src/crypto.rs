//! Cryptographic primitives for the GTP handshake.
//!
//! Provides:
//!   1. BLAKE3 hashing — Hello hashes and the directional key schedule
//!   2. Ephemeral X25519 key agreement (ECDHE)
//!   3. Ed25519 signatures over the key exchange transcript
//!   4. Random values — Hello randoms, IVs, nonces, session ids
//!
//! Secret material is held in `Zeroizing` buffers and wiped on drop.
//! There is no unsafe code in this module.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::wire::{CipherSuite, Compression, Message, NamedCurve, SignatureAlgorithm, WireError};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash a decoded message as `msg_id ∥ flags ∥ body`.
///
/// The body is re-encoded from the message, so both peers hash the same
/// bytes no matter how the frame arrived.
pub fn hash_message<M: Message>(msg_flags: u8, msg: &M) -> Result<[u8; 32], WireError> {
    let mut h = blake3::Hasher::new();
    h.update(&[M::ID.into(), msg_flags]);
    h.update(&msg.to_bytes()?);
    Ok(*h.finalize().as_bytes())
}

// ── Random ────────────────────────────────────────────────────────────────────

/// `len` cryptographically random bytes.
pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut buf);
    buf
}

/// A fresh session id: 16 random bytes, hex encoded.
pub fn generate_session_id() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// A random, non-zero, single-byte nonce step.
pub fn generate_nonce_step() -> [u8; 1] {
    [rand::thread_rng().gen_range(1..=u8::MAX)]
}

// ── ECDHE ─────────────────────────────────────────────────────────────────────

/// An ephemeral key pair, used for exactly one key agreement.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate(curve: NamedCurve) -> Self {
        match curve {
            NamedCurve::X25519 => {
                let secret = EphemeralSecret::random_from_rng(OsRng);
                let public = PublicKey::from(&secret);
                Self { secret, public }
            }
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Consume the secret and agree on a shared secret with `peer_public`.
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub fn agree(self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| CryptoError::BadPublicKey(peer_public.len()))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

// ── Key schedule ──────────────────────────────────────────────────────────────

const CTX_C2S_CIPHER: &str = "gtp 2024-05 client-to-server cipher key";
const CTX_S2C_CIPHER: &str = "gtp 2024-05 server-to-client cipher key";
const CTX_C2S_MAC: &str = "gtp 2024-05 client-to-server mac key";
const CTX_S2C_MAC: &str = "gtp 2024-05 server-to-client mac key";

/// Directional keys derived from one key agreement.
pub struct SessionKeys {
    pub client_to_server_cipher: Zeroizing<[u8; 32]>,
    pub server_to_client_cipher: Zeroizing<[u8; 32]>,
    pub client_to_server_mac: Zeroizing<[u8; 32]>,
    pub server_to_client_mac: Zeroizing<[u8; 32]>,
}

/// Derive both directions' cipher and MAC keys.
///
///   ikm = shared_secret || client_random || server_random
///   key = BLAKE3-derive_key(context, ikm)   for each of four contexts
pub fn derive_session_keys(shared: &[u8; 32], client_random: &[u8], server_random: &[u8]) -> SessionKeys {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 + client_random.len() + server_random.len()));
    ikm.extend_from_slice(shared);
    ikm.extend_from_slice(client_random);
    ikm.extend_from_slice(server_random);

    SessionKeys {
        client_to_server_cipher: Zeroizing::new(blake3::derive_key(CTX_C2S_CIPHER, &ikm)),
        server_to_client_cipher: Zeroizing::new(blake3::derive_key(CTX_S2C_CIPHER, &ikm)),
        client_to_server_mac: Zeroizing::new(blake3::derive_key(CTX_C2S_MAC, &ikm)),
        server_to_client_mac: Zeroizing::new(blake3::derive_key(CTX_S2C_MAC, &ikm)),
    }
}

// ── Signatures ────────────────────────────────────────────────────────────────

/// Bytes signed over during key exchange:
///
///   cipher_suite || compression || client_random || server_random || session_id || public_key
pub fn key_exchange_transcript(
    suite: &CipherSuite,
    compression: Compression,
    client_random: &[u8],
    server_random: &[u8],
    session_id: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(6 + client_random.len() + server_random.len() + session_id.len() + public_key.len());
    t.extend_from_slice(&suite.to_bytes());
    t.push(compression.into());
    t.extend_from_slice(client_random);
    t.extend_from_slice(server_random);
    t.extend_from_slice(session_id.as_bytes());
    t.extend_from_slice(public_key);
    t
}

/// Sign `transcript` with `key`. `SignatureAlgorithm::None` yields an empty signature.
pub fn sign(algorithm: SignatureAlgorithm, key: &SigningKey, transcript: &[u8]) -> Vec<u8> {
    match algorithm {
        SignatureAlgorithm::None => Vec::new(),
        SignatureAlgorithm::Ed25519 => key.sign(transcript).to_bytes().to_vec(),
    }
}

pub fn verify(
    algorithm: SignatureAlgorithm,
    key: &VerifyingKey,
    transcript: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    match algorithm {
        SignatureAlgorithm::None => Err(CryptoError::UnsignedExchange),
        SignatureAlgorithm::Ed25519 => {
            let sig = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
            key.verify_strict(transcript, &sig).map_err(|_| CryptoError::BadSignature)
        }
    }
}

/// Parse a hex-encoded 32-byte Ed25519 private key.
pub fn signing_key_from_hex(s: &str) -> Result<SigningKey, CryptoError> {
    let bytes = Zeroizing::new(decode_key32(s)?);
    Ok(SigningKey::from_bytes(&bytes))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(&decode_key32(s)?).map_err(|_| CryptoError::BadKeyEncoding)
}

fn decode_key32(s: &str) -> Result<[u8; 32], CryptoError> {
    let raw = Zeroizing::new(hex::decode(s.trim()).map_err(|_| CryptoError::BadKeyEncoding)?);
    raw.as_slice().try_into().map_err(|_| CryptoError::BadKeyEncoding)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("peer public key must be 32 bytes, got {0}")]
    BadPublicKey(usize),

    #[error("key agreement produced a non-contributory shared secret")]
    NonContributory,

    #[error("signature verification failed")]
    BadSignature,

    #[error("key exchange carries no signature but one is required")]
    UnsignedExchange,

    #[error("key is not 32 hex-encoded bytes")]
    BadKeyEncoding,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
