//! Codec and crypto modules negotiated per session.
//!
//! Compression, symmetric ciphers, MACs, padding and nonce counters are the
//! building blocks; [`Encoder`] and [`Decoder`] chain them into the packet
//! pipeline.

pub mod cipher;
pub mod compression;
pub mod mac;
pub mod nonce;
pub mod padding;
pub mod packet;

pub use cipher::{params, Cipher, CipherParams};
pub use compression::{Compressor, DEFAULT_THRESHOLD};
pub use mac::Mac;
pub use nonce::NonceCounter;
pub use packet::{CipherMaterial, Decoder, Encoder, Packet};

use thiserror::Error;

use crate::wire::{BlockCipherMode, SymmetricEncryption, WireError};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("cipher {0} requires a block cipher mode")]
    ModeRequired(SymmetricEncryption),

    #[error("block cipher mode {0} set without a symmetric cipher")]
    ModeWithoutCipher(BlockCipherMode),

    #[error("block cipher mode {0} requires padding")]
    PaddingRequired(BlockCipherMode),

    #[error("cipher has no fixed block size")]
    NoFixedBlockSize,

    #[error("mac hash none cannot build a MAC")]
    NoMacHash,

    #[error("encrypted suite built without key material")]
    MissingKeyMaterial,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid IV length: expected {expected}, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },

    #[error("bad padding")]
    BadPadding,

    #[error("{0} bytes is not a multiple of the block size")]
    BlockAlignment(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("MAC mismatch")]
    MacMismatch,

    #[error("packet flag 0x{0:02x} not supported by this decoder")]
    UnsupportedFlag(u8),

    #[error("packet is missing required flag 0x{0:02x}")]
    MissingFlag(u8),

    #[error("packet length mismatch: head says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("decompressed body exceeds {0} bytes")]
    DecompressedTooLarge(usize),

    #[error("compression: {0}")]
    Compression(#[from] std::io::Error),
}
