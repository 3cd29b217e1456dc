//! Symmetric ciphers negotiated by the cipher suite.
//!
//! A [`Cipher`] holds one direction's state. The sending side only seals and
//! the receiving side only opens, so both ends of a direction advance their
//! chaining state (CBC), keystream position (CTR) or nonce (AEAD) in lockstep
//! as long as packets are processed in order.

use aes::{Aes128, Aes256};
use aes_gcm::aead::generic_array::GenericArray as AeadArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use cbc::cipher::{Block, BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit, StreamCipher};
use chacha20poly1305::ChaCha20Poly1305;
use ctr::Ctr128BE;

use crate::wire::{BlockCipherMode, CipherSuite, PaddingMode, SymmetricEncryption};

use super::nonce::NonceCounter;
use super::padding::{pad, unpad};
use super::CodecError;

/// AES block size. Also the IV size for CBC and CTR.
pub const AES_BLOCK_SIZE: usize = 16;

/// Nonce size for AES-GCM and ChaCha20-Poly1305.
pub const AEAD_NONCE_SIZE: usize = 12;

/// Sizes of the material a suite needs from the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CipherParams {
    pub key_size: usize,
    pub iv_size: usize,
    pub nonce_size: usize,
}

/// Check a suite's cipher/mode/padding combination and report what it needs.
///
/// Suites without key exchange need nothing; their remaining components are
/// ignored.
pub fn params(suite: &CipherSuite) -> Result<CipherParams, CodecError> {
    if !suite.is_encrypted() {
        return Ok(CipherParams::default());
    }

    use BlockCipherMode as M;
    use SymmetricEncryption as S;

    let key_size = match suite.symmetric {
        S::None => 0,
        S::Aes128 => 16,
        S::Aes256 | S::ChaCha20Poly1305 => 32,
    };

    match (suite.symmetric, suite.block_mode) {
        (S::None, M::None) => Ok(CipherParams::default()),
        (S::None, mode) => Err(CodecError::ModeWithoutCipher(mode)),
        (S::Aes128 | S::Aes256, M::None) => Err(CodecError::ModeRequired(suite.symmetric)),
        (S::Aes128 | S::Aes256, M::Cbc) => {
            if suite.padding == PaddingMode::None {
                return Err(CodecError::PaddingRequired(M::Cbc));
            }
            Ok(CipherParams { key_size, iv_size: AES_BLOCK_SIZE, nonce_size: 0 })
        }
        (S::Aes128 | S::Aes256, M::Ctr) => Ok(CipherParams { key_size, iv_size: AES_BLOCK_SIZE, nonce_size: 0 }),
        (S::Aes128 | S::Aes256, M::Gcm) => Ok(CipherParams { key_size, iv_size: 0, nonce_size: AEAD_NONCE_SIZE }),
        (S::ChaCha20Poly1305, M::None) => {
            if suite.padding != PaddingMode::None {
                return Err(CodecError::NoFixedBlockSize);
            }
            Ok(CipherParams { key_size, iv_size: 0, nonce_size: AEAD_NONCE_SIZE })
        }
        (S::ChaCha20Poly1305, _) => Err(CodecError::NoFixedBlockSize),
    }
}

enum Kind {
    Cbc128(cbc::Encryptor<Aes128>, cbc::Decryptor<Aes128>),
    Cbc256(cbc::Encryptor<Aes256>, cbc::Decryptor<Aes256>),
    Ctr128(Ctr128BE<Aes128>, Ctr128BE<Aes128>),
    Ctr256(Ctr128BE<Aes256>, Ctr128BE<Aes256>),
    Gcm128(Box<Aes128Gcm>, NonceCounter, NonceCounter),
    Gcm256(Box<Aes256Gcm>, NonceCounter, NonceCounter),
    ChaCha(Box<ChaCha20Poly1305>, NonceCounter, NonceCounter),
}

/// One direction's symmetric cipher.
pub struct Cipher {
    kind: Kind,
    padding: PaddingMode,
}

impl Cipher {
    /// Build the cipher for `suite`. Returns `Ok(None)` when the suite has
    /// no symmetric cipher.
    pub fn new(
        suite: &CipherSuite,
        key: &[u8],
        iv: &[u8],
        nonce: &[u8],
        nonce_step: &[u8],
    ) -> Result<Option<Self>, CodecError> {
        let p = params(suite)?;
        if p.key_size == 0 {
            return Ok(None);
        }
        if key.len() < p.key_size {
            return Err(CodecError::InvalidKeyLength { expected: p.key_size, got: key.len() });
        }
        if iv.len() != p.iv_size {
            return Err(CodecError::InvalidIvLength { expected: p.iv_size, got: iv.len() });
        }
        if nonce.len() != p.nonce_size {
            return Err(CodecError::InvalidNonceLength { expected: p.nonce_size, got: nonce.len() });
        }
        let key = &key[..p.key_size];
        let bad_key = |_| CodecError::InvalidKeyLength { expected: p.key_size, got: key.len() };

        use BlockCipherMode as M;
        use SymmetricEncryption as S;

        let kind = match (suite.symmetric, suite.block_mode) {
            (S::Aes128, M::Cbc) => Kind::Cbc128(
                cbc::Encryptor::new_from_slices(key, iv).map_err(bad_key)?,
                cbc::Decryptor::new_from_slices(key, iv).map_err(bad_key)?,
            ),
            (S::Aes256, M::Cbc) => Kind::Cbc256(
                cbc::Encryptor::new_from_slices(key, iv).map_err(bad_key)?,
                cbc::Decryptor::new_from_slices(key, iv).map_err(bad_key)?,
            ),
            (S::Aes128, M::Ctr) => Kind::Ctr128(
                Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?,
                Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?,
            ),
            (S::Aes256, M::Ctr) => Kind::Ctr256(
                Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?,
                Ctr128BE::new_from_slices(key, iv).map_err(bad_key)?,
            ),
            (S::Aes128, M::Gcm) => Kind::Gcm128(
                Box::new(Aes128Gcm::new_from_slice(key).map_err(bad_key)?),
                NonceCounter::new(nonce, nonce_step)?,
                NonceCounter::new(nonce, nonce_step)?,
            ),
            (S::Aes256, M::Gcm) => Kind::Gcm256(
                Box::new(Aes256Gcm::new_from_slice(key).map_err(bad_key)?),
                NonceCounter::new(nonce, nonce_step)?,
                NonceCounter::new(nonce, nonce_step)?,
            ),
            (S::ChaCha20Poly1305, _) => Kind::ChaCha(
                Box::new(ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?),
                NonceCounter::new(nonce, nonce_step)?,
                NonceCounter::new(nonce, nonce_step)?,
            ),
            // params() has rejected every other combination
            _ => return Err(CodecError::ModeRequired(suite.symmetric)),
        };

        Ok(Some(Self { kind, padding: suite.padding }))
    }

    /// Encrypt `plaintext`, padding first when the suite asks for it.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut buf = plaintext.to_vec();
        match &mut self.kind {
            Kind::Cbc128(enc, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                cbc_encrypt(enc, &mut buf)?;
            }
            Kind::Cbc256(enc, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                cbc_encrypt(enc, &mut buf)?;
            }
            Kind::Ctr128(enc, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                enc.apply_keystream(&mut buf);
            }
            Kind::Ctr256(enc, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                enc.apply_keystream(&mut buf);
            }
            Kind::Gcm128(aead, nonce, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                buf = aead_seal(aead.as_ref(), nonce, &buf)?;
            }
            Kind::Gcm256(aead, nonce, _) => {
                pad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
                buf = aead_seal(aead.as_ref(), nonce, &buf)?;
            }
            Kind::ChaCha(aead, nonce, _) => {
                buf = aead_seal(aead.as_ref(), nonce, &buf)?;
            }
        }
        Ok(buf)
    }

    /// Decrypt `ciphertext` and strip padding.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut buf = match &mut self.kind {
            Kind::Cbc128(_, dec) => cbc_decrypt(dec, ciphertext)?,
            Kind::Cbc256(_, dec) => cbc_decrypt(dec, ciphertext)?,
            Kind::Ctr128(_, dec) => {
                let mut buf = ciphertext.to_vec();
                dec.apply_keystream(&mut buf);
                buf
            }
            Kind::Ctr256(_, dec) => {
                let mut buf = ciphertext.to_vec();
                dec.apply_keystream(&mut buf);
                buf
            }
            Kind::Gcm128(aead, _, nonce) => aead_open(aead.as_ref(), nonce, ciphertext)?,
            Kind::Gcm256(aead, _, nonce) => aead_open(aead.as_ref(), nonce, ciphertext)?,
            Kind::ChaCha(aead, _, nonce) => return aead_open(aead.as_ref(), nonce, ciphertext),
        };
        unpad(self.padding, &mut buf, AES_BLOCK_SIZE)?;
        Ok(buf)
    }
}

fn cbc_encrypt<C: BlockEncryptMut>(enc: &mut C, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut blocks = to_blocks::<C>(buf)?;
    enc.encrypt_blocks_mut(&mut blocks);
    *buf = blocks.iter().flat_map(|b| b.iter().copied()).collect();
    Ok(())
}

fn cbc_decrypt<C: BlockDecryptMut>(dec: &mut C, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    if ciphertext.is_empty() {
        return Err(CodecError::BlockAlignment(0));
    }
    let mut blocks = to_blocks::<C>(ciphertext)?;
    dec.decrypt_blocks_mut(&mut blocks);
    Ok(blocks.iter().flat_map(|b| b.iter().copied()).collect())
}

fn to_blocks<C: BlockSizeUser>(data: &[u8]) -> Result<Vec<Block<C>>, CodecError> {
    let size = C::block_size();
    if data.len() % size != 0 {
        return Err(CodecError::BlockAlignment(data.len()));
    }
    Ok(data.chunks_exact(size).map(Block::<C>::clone_from_slice).collect())
}

fn aead_seal<A: Aead>(aead: &A, nonce: &mut NonceCounter, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let out = aead
        .encrypt(AeadArray::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CodecError::Encrypt);
    nonce.advance();
    out
}

fn aead_open<A: Aead>(aead: &A, nonce: &mut NonceCounter, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
    let out = aead
        .decrypt(AeadArray::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CodecError::Decrypt);
    nonce.advance();
    out
}
