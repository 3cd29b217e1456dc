//! Packet MACs, selected by hash width.
//!
//! The 32- and 64-bit CRC MACs hash `key ∥ data`. BLAKE3 runs in keyed mode.
//! Tags are always compared in constant time.

use crc_any::{CRCu32, CRCu64};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::wire::MacHash;

use super::CodecError;

enum MacKey {
    Crc32(Zeroizing<Vec<u8>>),
    Crc64(Zeroizing<Vec<u8>>),
    Blake3(Zeroizing<[u8; 32]>),
}

/// A keyed MAC for one direction.
pub struct Mac {
    key: MacKey,
}

impl Mac {
    pub fn new(hash: MacHash, key: &[u8]) -> Result<Self, CodecError> {
        let key = match hash {
            MacHash::None => return Err(CodecError::NoMacHash),
            MacHash::Crc32 => MacKey::Crc32(Zeroizing::new(key.to_vec())),
            MacHash::Crc64 => MacKey::Crc64(Zeroizing::new(key.to_vec())),
            MacHash::Blake3 => {
                let key: [u8; 32] = key
                    .try_into()
                    .map_err(|_| CodecError::InvalidKeyLength { expected: 32, got: key.len() })?;
                MacKey::Blake3(Zeroizing::new(key))
            }
        };
        Ok(Self { key })
    }

    /// Tag size in bytes.
    pub fn size(&self) -> usize {
        match self.key {
            MacKey::Crc32(_) => 4,
            MacKey::Crc64(_) => 8,
            MacKey::Blake3(_) => 32,
        }
    }

    /// Compute the tag over the concatenation of `parts`.
    pub fn compute(&self, parts: &[&[u8]]) -> Vec<u8> {
        match &self.key {
            MacKey::Crc32(key) => {
                let mut crc = CRCu32::crc32();
                crc.digest(key.as_slice());
                for part in parts {
                    crc.digest(part);
                }
                crc.get_crc().to_be_bytes().to_vec()
            }
            MacKey::Crc64(key) => {
                let mut crc = CRCu64::crc64();
                crc.digest(key.as_slice());
                for part in parts {
                    crc.digest(part);
                }
                crc.get_crc().to_be_bytes().to_vec()
            }
            MacKey::Blake3(key) => {
                let mut hasher = blake3::Hasher::new_keyed(key);
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().as_bytes().to_vec()
            }
        }
    }

    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> bool {
        self.compute(parts).ct_eq(tag).into()
    }
}
