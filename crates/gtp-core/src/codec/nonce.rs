//! Big-endian nonce counter for AEAD ciphers.
//!
//! Both peers start from the nonce and step exchanged in the key exchange
//! and advance once per seal/open. The wrap rule is part of the protocol:
//! when `nonce + step` needs more bits than the nonce buffer holds, the
//! nonce becomes all zeroes rather than wrapping modulo 2^bits.

use zeroize::Zeroizing;

use super::CodecError;

/// A nonce that advances by a fixed step.
pub struct NonceCounter {
    value: Zeroizing<Vec<u8>>,
    step: Vec<u8>,
}

impl NonceCounter {
    pub fn new(nonce: &[u8], step: &[u8]) -> Result<Self, CodecError> {
        if nonce.is_empty() {
            return Err(CodecError::InvalidNonceLength { expected: 1, got: 0 });
        }
        Ok(Self {
            value: Zeroizing::new(nonce.to_vec()),
            step: step.to_vec(),
        })
    }

    /// Current nonce.
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Advance by the configured step.
    pub fn advance(&mut self) {
        advance_nonce(&mut self.value, &self.step);
    }
}

/// Add `step` to `nonce` as big-endian integers, in place.
///
/// If the sum does not fit in `nonce.len()` bytes the nonce is reset to
/// all zeroes.
pub fn advance_nonce(nonce: &mut [u8], step: &[u8]) {
    let n = nonce.len();
    let s = step.len();
    let mut carry = 0u16;
    let mut overflow = false;

    for i in 0..n.max(s) {
        let a = if i < n { nonce[n - 1 - i] as u16 } else { 0 };
        let b = if i < s { step[s - 1 - i] as u16 } else { 0 };
        let sum = a + b + carry;
        carry = sum >> 8;
        if i < n {
            nonce[n - 1 - i] = sum as u8;
        } else if sum & 0xff != 0 {
            overflow = true;
        }
    }

    if overflow || carry != 0 {
        nonce.iter_mut().for_each(|b| *b = 0);
    }
}
