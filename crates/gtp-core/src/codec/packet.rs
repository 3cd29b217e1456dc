//! Packet encoder and decoder: the negotiated transform pipeline.
//!
//! Encode: body → compress → append MAC → encrypt → prepend head.
//! Decode runs the same steps in reverse. The MAC covers
//! `msg_id ∥ flags ∥ seq ∥ ack ∥ body` where `flags` are the final packet
//! flags, so a peer cannot strip the Compressed bit without failing the MAC.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::AsBytes;

use crate::wire::{flags, CipherSuite, Compression, Message, MsgId, PacketHead, HEAD_SIZE, MAX_PACKET_LEN};

use super::cipher::Cipher;
use super::compression::{decompress, Compressor};
use super::mac::Mac;
use super::CodecError;

/// Keys and counters from the key exchange for one direction.
pub struct CipherMaterial<'a> {
    pub cipher_key: &'a [u8],
    pub mac_key: &'a [u8],
    pub iv: &'a [u8],
    pub nonce: &'a [u8],
    pub nonce_step: &'a [u8],
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_id: MsgId,
    /// Full flag byte, message and pipeline bits.
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub body: Bytes,
}

impl Packet {
    /// Decode the body as `M`, checking the message id first.
    pub fn message<M: Message>(&self) -> Result<M, CodecError> {
        if self.msg_id != M::ID {
            return Err(crate::wire::WireError::UnexpectedMessage {
                expected: M::ID.into(),
                got: self.msg_id.into(),
            }
            .into());
        }
        let mut body = self.body.clone();
        Ok(M::decode(&mut body)?)
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn mac_parts<'a>(id: &'a [u8; 2], seq: &'a [u8; 4], ack: &'a [u8; 4], body: &'a [u8]) -> [&'a [u8]; 4] {
    [id, seq, ack, body]
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Outbound half of the pipeline.
pub struct Encoder {
    cipher: Option<Cipher>,
    mac: Option<Mac>,
    compressor: Option<Compressor>,
}

impl Encoder {
    /// An encoder that only frames packets.
    pub fn plain() -> Self {
        Self { cipher: None, mac: None, compressor: None }
    }

    /// Build the encoder for a negotiated suite.
    ///
    /// `material` is required when the suite uses key exchange and ignored
    /// otherwise.
    pub fn build(
        suite: &CipherSuite,
        material: Option<&CipherMaterial<'_>>,
        compression: Compression,
        threshold: usize,
    ) -> Result<Self, CodecError> {
        let (cipher, mac) = build_crypto(suite, material)?;
        let compressor = (compression != Compression::None).then(|| Compressor::new(compression, threshold));
        Ok(Self { cipher, mac, compressor })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a standalone value with this direction's cipher, outside of
    /// any packet. Without a cipher the value is returned as is.
    pub fn seal(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.cipher.as_mut() {
            Some(cipher) => cipher.seal(data),
            None => Ok(data.to_vec()),
        }
    }

    /// Run `body` through the pipeline and frame it.
    pub fn encode(&mut self, msg_id: MsgId, msg_flags: u8, seq: u32, ack: u32, body: &[u8]) -> Result<Bytes, CodecError> {
        let mut flags = msg_flags & !flags::CODEC_MASK;
        let mut body = match self.compressor.as_ref().map(|c| c.compress(body)).transpose()?.flatten() {
            Some(packed) => {
                flags |= flags::COMPRESSED;
                packed
            }
            None => body.to_vec(),
        };
        if self.mac.is_some() {
            flags |= flags::MAC;
        }
        if self.cipher.is_some() {
            flags |= flags::ENCRYPTED;
        }

        let id: u8 = msg_id.into();
        if let Some(mac) = &self.mac {
            let tag = mac.compute(&mac_parts(&[id, flags], &seq.to_be_bytes(), &ack.to_be_bytes(), &body));
            body.extend_from_slice(&tag);
        }
        if let Some(cipher) = self.cipher.as_mut() {
            body = cipher.seal(&body)?;
        }

        let head = PacketHead::new(id, flags, seq, ack, body.len())?;
        let mut out = BytesMut::with_capacity(HEAD_SIZE + body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    pub fn encode_message<M: Message>(&mut self, msg_flags: u8, seq: u32, ack: u32, msg: &M) -> Result<Bytes, CodecError> {
        self.encode(M::ID, msg_flags, seq, ack, &msg.to_bytes()?)
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Inbound half of the pipeline.
pub struct Decoder {
    cipher: Option<Cipher>,
    mac: Option<Mac>,
    compression: Compression,
}

impl Decoder {
    pub fn plain() -> Self {
        Self { cipher: None, mac: None, compression: Compression::None }
    }

    pub fn build(
        suite: &CipherSuite,
        material: Option<&CipherMaterial<'_>>,
        compression: Compression,
    ) -> Result<Self, CodecError> {
        let (cipher, mac) = build_crypto(suite, material)?;
        Ok(Self { cipher, mac, compression })
    }

    /// Decrypt a standalone value sealed by the peer's [`Encoder::seal`].
    pub fn open(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.cipher.as_mut() {
            Some(cipher) => cipher.open(data),
            None => Ok(data.to_vec()),
        }
    }

    /// Parse, authenticate and decrypt one complete packet.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Packet, CodecError> {
        let head = PacketHead::parse(packet)?;
        if head.packet_len() != packet.len() {
            return Err(CodecError::LengthMismatch { declared: head.packet_len(), actual: packet.len() });
        }
        let msg_id = MsgId::try_from(head.msg_id)?;
        let flags = head.flags;
        let seq = head.seq.get();
        let ack = head.ack.get();
        let mut body = packet[HEAD_SIZE..].to_vec();

        match (flags & flags::ENCRYPTED != 0, self.cipher.as_mut()) {
            (true, Some(cipher)) => body = cipher.open(&body)?,
            (true, None) => return Err(CodecError::UnsupportedFlag(flags::ENCRYPTED)),
            (false, Some(_)) => return Err(CodecError::MissingFlag(flags::ENCRYPTED)),
            (false, None) => {}
        }

        match (flags & flags::MAC != 0, &self.mac) {
            (true, Some(mac)) => {
                let split = body.len().checked_sub(mac.size()).ok_or(CodecError::MacMismatch)?;
                let (data, tag) = body.split_at(split);
                if !mac.verify(&mac_parts(&[head.msg_id, flags], &seq.to_be_bytes(), &ack.to_be_bytes(), data), tag) {
                    return Err(CodecError::MacMismatch);
                }
                body.truncate(split);
            }
            (true, None) => return Err(CodecError::UnsupportedFlag(flags::MAC)),
            (false, Some(_)) => return Err(CodecError::MissingFlag(flags::MAC)),
            (false, None) => {}
        }

        if flags & flags::COMPRESSED != 0 {
            body = decompress(self.compression, &body, MAX_PACKET_LEN)?;
        }

        Ok(Packet { msg_id, flags, seq, ack, body: Bytes::from(body) })
    }
}

fn build_crypto(
    suite: &CipherSuite,
    material: Option<&CipherMaterial<'_>>,
) -> Result<(Option<Cipher>, Option<Mac>), CodecError> {
    if !suite.is_encrypted() {
        return Ok((None, None));
    }
    let m = material.ok_or(CodecError::MissingKeyMaterial)?;
    let cipher = Cipher::new(suite, m.cipher_key, m.iv, m.nonce, m.nonce_step)?;
    let mac = match suite.mac {
        crate::wire::MacHash::None => None,
        hash => Some(Mac::new(hash, m.mac_key)?),
    };
    Ok((cipher, mac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{BlockCipherMode, KeyExchange, MacHash, PaddingMode, Payload, SymmetricEncryption};

    const KEY: [u8; 32] = [0x11; 32];
    const MAC_KEY: [u8; 32] = [0x22; 32];

    fn material<'a>(iv: &'a [u8], nonce: &'a [u8]) -> CipherMaterial<'a> {
        CipherMaterial { cipher_key: &KEY, mac_key: &MAC_KEY, iv, nonce, nonce_step: &[1] }
    }

    fn gcm_suite() -> CipherSuite {
        CipherSuite {
            key_exchange: KeyExchange::Ecdhe,
            symmetric: SymmetricEncryption::Aes256,
            block_mode: BlockCipherMode::Gcm,
            padding: PaddingMode::None,
            mac: MacHash::Crc32,
        }
    }

    #[test]
    fn plain_codec_frames_only() {
        let mut enc = Encoder::plain();
        let mut dec = Decoder::plain();
        let pkt = enc.encode(MsgId::Payload, flags::SEQUENCED, 3, 1, b"abc").unwrap();
        assert_eq!(pkt.len(), HEAD_SIZE + 3);
        let decoded = dec.decode(&pkt).unwrap();
        assert_eq!(decoded.msg_id, MsgId::Payload);
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.ack, 1);
        assert!(decoded.has_flag(flags::SEQUENCED));
        assert_eq!(&decoded.body[..], b"abc");
    }

    #[test]
    fn full_pipeline_sets_flags() {
        let nonce = [5u8; 12];
        let mut enc = Encoder::build(&gcm_suite(), Some(&material(&[], &nonce)), Compression::Zstd, 16).unwrap();
        let mut dec = Decoder::build(&gcm_suite(), Some(&material(&[], &nonce)), Compression::Zstd).unwrap();

        let body = vec![b'z'; 2048];
        let pkt = enc.encode(MsgId::Custom(40), 0x03, 9, 2, &body).unwrap();
        assert!(pkt.len() < body.len());

        let decoded = dec.decode(&pkt).unwrap();
        assert!(decoded.has_flag(flags::COMPRESSED));
        assert!(decoded.has_flag(flags::MAC));
        assert!(decoded.has_flag(flags::ENCRYPTED));
        assert_eq!(decoded.flags & flags::MESSAGE_MASK, 0x03);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn mac_only_suite_detects_tampering() {
        let suite = CipherSuite {
            symmetric: SymmetricEncryption::None,
            block_mode: BlockCipherMode::None,
            mac: MacHash::Blake3,
            ..gcm_suite()
        };
        let mut enc = Encoder::build(&suite, Some(&material(&[], &[])), Compression::None, 0).unwrap();
        let mut dec = Decoder::build(&suite, Some(&material(&[], &[])), Compression::None).unwrap();

        let pkt = enc.encode_message(0, 0, 0, &Payload { data: Bytes::from_static(b"hi") }).unwrap();
        let mut bad = pkt.to_vec();
        bad[HEAD_SIZE] ^= 0xff;
        assert!(matches!(dec.decode(&bad), Err(CodecError::MacMismatch)));
    }

    #[test]
    fn downgrade_to_plain_rejected() {
        let nonce = [5u8; 12];
        let mut dec = Decoder::build(&gcm_suite(), Some(&material(&[], &nonce)), Compression::None).unwrap();
        let pkt = Encoder::plain().encode(MsgId::Payload, 0, 0, 0, b"x").unwrap();
        assert!(matches!(dec.decode(&pkt), Err(CodecError::MissingFlag(flags::ENCRYPTED))));

        let enc_pkt = Encoder::build(&gcm_suite(), Some(&material(&[], &nonce)), Compression::None, 0)
            .unwrap()
            .encode(MsgId::Payload, 0, 0, 0, b"x")
            .unwrap();
        assert!(matches!(
            Decoder::plain().decode(&enc_pkt),
            Err(CodecError::UnsupportedFlag(flags::ENCRYPTED))
        ));
    }

    #[test]
    fn length_mismatch_rejected() {
        let pkt = Encoder::plain().encode(MsgId::Payload, 0, 0, 0, b"abcd").unwrap();
        assert!(matches!(
            Decoder::plain().decode(&pkt[..pkt.len() - 1]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn wrong_message_type_reported() {
        let pkt = Encoder::plain().encode(MsgId::Heartbeat, flags::HEARTBEAT_PING, 0, 0, &[]).unwrap();
        let decoded = Decoder::plain().decode(&pkt).unwrap();
        assert!(decoded.message::<Payload>().is_err());
        assert!(decoded.message::<crate::wire::Heartbeat>().is_ok());
    }

    #[test]
    fn encrypted_suite_without_keys_fails() {
        assert!(matches!(
            Encoder::build(&gcm_suite(), None, Compression::None, 0),
            Err(CodecError::MissingKeyMaterial)
        ));
    }
}
