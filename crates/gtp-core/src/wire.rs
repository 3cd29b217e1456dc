//! GTP wire format — packet head, message bodies and negotiated parameters.
//!
//! These types ARE the protocol. Every field, every size, every reserved byte
//! is part of the wire format. Changing anything here is a breaking change
//! and must come with a new PROTOCOL_VERSION.
//!
//! The packet head is a fixed 16-byte zerocopy struct with big-endian fields.
//! Message bodies are variable length and written with `bytes`: integers are
//! big-endian, strings and byte strings carry a length prefix.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Protocol version carried in Hello. Peers must match exactly.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Size of the packet head in bytes.
pub const HEAD_SIZE: usize = 16;

/// Largest packet (head included) accepted from or sent to a peer.
pub const MAX_PACKET_LEN: usize = 4 * 1024 * 1024;

/// First message id available for application-defined events.
pub const MSG_CUSTOMIZE: u8 = 32;

/// Size of the client and server random values exchanged in Hello.
pub const RANDOM_SIZE: usize = 32;

/// Packet and message flag bits.
///
/// Bits 0-3 belong to the message type, bits 4-7 to the packet pipeline.
pub mod flags {
    /// Packet occupies a sequence number and must be acknowledged.
    pub const SEQUENCED: u8 = 0x10;
    /// Body carries a trailing MAC.
    pub const MAC: u8 = 0x20;
    /// Body (and MAC) is encrypted.
    pub const ENCRYPTED: u8 = 0x40;
    /// Body was compressed before MAC/encryption.
    pub const COMPRESSED: u8 = 0x80;
    /// Bits owned by the codec pipeline.
    pub const CODEC_MASK: u8 = MAC | ENCRYPTED | COMPRESSED;
    /// Bits owned by the message type.
    pub const MESSAGE_MASK: u8 = 0x0f;

    pub const HELLO_CONTINUE: u8 = 0x01;
    pub const HELLO_ENCRYPTION: u8 = 0x02;
    pub const HELLO_AUTH: u8 = 0x04;
    pub const HELLO_DONE: u8 = 0x08;

    pub const ECDHE_SIGNATURE: u8 = 0x01;

    pub const CCS_VERIFY_ENCRYPTION: u8 = 0x01;

    pub const FINISHED_ENCRYPT_OK: u8 = 0x01;
    pub const FINISHED_AUTH_OK: u8 = 0x02;
    pub const FINISHED_CONTINUE_OK: u8 = 0x04;

    pub const HEARTBEAT_PING: u8 = 0x01;
    pub const HEARTBEAT_PONG: u8 = 0x02;
}

// ── Packet Head ───────────────────────────────────────────────────────────────

/// Fixed head in front of every packet.
///
/// `len` covers the whole packet including this head, so a stream reader can
/// frame packets from the first four bytes alone.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHead {
    /// Total packet length in bytes, head included.
    pub len: U32<BigEndian>,
    /// Message type. See [`MsgId`].
    pub msg_id: u8,
    /// Message flags (low nibble) and pipeline flags (high nibble).
    pub flags: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Sequence number. Meaningful only when `flags::SEQUENCED` is set.
    pub seq: U32<BigEndian>,
    /// Next sequence number the sender expects from its peer.
    pub ack: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHead, [u8; HEAD_SIZE]);

impl PacketHead {
    /// Build a head for a body of `body_len` bytes.
    pub fn new(msg_id: u8, flags: u8, seq: u32, ack: u32, body_len: usize) -> Result<Self, WireError> {
        let len = HEAD_SIZE + body_len;
        if len > MAX_PACKET_LEN {
            return Err(WireError::PacketTooLarge(len));
        }
        Ok(Self {
            len: U32::new(len as u32),
            msg_id,
            flags,
            reserved: [0u8; 2],
            seq: U32::new(seq),
            ack: U32::new(ack),
        })
    }

    /// Parse and validate the head at the front of `packet`.
    pub fn parse(packet: &[u8]) -> Result<Self, WireError> {
        let head = PacketHead::read_from_prefix(packet).ok_or(WireError::Truncated("packet head"))?;
        let len = head.packet_len();
        if len < HEAD_SIZE {
            return Err(WireError::Truncated("packet length"));
        }
        if len > MAX_PACKET_LEN {
            return Err(WireError::PacketTooLarge(len));
        }
        if head.reserved != [0u8; 2] {
            return Err(WireError::ReservedBitsSet);
        }
        Ok(head)
    }

    /// Total packet length, head included.
    pub fn packet_len(&self) -> usize {
        self.len.get() as usize
    }
}

// ── Message Ids ───────────────────────────────────────────────────────────────

/// Message type carried in the packet head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
    Hello,
    EcdheSecretKeyExchange,
    ChangeCipherSpec,
    Auth,
    Continue,
    Finished,
    Rst,
    Heartbeat,
    Payload,
    /// Application-defined event, id >= MSG_CUSTOMIZE.
    Custom(u8),
}

impl TryFrom<u8> for MsgId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgId::Hello),
            2 => Ok(MsgId::EcdheSecretKeyExchange),
            3 => Ok(MsgId::ChangeCipherSpec),
            4 => Ok(MsgId::Auth),
            5 => Ok(MsgId::Continue),
            6 => Ok(MsgId::Finished),
            7 => Ok(MsgId::Rst),
            8 => Ok(MsgId::Heartbeat),
            9 => Ok(MsgId::Payload),
            v if v >= MSG_CUSTOMIZE => Ok(MsgId::Custom(v)),
            other => Err(WireError::UnknownValue { kind: "message id", value: other }),
        }
    }
}

impl From<MsgId> for u8 {
    fn from(id: MsgId) -> u8 {
        match id {
            MsgId::Hello => 1,
            MsgId::EcdheSecretKeyExchange => 2,
            MsgId::ChangeCipherSpec => 3,
            MsgId::Auth => 4,
            MsgId::Continue => 5,
            MsgId::Finished => 6,
            MsgId::Rst => 7,
            MsgId::Heartbeat => 8,
            MsgId::Payload => 9,
            MsgId::Custom(v) => v,
        }
    }
}

// ── Negotiated Parameters ─────────────────────────────────────────────────────

/// Declares a one-byte wire enum with `TryFrom<u8>`, `Into<u8>`, serde names
/// and a `Display` matching the serde name.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant = $value ),+
        }

        impl TryFrom<u8> for $name {
            type Error = WireError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $value => Ok(Self::$variant), )+
                    other => Err(WireError::UnknownValue { kind: $kind, value: other }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                v as u8
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self { $( Self::$variant => $text, )+ })
            }
        }
    };
}

wire_enum! {
    /// Key exchange method. `None` disables encryption for the session.
    pub enum KeyExchange ("key exchange") {
        None = 0 => "none",
        Ecdhe = 1 => "ecdhe",
    }
}

wire_enum! {
    /// Symmetric cipher used after key exchange.
    pub enum SymmetricEncryption ("symmetric encryption") {
        None = 0 => "none",
        Aes128 = 1 => "aes-128",
        Aes256 = 2 => "aes-256",
        /// AEAD with an intrinsic 12-byte nonce; takes no block mode.
        ChaCha20Poly1305 = 3 => "chacha20-poly1305",
    }
}

wire_enum! {
    /// Block cipher mode of operation.
    pub enum BlockCipherMode ("block cipher mode") {
        None = 0 => "none",
        Cbc = 1 => "cbc",
        Ctr = 2 => "ctr",
        Gcm = 3 => "gcm",
    }
}

wire_enum! {
    /// Padding applied before block-aligned encryption.
    pub enum PaddingMode ("padding mode") {
        None = 0 => "none",
        Pkcs7 = 1 => "pkcs7",
        X923 = 2 => "x923",
    }
}

wire_enum! {
    /// Hash backing the packet MAC, by output width.
    pub enum MacHash ("mac hash") {
        None = 0 => "none",
        /// 32-bit.
        Crc32 = 1 => "crc32",
        /// 64-bit.
        Crc64 = 2 => "crc64",
        /// Keyed, 256-bit.
        Blake3 = 3 => "blake3",
    }
}

wire_enum! {
    /// Body compression.
    pub enum Compression ("compression") {
        None = 0 => "none",
        Gzip = 1 => "gzip",
        Deflate = 2 => "deflate",
        Zstd = 3 => "zstd",
    }
}

wire_enum! {
    /// Curve used for the ephemeral ECDH key pair.
    pub enum NamedCurve ("named curve") {
        X25519 = 1 => "x25519",
    }
}

wire_enum! {
    /// Signature over the key exchange transcript.
    pub enum SignatureAlgorithm ("signature algorithm") {
        None = 0 => "none",
        Ed25519 = 1 => "ed25519",
    }
}

wire_enum! {
    /// Machine-readable reason carried by Rst.
    pub enum RstCode ("reset code") {
        Unspecified = 0 => "unspecified",
        VersionError = 1 => "version-error",
        ServerInternalError = 2 => "server-internal-error",
        SessionNotFound = 3 => "session-not-found",
        EncryptFailed = 4 => "encrypt-failed",
        AuthFailed = 5 => "auth-failed",
        ContinueFailed = 6 => "continue-failed",
        Shutdown = 7 => "shutdown",
        SessionDeath = 8 => "session-death",
    }
}

/// The negotiated tuple of algorithms. Immutable for a session's lifetime.
///
/// Wire size: 5 bytes, one per component in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CipherSuite {
    pub key_exchange: KeyExchange,
    pub symmetric: SymmetricEncryption,
    pub block_mode: BlockCipherMode,
    pub padding: PaddingMode,
    pub mac: MacHash,
}

impl CipherSuite {
    /// No key exchange, no encryption, no MAC.
    pub const NONE: CipherSuite = CipherSuite {
        key_exchange: KeyExchange::None,
        symmetric: SymmetricEncryption::None,
        block_mode: BlockCipherMode::None,
        padding: PaddingMode::None,
        mac: MacHash::None,
    };

    /// Whether this suite requires the key exchange step.
    pub fn is_encrypted(&self) -> bool {
        self.key_exchange != KeyExchange::None
    }

    pub fn to_bytes(&self) -> [u8; 5] {
        [
            self.key_exchange.into(),
            self.symmetric.into(),
            self.block_mode.into(),
            self.padding.into(),
            self.mac.into(),
        ]
    }

    pub fn from_bytes(bytes: [u8; 5]) -> Result<Self, WireError> {
        Ok(Self {
            key_exchange: KeyExchange::try_from(bytes[0])?,
            symmetric: SymmetricEncryption::try_from(bytes[1])?,
            block_mode: BlockCipherMode::try_from(bytes[2])?,
            padding: PaddingMode::try_from(bytes[3])?,
            mac: MacHash::try_from(bytes[4])?,
        })
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self {
            key_exchange: KeyExchange::Ecdhe,
            symmetric: SymmetricEncryption::Aes256,
            block_mode: BlockCipherMode::Cbc,
            padding: PaddingMode::Pkcs7,
            mac: MacHash::Blake3,
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.key_exchange, self.symmetric, self.block_mode, self.padding, self.mac
        )
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// A message body with a fixed message id.
pub trait Message: Sized {
    const ID: MsgId;

    /// Fails if a length-prefixed field does not fit its prefix.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError>;

    fn decode(buf: &mut Bytes) -> Result<Self, WireError>;

    fn to_bytes(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Client proposal or server decision opening every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    /// Empty on a fresh client Hello. Set to resume, and always set by the server.
    pub session_id: String,
    pub random: Bytes,
    pub cipher_suite: CipherSuite,
    pub compression: Compression,
}

impl Message for Hello {
    const ID: MsgId = MsgId::Hello;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u16(self.version);
        put_string16(buf, &self.session_id, "hello.session_id")?;
        put_bytes16(buf, &self.random, "hello.random")?;
        buf.put_slice(&self.cipher_suite.to_bytes());
        buf.put_u8(self.compression.into());
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let version = get_u16(buf, "hello.version")?;
        let session_id = get_string16(buf, "hello.session_id")?;
        let random = get_bytes16(buf, "hello.random")?;
        let mut suite = [0u8; 5];
        if buf.remaining() < suite.len() {
            return Err(WireError::Truncated("hello.cipher_suite"));
        }
        buf.copy_to_slice(&mut suite);
        let compression = Compression::try_from(get_u8(buf, "hello.compression")?)?;
        Ok(Self {
            version,
            session_id,
            random,
            cipher_suite: CipherSuite::from_bytes(suite)?,
            compression,
        })
    }
}

/// Ephemeral ECDH parameters, sent by the server and answered by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdheSecretKeyExchange {
    pub named_curve: NamedCurve,
    pub public_key: Bytes,
    pub iv: Bytes,
    pub nonce: Bytes,
    pub nonce_step: Bytes,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Bytes,
}

impl Message for EcdheSecretKeyExchange {
    const ID: MsgId = MsgId::EcdheSecretKeyExchange;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(self.named_curve.into());
        put_bytes16(buf, &self.public_key, "ecdhe.public_key")?;
        put_bytes16(buf, &self.iv, "ecdhe.iv")?;
        put_bytes16(buf, &self.nonce, "ecdhe.nonce")?;
        put_bytes16(buf, &self.nonce_step, "ecdhe.nonce_step")?;
        buf.put_u8(self.signature_algorithm.into());
        put_bytes16(buf, &self.signature, "ecdhe.signature")?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            named_curve: NamedCurve::try_from(get_u8(buf, "ecdhe.named_curve")?)?,
            public_key: get_bytes16(buf, "ecdhe.public_key")?,
            iv: get_bytes16(buf, "ecdhe.iv")?,
            nonce: get_bytes16(buf, "ecdhe.nonce")?,
            nonce_step: get_bytes16(buf, "ecdhe.nonce_step")?,
            signature_algorithm: SignatureAlgorithm::try_from(get_u8(buf, "ecdhe.signature_algorithm")?)?,
            signature: get_bytes16(buf, "ecdhe.signature")?,
        })
    }
}

/// Proof that the freshly derived cipher works: the sender's Hello hash,
/// encrypted with its send-direction cipher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCipherSpec {
    pub encrypted_hello_hash: Bytes,
}

impl Message for ChangeCipherSpec {
    const ID: MsgId = MsgId::ChangeCipherSpec;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        put_bytes16(buf, &self.encrypted_hello_hash, "ccs.encrypted_hello_hash")?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            encrypted_hello_hash: get_bytes16(buf, "ccs.encrypted_hello_hash")?,
        })
    }
}

/// Client credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub user_id: String,
    pub token: String,
    pub extensions: Bytes,
}

impl Message for Auth {
    const ID: MsgId = MsgId::Auth;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        put_string16(buf, &self.user_id, "auth.user_id")?;
        put_string16(buf, &self.token, "auth.token")?;
        put_bytes32(buf, &self.extensions, "auth.extensions")?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            user_id: get_string16(buf, "auth.user_id")?,
            token: get_string16(buf, "auth.token")?,
            extensions: get_bytes32(buf, "auth.extensions")?,
        })
    }
}

/// Resume request: the next sequence number the client expects from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continue {
    pub recv_seq: u32,
}

impl Message for Continue {
    const ID: MsgId = MsgId::Continue;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32(self.recv_seq);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            recv_seq: get_u32(buf, "continue.recv_seq")?,
        })
    }
}

/// Final server decision, with the sequence numbers both sides continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finished {
    /// Next sequence number the server will send.
    pub send_seq: u32,
    /// Next sequence number the server expects to receive.
    pub recv_seq: u32,
}

impl Message for Finished {
    const ID: MsgId = MsgId::Finished;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u32(self.send_seq);
        buf.put_u32(self.recv_seq);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            send_seq: get_u32(buf, "finished.send_seq")?,
            recv_seq: get_u32(buf, "finished.recv_seq")?,
        })
    }
}

/// Reset: the sender is about to close the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rst {
    pub code: RstCode,
    pub message: String,
}

impl Message for Rst {
    const ID: MsgId = MsgId::Rst;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(self.code.into());
        put_string16(buf, &self.message, "rst.message")?;
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            code: RstCode::try_from(get_u8(buf, "rst.code")?)?,
            message: get_string16(buf, "rst.message")?,
        })
    }
}

/// Keepalive. Ping or Pong is carried in the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat;

impl Message for Heartbeat {
    const ID: MsgId = MsgId::Heartbeat;

    fn encode(&self, _buf: &mut BytesMut) -> Result<(), WireError> {
        Ok(())
    }

    fn decode(_buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Heartbeat)
    }
}

/// Opaque application data. The body is the data, without a length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Bytes,
}

impl Message for Payload {
    const ID: MsgId = MsgId::Payload;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_slice(&self.data);
        Ok(())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            data: buf.split_to(buf.remaining()),
        })
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn put_bytes16(buf: &mut BytesMut, data: &[u8], field: &'static str) -> Result<(), WireError> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::FieldTooLong { field, len: data.len() })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn put_bytes32(buf: &mut BytesMut, data: &[u8], field: &'static str) -> Result<(), WireError> {
    let len = u32::try_from(data.len()).map_err(|_| WireError::FieldTooLong { field, len: data.len() })?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

fn put_string16(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), WireError> {
    put_bytes16(buf, s.as_bytes(), field)
}

fn get_u8(buf: &mut Bytes, field: &'static str) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes, field: &'static str) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.get_u32())
}

fn get_bytes16(buf: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len))
}

fn get_bytes32(buf: &mut Bytes, field: &'static str) -> Result<Bytes, WireError> {
    let len = get_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated(field));
    }
    Ok(buf.split_to(len))
}

fn get_string16(buf: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let raw = get_bytes16(buf, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown {kind} byte: 0x{value:02x}")]
    UnknownValue { kind: &'static str, value: u8 },

    #[error("truncated field: {0}")]
    Truncated(&'static str),

    #[error("field {field} is {len} bytes, longer than its length prefix allows")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("packet length {0} exceeds maximum {}", MAX_PACKET_LEN)]
    PacketTooLarge(usize),

    #[error("reserved head bytes are non-zero")]
    ReservedBitsSet,

    #[error("unexpected message id {got}, expected {expected}")]
    UnexpectedMessage { expected: u8, got: u8 },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
