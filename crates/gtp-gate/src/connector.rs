//! Client side of the protocol: dial a gate, handshake, exchange traffic and
//! resume after a disconnect.
//!
//! A [`ClientSession`] is driven by its owner; there is no background task.
//! Call [`ClientSession::recv`] to read (it answers pings and applies acks)
//! and [`ClientSession::heartbeat`] often enough to keep the link alive.

use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{SigningKey, VerifyingKey};
use subtle::ConstantTimeEq;

use gtp_core::codec::{CipherMaterial, Decoder, Encoder, DEFAULT_THRESHOLD};
use gtp_core::crypto::{self, EphemeralKeyPair};
use gtp_core::wire::{
    flags, Auth, ChangeCipherSpec, CipherSuite, Compression, Continue, EcdheSecretKeyExchange, Finished, Hello, MsgId,
    Rst, RstCode, SignatureAlgorithm, MSG_CUSTOMIZE, PROTOCOL_VERSION, RANDOM_SIZE,
};

use crate::error::{GateError, RstError};
use crate::session::Event;
use crate::synchronizer::{Inbound, Synchronizer};
use crate::transceiver::Transceiver;
use crate::transport::{LinkInfo, Transport};

/// What a client needs to pick a session back up on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTicket {
    pub session_id: String,
    pub user_id: String,
    pub token: String,
    /// Next sequence number the client expects from the gate.
    pub recv_seq: u32,
}

/// Inbound traffic on a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Data(Bytes),
    Event(Event),
}

#[derive(Clone)]
pub struct Connector {
    cipher_suite: CipherSuite,
    compression: Compression,
    compression_threshold: usize,
    user_id: String,
    token: String,
    extensions: Bytes,
    signing_key: Option<(SignatureAlgorithm, SigningKey)>,
    server_key: Option<VerifyingKey>,
    verify_encryption: bool,
    timeout: Duration,
    retries: u32,
    synchronizer_capacity: usize,
}

impl Default for Connector {
    fn default() -> Self {
        Self {
            cipher_suite: CipherSuite::NONE,
            compression: Compression::None,
            compression_threshold: DEFAULT_THRESHOLD,
            user_id: String::new(),
            token: String::new(),
            extensions: Bytes::new(),
            signing_key: None,
            server_key: None,
            verify_encryption: true,
            timeout: Duration::from_secs(3),
            retries: 3,
            synchronizer_capacity: 1024,
        }
    }
}

impl Connector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Propose a cipher suite. [`CipherSuite::NONE`] leaves the choice to the gate.
    pub fn cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.cipher_suite = suite;
        self
    }

    pub fn compression(mut self, compression: Compression, threshold: usize) -> Self {
        self.compression = compression;
        self.compression_threshold = threshold;
        self
    }

    pub fn credentials(mut self, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.token = token.into();
        self
    }

    pub fn extensions(mut self, extensions: impl Into<Bytes>) -> Self {
        self.extensions = extensions.into();
        self
    }

    /// Sign our half of the key exchange.
    pub fn sign_with(mut self, algorithm: SignatureAlgorithm, key: SigningKey) -> Self {
        self.signing_key = Some((algorithm, key));
        self
    }

    /// Require the gate's key exchange to be signed by `key`.
    pub fn verify_server(mut self, key: VerifyingKey) -> Self {
        self.server_key = Some(key);
        self
    }

    /// Send the sealed client Hello hash back so the gate can check our keys.
    pub fn verify_encryption(mut self, verify: bool) -> Self {
        self.verify_encryption = verify;
        self
    }

    pub fn timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.timeout = timeout;
        self.retries = retries;
        self
    }

    /// Open a new session.
    pub async fn connect(&self, transport: Transport) -> Result<ClientSession, GateError> {
        self.establish(transport, None).await
    }

    /// Resume the session described by `ticket`.
    pub async fn resume(&self, transport: Transport, ticket: &ResumeTicket) -> Result<ClientSession, GateError> {
        self.establish(transport, Some(ticket)).await
    }

    async fn establish(&self, transport: Transport, ticket: Option<&ResumeTicket>) -> Result<ClientSession, GateError> {
        let mut link = Transceiver::new(transport, self.timeout, self.retries);
        match self.handshake(&mut link, ticket).await {
            Ok(mut session) => {
                session.link = Some(link);
                Ok(session)
            }
            Err(e) => {
                if !e.is_disconnect() && !matches!(e, GateError::PeerReset(_)) {
                    link.send_rst(&RstError::new(e.rst_code(), e.to_string())).await;
                }
                link.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, link: &mut Transceiver, ticket: Option<&ResumeTicket>) -> Result<ClientSession, GateError> {
        let client_random = crypto::random_bytes(RANDOM_SIZE);
        let hello = Hello {
            version: PROTOCOL_VERSION,
            session_id: ticket.map(|t| t.session_id.clone()).unwrap_or_default(),
            random: Bytes::copy_from_slice(&client_random),
            cipher_suite: self.cipher_suite,
            compression: self.compression,
        };
        let hello_flags = if ticket.is_some() { flags::HELLO_CONTINUE } else { 0 };
        link.send_message(hello_flags, &hello).await?;
        let client_hello_hash = crypto::hash_message(hello_flags, &hello)?;

        let (server_hello, server_flags) = link.recv_message::<Hello>("hello").await?;
        if server_hello.version != PROTOCOL_VERSION {
            return Err(RstError::new(RstCode::VersionError, "gate answered with another protocol version").into());
        }
        if ticket.is_some() && server_flags & flags::HELLO_CONTINUE == 0 {
            return Err(RstError::new(RstCode::ContinueFailed, "gate did not accept resume").into());
        }
        let server_hello_hash = crypto::hash_message(server_flags, &server_hello)?;
        let suite = server_hello.cipher_suite;
        let compression = server_hello.compression;

        if server_flags & flags::HELLO_ENCRYPTION != 0 {
            let ctx = ClientContext {
                suite,
                compression,
                client_random: &client_random,
                server_random: &server_hello.random,
                session_id: &server_hello.session_id,
                client_hello_hash,
                server_hello_hash,
            };
            self.key_exchange(link, &ctx).await?;
        } else {
            link.install_encoder(Encoder::build(&suite, None, compression, self.compression_threshold)?);
            link.install_decoder(Decoder::build(&suite, None, compression)?);
        }

        // the identity the gate holds for this session, needed again to resume
        let (user_id, token) = match ticket {
            Some(t) => (t.user_id.clone(), t.token.clone()),
            None if server_flags & flags::HELLO_AUTH != 0 => (self.user_id.clone(), self.token.clone()),
            None => (String::new(), String::new()),
        };
        if server_flags & flags::HELLO_AUTH != 0 {
            let auth = Auth { user_id: user_id.clone(), token: token.clone(), extensions: self.extensions.clone() };
            link.send_message(0, &auth).await?;
        }
        if let Some(t) = ticket {
            link.send_message(0, &Continue { recv_seq: t.recv_seq }).await?;
        }

        let (finished, finished_flags) = link.recv_message::<Finished>("finished").await?;
        if let Some(t) = ticket {
            if finished_flags & flags::FINISHED_CONTINUE_OK == 0 || finished.send_seq != t.recv_seq {
                return Err(RstError::new(RstCode::ContinueFailed, "gate resumed at an unexpected sequence").into());
            }
        }

        let mut sync = Synchronizer::new(self.synchronizer_capacity);
        sync.reset(finished.recv_seq, finished.send_seq);
        tracing::debug!(session_id = %server_hello.session_id, %suite, %compression, "client handshake complete");

        Ok(ClientSession {
            link: None,
            session_id: server_hello.session_id,
            user_id,
            token,
            cipher_suite: suite,
            compression,
            finished_flags,
            sync,
        })
    }

    async fn key_exchange(&self, link: &mut Transceiver, ctx: &ClientContext<'_>) -> Result<(), GateError> {
        let (server_kx, server_kx_flags) = link.recv_message::<EcdheSecretKeyExchange>("key exchange").await?;
        if let Some(server_key) = &self.server_key {
            if server_kx_flags & flags::ECDHE_SIGNATURE == 0 {
                return Err(RstError::new(RstCode::EncryptFailed, "gate key exchange not signed").into());
            }
            let transcript = ctx.transcript(&server_kx.public_key);
            crypto::verify(server_kx.signature_algorithm, server_key, &transcript, &server_kx.signature)?;
        }

        let keypair = EphemeralKeyPair::generate(server_kx.named_curve);
        let public = keypair.public_bytes();
        let (signature_algorithm, signature) = match &self.signing_key {
            Some((alg, key)) => (*alg, crypto::sign(*alg, key, &ctx.transcript(&public))),
            None => (SignatureAlgorithm::None, Vec::new()),
        };
        let kx_flags = if signature.is_empty() { 0 } else { flags::ECDHE_SIGNATURE };
        let client_kx = EcdheSecretKeyExchange {
            named_curve: server_kx.named_curve,
            public_key: Bytes::copy_from_slice(&public),
            iv: Bytes::new(),
            nonce: Bytes::new(),
            nonce_step: Bytes::new(),
            signature_algorithm,
            signature: Bytes::from(signature),
        };
        link.send_message(kx_flags, &client_kx).await?;

        let secret = keypair.agree(&server_kx.public_key)?;
        let keys = crypto::derive_session_keys(&secret, ctx.client_random, ctx.server_random);
        let send = CipherMaterial {
            cipher_key: &keys.client_to_server_cipher[..],
            mac_key: &keys.client_to_server_mac[..],
            iv: &server_kx.iv,
            nonce: &server_kx.nonce,
            nonce_step: &server_kx.nonce_step,
        };
        let recv = CipherMaterial {
            cipher_key: &keys.server_to_client_cipher[..],
            mac_key: &keys.server_to_client_mac[..],
            iv: &server_kx.iv,
            nonce: &server_kx.nonce,
            nonce_step: &server_kx.nonce_step,
        };
        let mut encoder = Encoder::build(&ctx.suite, Some(&send), ctx.compression, self.compression_threshold)?;
        let mut decoder = Decoder::build(&ctx.suite, Some(&recv), ctx.compression)?;

        let (ccs, _) = link.recv_message::<ChangeCipherSpec>("change cipher spec").await?;
        let opened = decoder
            .open(&ccs.encrypted_hello_hash)
            .map_err(|e| RstError::new(RstCode::EncryptFailed, format!("server hello hash: {e}")))?;
        if !bool::from(opened.as_slice().ct_eq(&ctx.server_hello_hash)) {
            return Err(RstError::new(RstCode::EncryptFailed, "server hello hash mismatch").into());
        }
        link.install_decoder(decoder);

        let (ccs_flags, sealed) = if self.verify_encryption {
            (flags::CCS_VERIFY_ENCRYPTION, encoder.seal(&ctx.client_hello_hash)?)
        } else {
            (0, Vec::new())
        };
        link.send_message(ccs_flags, &ChangeCipherSpec { encrypted_hello_hash: Bytes::from(sealed) }).await?;
        link.install_encoder(encoder);
        Ok(())
    }
}

struct ClientContext<'a> {
    suite: CipherSuite,
    compression: Compression,
    client_random: &'a [u8],
    server_random: &'a [u8],
    session_id: &'a str,
    client_hello_hash: [u8; 32],
    server_hello_hash: [u8; 32],
}

impl ClientContext<'_> {
    fn transcript(&self, public_key: &[u8]) -> Vec<u8> {
        crypto::key_exchange_transcript(
            &self.suite,
            self.compression,
            self.client_random,
            self.server_random,
            self.session_id,
            public_key,
        )
    }
}

// ── ClientSession ─────────────────────────────────────────────────────────────

pub struct ClientSession {
    link: Option<Transceiver>,
    session_id: String,
    user_id: String,
    token: String,
    cipher_suite: CipherSuite,
    compression: Compression,
    finished_flags: u8,
    sync: Synchronizer,
}

impl ClientSession {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn info(&self) -> Option<LinkInfo> {
        self.link.as_ref().map(Transceiver::info)
    }

    pub fn encrypted(&self) -> bool {
        self.finished_flags & flags::FINISHED_ENCRYPT_OK != 0
    }

    pub fn authenticated(&self) -> bool {
        self.finished_flags & flags::FINISHED_AUTH_OK != 0
    }

    pub fn resumed(&self) -> bool {
        self.finished_flags & flags::FINISHED_CONTINUE_OK != 0
    }

    /// `(send_seq, recv_seq)`.
    pub fn sequences(&self) -> (u32, u32) {
        (self.sync.send_seq(), self.sync.recv_seq())
    }

    /// Everything needed to resume this session later.
    pub fn ticket(&self) -> ResumeTicket {
        ResumeTicket {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            token: self.token.clone(),
            recv_seq: self.sync.recv_seq(),
        }
    }

    fn link(&mut self) -> Result<&mut Transceiver, GateError> {
        self.link.as_mut().ok_or(GateError::ConnectionClosed)
    }

    pub async fn send_data(&mut self, data: impl Into<Bytes>) -> Result<u32, GateError> {
        let seq = self.sync.push(MsgId::Payload, 0, data.into())?;
        self.flush().await?;
        Ok(seq)
    }

    pub async fn send_event(&mut self, event: Event) -> Result<u32, GateError> {
        if event.id < MSG_CUSTOMIZE {
            return Err(GateError::InvalidEventId(event.id));
        }
        let seq = self.sync.push(MsgId::Custom(event.id), event.flags & flags::MESSAGE_MASK, event.body)?;
        self.flush().await?;
        Ok(seq)
    }

    async fn flush(&mut self) -> Result<(), GateError> {
        while let Some(entry) = self.sync.next_unsent() {
            let ack = self.sync.recv_seq();
            self.link()?.send(entry.msg_id, entry.flags | flags::SEQUENCED, entry.seq, ack, &entry.body).await?;
        }
        Ok(())
    }

    /// Send a ping carrying our current ack.
    pub async fn heartbeat(&mut self) -> Result<(), GateError> {
        let ack = self.sync.recv_seq();
        self.link()?.send(MsgId::Heartbeat, flags::HEARTBEAT_PING, 0, ack, &[]).await
    }

    /// Next data or event from the gate. Pings are answered along the way.
    pub async fn recv(&mut self) -> Result<Received, GateError> {
        loop {
            let packet = self.link()?.read_packet().await?;
            self.sync.ack(packet.ack);
            match packet.msg_id {
                MsgId::Heartbeat => {
                    if packet.has_flag(flags::HEARTBEAT_PING) {
                        let ack = self.sync.recv_seq();
                        self.link()?.send(MsgId::Heartbeat, flags::HEARTBEAT_PONG, 0, ack, &[]).await?;
                    }
                }
                MsgId::Rst => {
                    let rst: Rst = packet.message()?;
                    return Err(GateError::PeerReset(rst.into()));
                }
                MsgId::Payload | MsgId::Custom(_) => match self.sync.accept(packet.seq)? {
                    Inbound::Duplicate => continue,
                    Inbound::Deliver => {
                        return Ok(match packet.msg_id {
                            MsgId::Custom(id) => Received::Event(Event {
                                id,
                                flags: packet.flags & flags::MESSAGE_MASK,
                                body: packet.body,
                            }),
                            _ => Received::Data(packet.body),
                        });
                    }
                },
                other => {
                    return Err(GateError::UnexpectedMessage { expected: MsgId::Payload, got: other });
                }
            }
        }
    }

    /// End the session on the gate with a reset.
    pub async fn close(mut self) {
        if let Some(mut link) = self.link.take() {
            link.send_rst(&RstError::new(RstCode::Unspecified, "client closed")).await;
            link.close().await;
        }
    }

    /// Drop the connection without telling the gate, leaving the session
    /// resumable. Returns the ticket to resume with.
    pub async fn disconnect(mut self) -> ResumeTicket {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.ticket()
    }
}
