//! Server side of the GTP handshake.
//!
//! ```text
//! client                                   server
//!   Hello (version, session id?, random, proposal)  ->
//!                          <-  Hello (session id, random, suite, flags)
//!   -- encryption flag --
//!                          <-  EcdheSecretKeyExchange (pub, iv, nonce, sig?)
//!   EcdheSecretKeyExchange (pub, sig?)  ->
//!                          <-  ChangeCipherSpec (sealed server hello hash)
//!   ChangeCipherSpec (sealed client hello hash?)  ->
//!   -- auth flag --
//!   Auth (user id, token, extensions)  ->
//!   -- continue flag --
//!   Continue (recv seq)  ->
//!                          <-  Finished (send seq, recv seq, ok flags)
//! ```
//!
//! Each side switches its send direction to the negotiated codec right after
//! sending its ChangeCipherSpec, and its receive direction right after
//! reading the peer's. Without encryption the codec (compression only) is
//! switched on right after the Hello exchange.
//!
//! Any failure is reported with a reset before the connection closes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use subtle::ConstantTimeEq;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockWriteGuard};
use zeroize::Zeroizing;

use gtp_core::codec::{self, CipherMaterial, Decoder, Encoder};
use gtp_core::config::HandshakeConfig;
use gtp_core::crypto::{self, EphemeralKeyPair};
use gtp_core::wire::{
    flags, Auth, ChangeCipherSpec, CipherSuite, Compression, Continue, EcdheSecretKeyExchange, Finished, Hello,
    KeyExchange, RstCode, SignatureAlgorithm, PROTOCOL_VERSION, RANDOM_SIZE,
};

use crate::auth::ConnInfo;
use crate::error::{GateError, RstError};
use crate::gate::GateShared;
use crate::session::{Session, SessionState};
use crate::transceiver::Transceiver;

/// Pick the suite and compression for a fresh session.
///
/// The client's suite is honoured only when allowed and actually proposed
/// (a key exchange other than `none`); its compression whenever allowed.
pub fn negotiate(config: &HandshakeConfig, client: &Hello) -> Result<(CipherSuite, Compression), RstError> {
    let suite = if config.agree_client_cipher_suite && client.cipher_suite.key_exchange != KeyExchange::None {
        client.cipher_suite
    } else {
        config.cipher_suite
    };
    codec::params(&suite).map_err(|e| RstError::new(RstCode::EncryptFailed, format!("cipher suite {suite}: {e}")))?;

    let compression = if config.agree_client_compression { client.compression } else { config.compression };
    Ok((suite, compression))
}

/// Everything agreed by a handshake that got as far as Finished.
struct Negotiated {
    session: Arc<Session>,
    resume: bool,
    // released once the new link is installed
    _pause: OwnedRwLockWriteGuard<()>,
    _resuming: Option<OwnedMutexGuard<()>>,
}

/// Per-attempt handshake values. Randoms are wiped on drop.
struct HandshakeContext {
    suite: CipherSuite,
    compression: Compression,
    client_random: Bytes,
    server_random: Zeroizing<Vec<u8>>,
    client_hello_hash: [u8; 32],
    server_hello_hash: [u8; 32],
}

/// A session created by this handshake. Unregistered and closed on drop
/// unless the handshake completes, including when the handshake future is
/// dropped by the accept timeout.
struct FreshSession {
    shared: Arc<GateShared>,
    session: Option<Arc<Session>>,
}

impl Drop for FreshSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.shared.registry.remove(session.id(), &session);
            session.close(None);
        }
    }
}

pub(crate) struct ServerHandshake {
    shared: Arc<GateShared>,
    link: Transceiver,
    fresh: FreshSession,
}

impl ServerHandshake {
    pub(crate) fn new(shared: Arc<GateShared>, link: Transceiver) -> Self {
        let fresh = FreshSession { shared: Arc::clone(&shared), session: None };
        Self { shared, link, fresh }
    }

    pub(crate) async fn run(mut self) -> Result<Arc<Session>, GateError> {
        let steps = AssertUnwindSafe(self.steps())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(GateError::Panicked(panic_message(panic))));
        match steps {
            Ok(done) => {
                let session = Arc::clone(&done.session);
                let installed = if done.resume { session.relink(self.link) } else { session.start(self.link) };
                match installed {
                    Ok(()) => {
                        self.fresh.session = None;
                        Ok(session)
                    }
                    Err(mut link) => {
                        // closed or expired after Finished went out
                        let rst = if self.shared.cancel.is_cancelled() {
                            RstError::new(RstCode::Shutdown, "gate shutting down")
                        } else if done.resume {
                            RstError::new(RstCode::ContinueFailed, "session closed during resume")
                        } else {
                            RstError::new(RstCode::SessionDeath, "session closed during handshake")
                        };
                        link.send_rst(&rst).await;
                        link.close().await;
                        Err(rst.into())
                    }
                }
            }
            Err(e) => {
                if !e.is_disconnect() && !matches!(e, GateError::PeerReset(_)) {
                    self.link.send_rst(&RstError::new(e.rst_code(), e.to_string())).await;
                }
                self.link.close().await;
                Err(e)
            }
        }
    }

    async fn steps(&mut self) -> Result<Negotiated, GateError> {
        let shared = Arc::clone(&self.shared);

        // ── Hello ──
        let (client_hello, client_flags) = self.link.recv_message::<Hello>("hello").await?;
        if client_hello.version != PROTOCOL_VERSION {
            return Err(RstError::new(
                RstCode::VersionError,
                format!("unsupported protocol version 0x{:04x}, expected 0x{:04x}", client_hello.version, PROTOCOL_VERSION),
            )
            .into());
        }

        let resume = !client_hello.session_id.is_empty();
        let (session, suite, compression) = if resume {
            let session = shared
                .registry
                .get(&client_hello.session_id)
                .filter(|s| s.state() != SessionState::Death)
                .ok_or_else(|| RstError::new(RstCode::SessionNotFound, "session not found"))?;
            let (suite, compression) = (session.cipher_suite(), session.compression());
            (session, suite, compression)
        } else {
            let (suite, compression) = negotiate(&shared.config.handshake, &client_hello)?;
            let session = Session::new(self.new_session_id(), Arc::clone(&shared), suite, compression, self.link.info());
            session.set_state(SessionState::Handshake);
            self.fresh.session = Some(Arc::clone(&session));
            (session, suite, compression)
        };
        tracing::debug!(session_id = %session.id(), resume, %suite, %compression, "hello received");

        let resuming = if resume {
            let guard = Arc::clone(&session.resuming)
                .try_lock_owned()
                .map_err(|_| RstError::new(RstCode::ContinueFailed, "resume already in progress"))?;
            // the inactive reap marks Death under this lock
            if session.state() == SessionState::Death {
                return Err(RstError::new(RstCode::SessionNotFound, "session expired").into());
            }
            Some(guard)
        } else {
            None
        };

        let encrypted = suite.is_encrypted();
        let auth = resume || shared.authenticator.is_some();
        if encrypted && client_hello.random.len() != RANDOM_SIZE {
            return Err(RstError::new(RstCode::EncryptFailed, "client random missing").into());
        }
        let server_random = if encrypted { crypto::random_bytes(RANDOM_SIZE) } else { Zeroizing::new(Vec::new()) };

        let mut hello_flags = 0;
        if encrypted {
            hello_flags |= flags::HELLO_ENCRYPTION;
        }
        if auth {
            hello_flags |= flags::HELLO_AUTH;
        }
        if resume {
            hello_flags |= flags::HELLO_CONTINUE;
        }
        if hello_flags == 0 {
            hello_flags = flags::HELLO_DONE;
        }
        let server_hello = Hello {
            version: PROTOCOL_VERSION,
            session_id: session.id().to_owned(),
            random: Bytes::copy_from_slice(&server_random),
            cipher_suite: suite,
            compression,
        };
        self.link.send_message(hello_flags, &server_hello).await?;

        let ctx = HandshakeContext {
            suite,
            compression,
            client_hello_hash: crypto::hash_message(client_flags, &client_hello)?,
            server_hello_hash: crypto::hash_message(hello_flags, &server_hello)?,
            client_random: client_hello.random,
            server_random,
        };

        // ── Key exchange ──
        if encrypted {
            self.key_exchange(&ctx, session.id()).await?;
        } else {
            let threshold = shared.config.handshake.compression_threshold;
            self.link.install_encoder(Encoder::build(&suite, None, compression, threshold)?);
            self.link.install_decoder(Decoder::build(&suite, None, compression)?);
        }

        // ── Auth ──
        if auth {
            let (msg, _) = self.link.recv_message::<Auth>("auth").await?;
            if resume {
                let same_user = msg.user_id.as_bytes().ct_eq(session.user_id().as_bytes());
                let same_token = msg.token.as_bytes().ct_eq(session.token().as_bytes());
                if !bool::from(same_user & same_token) {
                    return Err(RstError::new(RstCode::AuthFailed, "credentials do not match session").into());
                }
            }
            if let Some(authenticator) = &shared.authenticator {
                let info = self.link.info();
                let conn = ConnInfo {
                    session_id: session.id().to_owned(),
                    transport: info.kind,
                    local_addr: info.local_addr,
                    remote_addr: info.remote_addr,
                    resume,
                };
                authenticator
                    .authenticate(&conn, &msg.user_id, &msg.token, &msg.extensions)
                    .map_err(|e| RstError::new(RstCode::AuthFailed, e.to_string()))?;
            }
            if !resume {
                session.set_identity(msg.user_id, msg.token);
            }
        }

        // No session traffic until Finished is out and the link installed.
        let pause = Arc::clone(&session.io_pause).write_owned().await;

        // ── Continue ──
        let (send_seq, recv_seq) = if resume {
            let (cont, _) = self.link.recv_message::<Continue>("continue").await?;
            session
                .validate_resume(cont.recv_seq)
                .map_err(|e| RstError::new(RstCode::ContinueFailed, e.to_string()))?;
            if !shared.registry.is_current(session.id(), &session) || session.state() == SessionState::Death {
                return Err(RstError::new(RstCode::ContinueFailed, "session replaced or closed").into());
            }
            session
                .synchronize(cont.recv_seq)
                .map_err(|e| RstError::new(RstCode::ContinueFailed, e.to_string()))?
        } else {
            (0, 0)
        };

        // Registered before Finished so the client can resume as soon as it has it.
        if !resume {
            session.set_state(SessionState::Confirmed);
            shared
                .registry
                .insert(Arc::clone(&session))
                .map_err(|_| RstError::new(RstCode::ServerInternalError, "session id collision"))?;
        }

        // ── Finished ──
        let mut finished_flags = 0;
        if encrypted {
            finished_flags |= flags::FINISHED_ENCRYPT_OK;
        }
        if auth {
            finished_flags |= flags::FINISHED_AUTH_OK;
        }
        if resume {
            finished_flags |= flags::FINISHED_CONTINUE_OK;
        }
        self.link.send_message(finished_flags, &Finished { send_seq, recv_seq }).await?;

        Ok(Negotiated { session, resume, _pause: pause, _resuming: resuming })
    }

    async fn key_exchange(&mut self, ctx: &HandshakeContext, session_id: &str) -> Result<(), GateError> {
        let cfg = &self.shared.config.handshake;
        let params = codec::params(&ctx.suite)?;

        let keypair = EphemeralKeyPair::generate(cfg.named_curve);
        let public = keypair.public_bytes();
        let iv = crypto::random_bytes(params.iv_size);
        let nonce = crypto::random_bytes(params.nonce_size);
        let nonce_step = if params.nonce_size > 0 { crypto::generate_nonce_step().to_vec() } else { Vec::new() };

        let (signature_algorithm, signature) = match &self.shared.signing_key {
            Some(key) if cfg.signature_algorithm != SignatureAlgorithm::None => {
                let transcript = crypto::key_exchange_transcript(
                    &ctx.suite,
                    ctx.compression,
                    &ctx.client_random,
                    &ctx.server_random,
                    session_id,
                    &public,
                );
                (cfg.signature_algorithm, crypto::sign(cfg.signature_algorithm, key, &transcript))
            }
            _ => (SignatureAlgorithm::None, Vec::new()),
        };
        let kx_flags = if signature.is_empty() { 0 } else { flags::ECDHE_SIGNATURE };
        let server_kx = EcdheSecretKeyExchange {
            named_curve: cfg.named_curve,
            public_key: Bytes::copy_from_slice(&public),
            iv: Bytes::copy_from_slice(&iv),
            nonce: Bytes::copy_from_slice(&nonce),
            nonce_step: Bytes::from(nonce_step.clone()),
            signature_algorithm,
            signature: Bytes::from(signature),
        };
        self.link.send_message(kx_flags, &server_kx).await?;

        let (client_kx, client_kx_flags) = self.link.recv_message::<EcdheSecretKeyExchange>("key exchange").await?;
        if client_kx.named_curve != cfg.named_curve {
            return Err(RstError::new(RstCode::EncryptFailed, format!("named curve {} not offered", client_kx.named_curve)).into());
        }
        if let Some(client_key) = &self.shared.client_key {
            if client_kx_flags & flags::ECDHE_SIGNATURE == 0 {
                return Err(RstError::new(RstCode::EncryptFailed, "client key exchange not signed").into());
            }
            let transcript = crypto::key_exchange_transcript(
                &ctx.suite,
                ctx.compression,
                &ctx.client_random,
                &ctx.server_random,
                session_id,
                &client_kx.public_key,
            );
            crypto::verify(client_kx.signature_algorithm, client_key, &transcript, &client_kx.signature)?;
        }

        let secret = keypair.agree(&client_kx.public_key)?;
        let keys = crypto::derive_session_keys(&secret, &ctx.client_random, &ctx.server_random);
        let send = CipherMaterial {
            cipher_key: &keys.server_to_client_cipher[..],
            mac_key: &keys.server_to_client_mac[..],
            iv: &iv,
            nonce: &nonce,
            nonce_step: &nonce_step,
        };
        let recv = CipherMaterial {
            cipher_key: &keys.client_to_server_cipher[..],
            mac_key: &keys.client_to_server_mac[..],
            iv: &iv,
            nonce: &nonce,
            nonce_step: &nonce_step,
        };
        let mut encoder = Encoder::build(&ctx.suite, Some(&send), ctx.compression, cfg.compression_threshold)?;
        let mut decoder = Decoder::build(&ctx.suite, Some(&recv), ctx.compression)?;

        let sealed = encoder.seal(&ctx.server_hello_hash)?;
        self.link.send_message(0, &ChangeCipherSpec { encrypted_hello_hash: Bytes::from(sealed) }).await?;
        self.link.install_encoder(encoder);

        let (ccs, ccs_flags) = self.link.recv_message::<ChangeCipherSpec>("change cipher spec").await?;
        if ccs_flags & flags::CCS_VERIFY_ENCRYPTION != 0 {
            let opened = decoder
                .open(&ccs.encrypted_hello_hash)
                .map_err(|e| RstError::new(RstCode::EncryptFailed, format!("client hello hash: {e}")))?;
            if !bool::from(opened.as_slice().ct_eq(&ctx.client_hello_hash)) {
                return Err(RstError::new(RstCode::EncryptFailed, "client hello hash mismatch").into());
            }
        }
        self.link.install_decoder(decoder);
        Ok(())
    }

    fn new_session_id(&self) -> String {
        loop {
            let id = crypto::generate_session_id();
            if self.shared.registry.get(&id).is_none() {
                return id;
            }
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtp_core::wire::{BlockCipherMode, MacHash, PaddingMode, SymmetricEncryption};

    fn hello(suite: CipherSuite, compression: Compression) -> Hello {
        Hello {
            version: PROTOCOL_VERSION,
            session_id: String::new(),
            random: Bytes::from_static(&[1; RANDOM_SIZE]),
            cipher_suite: suite,
            compression,
        }
    }

    fn chacha() -> CipherSuite {
        CipherSuite {
            key_exchange: KeyExchange::Ecdhe,
            symmetric: SymmetricEncryption::ChaCha20Poly1305,
            block_mode: BlockCipherMode::None,
            padding: PaddingMode::None,
            mac: MacHash::Crc32,
        }
    }

    #[test]
    fn client_proposal_honoured_when_agreed() {
        let config = HandshakeConfig::default();
        let (suite, compression) = negotiate(&config, &hello(chacha(), Compression::Zstd)).unwrap();
        assert_eq!(suite, chacha());
        assert_eq!(compression, Compression::Zstd);
    }

    #[test]
    fn no_proposal_gets_server_default() {
        let config = HandshakeConfig::default();
        let (suite, _) = negotiate(&config, &hello(CipherSuite::NONE, Compression::None)).unwrap();
        assert_eq!(suite, config.cipher_suite);
    }

    #[test]
    fn server_suite_forced_when_not_agreed() {
        let config = HandshakeConfig {
            agree_client_cipher_suite: false,
            agree_client_compression: false,
            ..HandshakeConfig::default()
        };
        for proposal in [chacha(), CipherSuite::NONE, CipherSuite::default()] {
            let (suite, compression) = negotiate(&config, &hello(proposal, Compression::Deflate)).unwrap();
            assert_eq!(suite, config.cipher_suite);
            assert_eq!(compression, config.compression);
        }
    }

    #[test]
    fn invalid_client_suite_rejected() {
        let bad = CipherSuite { block_mode: BlockCipherMode::Cbc, padding: PaddingMode::None, ..CipherSuite::default() };
        let err = negotiate(&HandshakeConfig::default(), &hello(bad, Compression::None)).unwrap_err();
        assert_eq!(err.code, RstCode::EncryptFailed);
    }
}
