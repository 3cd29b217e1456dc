use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use ed25519_dalek::SigningKey;

use gtp_core::codec::{CodecError, DEFAULT_THRESHOLD};
use gtp_core::wire::{
    BlockCipherMode, CipherSuite, Compression, Hello, KeyExchange, MacHash, MsgId, PaddingMode, RstCode,
    SignatureAlgorithm, SymmetricEncryption, WireError, PROTOCOL_VERSION,
};
use gtp_gate::transceiver::Transceiver;
use gtp_gate::{ConnInfo, Gate, GateError, ResumeTicket, SessionState, Transport, TransportKind};

use crate::*;

fn gcm128() -> CipherSuite {
    CipherSuite {
        key_exchange: KeyExchange::Ecdhe,
        symmetric: SymmetricEncryption::Aes128,
        block_mode: BlockCipherMode::Gcm,
        padding: PaddingMode::None,
        mac: MacHash::None,
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

/// A fresh client gets the suite it proposed, sequences start at zero and
/// the gate session goes Active.
#[tokio::test]
async fn fresh_handshake_uses_client_proposal() -> Result<()> {
    let tg = start_default().await?;
    let client = connect(&tg, &connector().cipher_suite(chacha()).compression(Compression::Zstd, DEFAULT_THRESHOLD)).await?;

    assert_eq!(client.cipher_suite(), chacha());
    assert_eq!(client.compression(), Compression::Zstd);
    assert!(client.encrypted());
    assert!(!client.authenticated(), "no authenticator configured");
    assert!(!client.resumed());
    assert_eq!(client.sequences(), (0, 0));
    assert_eq!(client.id().len(), 32, "hex of 16 random bytes");

    let session = server_session(&tg, &client).await?;
    assert_eq!(session.cipher_suite(), chacha());
    assert_eq!(session.compression(), Compression::Zstd);
    assert_eq!(session.transport_kind(), TransportKind::Tcp);
    assert_eq!(tg.gate.count_sessions(), 1);

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

/// A client that proposes nothing gets the gate's configured suite.
#[tokio::test]
async fn empty_proposal_gets_gate_suite() -> Result<()> {
    let tg = start_default().await?;
    let client = connect(&tg, &connector()).await?;

    assert_eq!(client.cipher_suite(), CipherSuite::default());
    assert!(client.encrypted());

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn gate_suite_forced_when_not_agreeing() -> Result<()> {
    let mut config = test_config();
    config.handshake.agree_client_cipher_suite = false;
    config.handshake.agree_client_compression = false;
    config.handshake.cipher_suite = gcm128();
    config.handshake.compression = Compression::Deflate;
    let tg = start(Gate::builder(config)).await?;

    let client = connect(&tg, &connector().cipher_suite(chacha()).compression(Compression::Gzip, 0)).await?;
    assert_eq!(client.cipher_suite(), gcm128());
    assert_eq!(client.compression(), Compression::Deflate);

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn plaintext_suite_skips_key_exchange() -> Result<()> {
    let mut config = test_config();
    config.handshake.cipher_suite = CipherSuite::NONE;
    let tg = start(Gate::builder(config)).await?;

    let mut client = connect(&tg, &connector()).await?;
    assert!(!client.encrypted());
    assert_eq!(client.cipher_suite(), CipherSuite::NONE);

    let session = server_session(&tg, &client).await?;
    client.send_data("in the clear").await?;
    assert_eq!(within("data", session.recv_data()).await?, Some(Bytes::from_static(b"in the clear")));

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_client_suite_is_rejected() -> Result<()> {
    let tg = start_default().await?;
    let broken = CipherSuite {
        key_exchange: KeyExchange::Ecdhe,
        symmetric: SymmetricEncryption::Aes256,
        block_mode: BlockCipherMode::Cbc,
        padding: PaddingMode::None,
        mac: MacHash::None,
    };

    let err = connect(&tg, &connector().cipher_suite(broken)).await.err().expect("handshake should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::EncryptFailed));
    wait_until("no sessions", || tg.gate.count_sessions() == 0).await?;

    tg.gate.shutdown().await;
    Ok(())
}

// ── Authentication ────────────────────────────────────────────────────────────

fn authenticated_gate() -> GateBuilder {
    Gate::builder(test_config()).authenticator(|conn: &ConnInfo, user: &str, token: &str, ext: &[u8]| {
        anyhow::ensure!(conn.transport == TransportKind::Tcp, "tcp only");
        anyhow::ensure!(token == format!("{user}-secret"), "bad token for {user}");
        anyhow::ensure!(ext == b"v1", "unexpected extensions");
        Ok(())
    })
}

#[tokio::test]
async fn authenticator_accepts_and_records_identity() -> Result<()> {
    let tg = start(authenticated_gate()).await?;
    let client = connect(&tg, &connector().credentials("alice", "alice-secret").extensions(&b"v1"[..])).await?;
    assert!(client.authenticated());
    assert!(client.encrypted());
    assert_eq!(client.cipher_suite(), CipherSuite::default());
    assert_eq!(client.sequences(), (0, 0));

    let session = server_session(&tg, &client).await?;
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.user_id(), "alice");
    assert_eq!(session.token(), "alice-secret");

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn authenticator_rejection_resets_with_auth_failed() -> Result<()> {
    let tg = start(authenticated_gate()).await?;

    let err = connect(&tg, &connector().credentials("alice", "wrong").extensions(&b"v1"[..]))
        .await
        .err()
        .expect("handshake should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::AuthFailed));
    wait_until("no sessions", || tg.gate.count_sessions() == 0).await?;

    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn panicking_authenticator_resets_with_internal_error() -> Result<()> {
    let builder = Gate::builder(test_config()).authenticator(
        |_: &ConnInfo, user: &str, _: &str, _: &[u8]| -> anyhow::Result<()> {
            if user == "boom" {
                panic!("authenticator blew up");
            }
            Ok(())
        },
    );
    let tg = start(builder).await?;

    let err = connect(&tg, &connector().credentials("boom", "t")).await.err().expect("handshake should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::ServerInternalError));
    wait_until("no sessions", || tg.gate.count_sessions() == 0).await?;

    // the gate keeps serving
    let client = connect(&tg, &connector().credentials("calm", "t")).await?;
    assert!(client.authenticated());

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn oversized_credentials_fail_instead_of_truncating() -> Result<()> {
    let tg = start(authenticated_gate()).await?;

    let long_user = "u".repeat(70_000);
    let err = connect(&tg, &connector().credentials(long_user, "t").extensions(&b"v1"[..]))
        .await
        .err()
        .expect("oversized user id should not be sent");
    assert!(matches!(
        gate_error(&err),
        Some(GateError::Codec(CodecError::Wire(WireError::FieldTooLong { field: "auth.user_id", .. })))
    ));
    wait_until("no sessions", || tg.gate.count_sessions() == 0).await?;

    tg.gate.shutdown().await;
    Ok(())
}

// ── Protocol errors ───────────────────────────────────────────────────────────

/// A Hello the gate cannot decode is reset as unspecified, not as a cipher failure.
#[tokio::test]
async fn malformed_hello_resets_as_unspecified() -> Result<()> {
    let tg = start_default().await?;
    let transport = Transport::connect_tcp(tg.tcp).await?;
    let mut link = Transceiver::new(transport, Duration::from_millis(1_000), 2);

    link.send(MsgId::Hello, 0, 0, 0, &[0x01]).await?;
    match link.recv_message::<Hello>("hello").await {
        Err(GateError::PeerReset(rst)) => assert_eq!(rst.code, RstCode::Unspecified),
        Err(other) => panic!("expected reset, got {other}"),
        Ok(_) => panic!("gate answered a malformed hello"),
    }
    assert_eq!(tg.gate.count_sessions(), 0);

    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn version_mismatch_resets_with_version_error() -> Result<()> {
    let tg = start_default().await?;
    let transport = Transport::connect_tcp(tg.tcp).await?;
    let mut link = Transceiver::new(transport, Duration::from_millis(1_000), 2);

    let hello = Hello {
        version: PROTOCOL_VERSION + 0x0100,
        session_id: String::new(),
        random: Bytes::from(vec![0u8; 32]),
        cipher_suite: CipherSuite::NONE,
        compression: Compression::None,
    };
    link.send_message(0, &hello).await?;
    match link.recv_message::<Hello>("hello").await {
        Err(GateError::PeerReset(rst)) => assert_eq!(rst.code, RstCode::VersionError),
        Err(other) => panic!("expected version reset, got {other}"),
        Ok(_) => panic!("gate accepted a foreign version"),
    }

    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_session_resume_is_rejected() -> Result<()> {
    let tg = start_default().await?;
    let ticket = ResumeTicket {
        session_id: "00".repeat(16),
        user_id: "ghost".into(),
        token: "t".into(),
        recv_seq: 0,
    };

    let transport = Transport::connect_tcp(tg.tcp).await?;
    match connector().resume(transport, &ticket).await {
        Err(e) => assert_eq!(reset_code(&e), Some(RstCode::SessionNotFound)),
        Ok(_) => panic!("resumed a session that never existed"),
    }

    tg.gate.shutdown().await;
    Ok(())
}

// ── Signatures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn signed_key_exchange_both_ways() -> Result<()> {
    let server_key = SigningKey::from_bytes(&[7u8; 32]);
    let client_key = SigningKey::from_bytes(&[9u8; 32]);

    let mut config = test_config();
    config.handshake.signature_algorithm = SignatureAlgorithm::Ed25519;
    config.handshake.signature_private_key = hex::encode(server_key.to_bytes());
    config.handshake.verify_client_signature = true;
    config.handshake.client_public_key = hex::encode(client_key.verifying_key().to_bytes());
    let tg = start(Gate::builder(config)).await?;

    let signed = connector()
        .sign_with(SignatureAlgorithm::Ed25519, client_key.clone())
        .verify_server(server_key.verifying_key());
    let client = connect(&tg, &signed).await?;
    assert!(client.encrypted());
    client.close().await;

    // unsigned client
    let err = connect(&tg, &connector()).await.err().expect("unsigned client should fail");
    assert_eq!(gate_error(&err).and_then(reset_code), Some(RstCode::EncryptFailed));

    // client expecting a different gate key
    let impostor = SigningKey::from_bytes(&[1u8; 32]);
    let wrong = connector()
        .sign_with(SignatureAlgorithm::Ed25519, client_key)
        .verify_server(impostor.verifying_key());
    assert!(connect(&tg, &wrong).await.is_err());

    tg.gate.shutdown().await;
    Ok(())
}

/// Without VERIFY on the client's ChangeCipherSpec the gate skips the hash
/// check and the session still works.
#[tokio::test]
async fn unverified_change_cipher_spec() -> Result<()> {
    let tg = start_default().await?;
    let mut client = connect(&tg, &connector().verify_encryption(false)).await?;
    let session = server_session(&tg, &client).await?;
    assert_eq!(session.state(), SessionState::Active);

    client.send_data("ok").await?;
    assert_eq!(within("data", session.recv_data()).await?, Some(Bytes::from_static(b"ok")));

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}
