use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gtp_core::wire::{BlockCipherMode, CipherSuite, Compression, KeyExchange, MacHash, PaddingMode, SymmetricEncryption};
use gtp_gate::{Event, Gate, GateError, Received, SessionState, Transport, TransportKind};

use crate::*;

fn suite(symmetric: SymmetricEncryption, block_mode: BlockCipherMode, padding: PaddingMode, mac: MacHash) -> CipherSuite {
    CipherSuite { key_exchange: KeyExchange::Ecdhe, symmetric, block_mode, padding, mac }
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Data and events cross in both directions under every cipher family,
/// with bodies on both sides of the compression threshold.
#[tokio::test]
async fn round_trip_across_suites() -> Result<()> {
    use BlockCipherMode as M;
    use MacHash as H;
    use PaddingMode as P;
    use SymmetricEncryption as S;

    let cases = [
        (CipherSuite::default(), Compression::Gzip),
        (suite(S::Aes128, M::Cbc, P::X923, H::Crc64), Compression::None),
        (suite(S::Aes128, M::Ctr, P::None, H::Crc32), Compression::Deflate),
        (suite(S::Aes256, M::Ctr, P::None, H::Blake3), Compression::Zstd),
        (suite(S::Aes128, M::Gcm, P::None, H::None), Compression::Zstd),
        (suite(S::Aes256, M::Gcm, P::None, H::Crc64), Compression::Gzip),
        (suite(S::ChaCha20Poly1305, M::None, P::None, H::Blake3), Compression::Deflate),
        (suite(S::None, M::None, P::None, H::Blake3), Compression::None),
    ];

    let tg = start_default().await?;
    for (suite, compression) in cases {
        let mut client = connect(&tg, &connector().cipher_suite(suite).compression(compression, 64)).await?;
        assert_eq!(client.cipher_suite(), suite);
        let session = server_session(&tg, &client).await?;

        let small = Bytes::from_static(b"ping");
        let large = payload(4096);
        assert_eq!(client.send_data(small.clone()).await?, 0);
        assert_eq!(client.send_data(large.clone()).await?, 1);
        assert_eq!(within("small", session.recv_data()).await?, Some(small.clone()), "{suite}");
        assert_eq!(within("large", session.recv_data()).await?, Some(large.clone()), "{suite}");

        assert_eq!(session.send_data(large.clone())?, 0);
        assert_eq!(session.send_event(Event::new(40, small.clone()))?, 1);
        assert_eq!(within("data", client.recv()).await??, Received::Data(large), "{suite}");
        assert_eq!(within("event", client.recv()).await??, Received::Event(Event::new(40, small)), "{suite}");

        assert_eq!(client.sequences(), (2, 2));
        client.close().await;
        within("session close", session.closed()).await?;
    }

    tg.gate.shutdown().await;
    Ok(())
}

/// One inbound event reaches the inline handler, the channel and a watcher.
#[tokio::test]
async fn event_fan_out() -> Result<()> {
    let (handler_tx, mut handler_rx) = mpsc::unbounded_channel::<Event>();
    let builder = Gate::builder(test_config()).on_state_change(move |session, _old, new| {
        if new == SessionState::Confirmed {
            let tx = handler_tx.clone();
            let _ = session.update_settings(|s| {
                *s = std::mem::take(s).on_event(move |_, event| {
                    let _ = tx.send(event);
                });
                s.recv_event_channel_size = 8;
            });
        }
    });
    let tg = start(builder).await?;

    let mut client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;
    assert!(matches!(
        session.update_settings(|s| s.recv_event_channel_size = 1),
        Err(GateError::IncorrectState(SessionState::Active))
    ));

    let (watch_tx, mut watch_rx) = mpsc::unbounded_channel::<Event>();
    let _watcher = session.watch_event(CancellationToken::new(), move |event| {
        let _ = watch_tx.send(event);
    });

    let event = Event { id: 42, flags: 0x03, body: Bytes::from_static(b"moved") };
    client.send_event(event.clone()).await?;

    assert_eq!(within("handler", handler_rx.recv()).await?, Some(event.clone()));
    assert_eq!(within("channel", session.recv_event()).await?, Some(event.clone()));
    assert_eq!(within("watcher", watch_rx.recv()).await?, Some(event));

    assert!(matches!(client.send_event(Event::new(5, "low")).await, Err(GateError::InvalidEventId(5))));

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disabled_channel_leaves_watchers() -> Result<()> {
    let mut config = test_config();
    config.session.recv_data_channel_size = 0;
    let tg = start(Gate::builder(config)).await?;

    let mut client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let watcher = session.watch_data(CancellationToken::new(), move |data| {
        let _ = tx.send(data);
    });

    client.send_data("seen").await?;
    assert_eq!(within("watcher", rx.recv()).await?, Some(Bytes::from_static(b"seen")));
    assert_eq!(within("recv_data", session.recv_data()).await?, None);

    watcher.terminate().await;
    client.send_data("unseen").await?;
    assert_eq!(within("watcher closed", rx.recv()).await?, None);

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn websocket_transport() -> Result<()> {
    let tg = start_default().await?;

    let transport = Transport::connect_websocket(tg.ws, WS_PATH).await?;
    let mut client = connector().connect(transport).await?;
    assert_eq!(client.info().map(|i| i.kind), Some(TransportKind::WebSocket));

    let session = server_session(&tg, &client).await?;
    assert_eq!(session.transport_kind(), TransportKind::WebSocket);

    client.send_data(payload(10_000)).await?;
    assert_eq!(within("data", session.recv_data()).await?, Some(payload(10_000)));
    session.send_event(Event::new(33, "over ws"))?;
    assert_eq!(within("event", client.recv()).await??, Received::Event(Event::new(33, "over ws")));

    assert!(Transport::connect_websocket(tg.ws, "/elsewhere").await.is_err());

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}

/// An idle link survives as long as the client answers the gate's pings.
#[tokio::test]
async fn heartbeats_keep_idle_link_alive() -> Result<()> {
    let mut config = test_config();
    config.io.timeout_ms = 200;
    config.io.retries = 1;
    config.io.heartbeat_interval_ms = 100;
    let tg = start(Gate::builder(config)).await?;

    let mut client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;

    let sender = std::sync::Arc::clone(&session);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let _ = sender.send_data("still here");
    });

    // our own ping is answered with a pong, which recv skips
    client.heartbeat().await?;
    assert_eq!(within("late data", client.recv()).await??, Received::Data(Bytes::from_static(b"still here")));
    assert_eq!(session.state(), SessionState::Active);

    client.close().await;
    tg.gate.shutdown().await;
    Ok(())
}
