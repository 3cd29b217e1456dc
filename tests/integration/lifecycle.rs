use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gtp_core::wire::RstCode;
use gtp_gate::transceiver::Transceiver;
use gtp_gate::{Gate, GateError, Received, RstError, SessionState, StateChange, Transport, TransportKind};

use crate::*;

fn transitions(changes: &[StateChange]) -> Vec<(SessionState, SessionState)> {
    changes.iter().map(|c| (c.old, c.new)).collect()
}

#[tokio::test]
async fn watchers_follow_session_lifecycle() -> Result<()> {
    let tg = start_default().await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<StateChange>();
    let ctx = CancellationToken::new();
    let watcher = tg.gate.watch(ctx.clone(), move |change| {
        let _ = tx.send(change);
    });

    let client = connect(&tg, &connector()).await?;
    let id = client.id().to_owned();
    let session = server_session(&tg, &client).await?;
    client.close().await;
    within("session close", session.closed()).await?;

    let mut seen = Vec::new();
    while seen.len() < 4 {
        match within("state change", rx.recv()).await? {
            Some(change) => seen.push(change),
            None => break,
        }
    }
    assert!(seen.iter().all(|c| c.session_id == id));
    assert_eq!(
        transitions(&seen),
        vec![
            (SessionState::Birth, SessionState::Handshake),
            (SessionState::Handshake, SessionState::Confirmed),
            (SessionState::Confirmed, SessionState::Active),
            (SessionState::Active, SessionState::Death),
        ]
    );

    ctx.cancel();
    within("watcher stop", watcher.stopped()).await?;
    tg.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn server_close_sends_reason() -> Result<()> {
    let tg = start_default().await?;
    let mut client = connect(&tg, &connector()).await?;
    let session = server_session(&tg, &client).await?;

    session.close(Some(RstError::new(RstCode::SessionDeath, "kicked")));
    match within("reset", client.recv()).await? {
        Err(GateError::PeerReset(rst)) => {
            assert_eq!(rst.code, RstCode::SessionDeath);
            assert_eq!(rst.message, "kicked");
        }
        other => panic!("expected reset, got {other:?}"),
    }

    within("session close", session.closed()).await?;
    assert_eq!(session.state(), SessionState::Death);
    assert!(matches!(session.send_data("late"), Err(GateError::SessionClosed)));
    assert_eq!(tg.gate.count_sessions(), 0);

    tg.gate.shutdown().await;
    Ok(())
}

/// Shutdown resets every session, waits for all tasks and stops accepting.
#[tokio::test]
async fn shutdown_drains_everything() -> Result<()> {
    let tg = start_default().await?;
    let mut a = connect(&tg, &connector()).await?;
    let transport = Transport::connect_websocket(tg.ws, WS_PATH).await?;
    let mut b = connector().connect(transport).await?;
    server_session(&tg, &a).await?;
    server_session(&tg, &b).await?;
    assert_eq!(tg.gate.count_sessions(), 2);

    within("shutdown", tg.gate.shutdown()).await?;
    assert!(tg.gate.is_shutting_down());
    assert_eq!(tg.gate.count_sessions(), 0);

    for client in [&mut a, &mut b] {
        match within("reset", client.recv()).await? {
            Err(e) => assert_eq!(reset_code(&e), Some(RstCode::Shutdown), "{e}"),
            Ok(r) => panic!("unexpected traffic after shutdown: {r:?}"),
        }
    }

    assert!(matches!(tg.gate.start().await, Err(GateError::ShuttingDown)));
    assert!(connect(&tg, &connector()).await.is_err());
    Ok(())
}

/// A listener that fails to bind stops `start` before any accept loop runs.
#[tokio::test]
async fn failed_bind_leaves_no_listener_running() -> Result<()> {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let free = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let tcp_addr = free.local_addr()?;
    drop(free);

    let mut config = test_config();
    config.listen.tcp_address = tcp_addr.to_string();
    config.listen.websocket_address = taken.local_addr()?.to_string();
    let gate = Gate::builder(config).build()?;

    assert!(matches!(gate.start().await, Err(GateError::BindFailed(..))));
    assert!(tokio::net::TcpStream::connect(tcp_addr).await.is_err(), "tcp listener left running");

    within("shutdown", gate.shutdown()).await?;
    Ok(())
}

/// A connection that never says Hello is dropped after the accept timeout.
#[tokio::test]
async fn silent_connection_times_out() -> Result<()> {
    let mut config = test_config();
    config.session.accept_timeout_ms = 200;
    let tg = start(Gate::builder(config)).await?;

    let transport = Transport::connect_tcp(tg.tcp).await?;
    let mut link = Transceiver::new(transport, Duration::from_secs(5), 0);
    assert!(matches!(within("close", link.read_packet()).await?, Err(GateError::ConnectionClosed)));
    assert_eq!(tg.gate.count_sessions(), 0);

    tg.gate.shutdown().await;
    Ok(())
}

// ── Caller-provided transports ────────────────────────────────────────────────

fn duplex_pair() -> (Transport, Transport) {
    let addr = SocketAddr::from(([127, 0, 0, 1], 7100));
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        Transport::stream(Box::new(client), TransportKind::Tcp, addr, addr),
        Transport::stream(Box::new(server), TransportKind::Tcp, addr, addr),
    )
}

#[tokio::test]
async fn accept_over_in_memory_transport() -> Result<()> {
    let gate = Gate::builder(test_config()).build()?;
    let (client_side, server_side) = duplex_pair();

    let acceptor = gate.acceptor();
    let accepted = tokio::spawn(async move { acceptor.accept(server_side).await });
    let mut client = connector().connect(client_side).await?;
    let session = within("accept", accepted).await???;
    assert_eq!(session.id(), client.id());
    assert!(gate.get_session(client.id()).is_some());

    client.send_data("in memory").await?;
    assert_eq!(within("data", session.recv_data()).await?, Some(Bytes::from_static(b"in memory")));
    session.send_data("and back")?;
    assert_eq!(within("reply", client.recv()).await??, Received::Data(Bytes::from_static(b"and back")));

    gate.shutdown().await;
    assert!(session.is_closed());
    Ok(())
}

#[tokio::test]
async fn accept_refused_while_shutting_down() -> Result<()> {
    let gate = Gate::builder(test_config()).build()?;
    gate.shutdown().await;

    let (_client_side, server_side) = duplex_pair();
    assert!(matches!(gate.accept(server_side).await, Err(GateError::ShuttingDown)));
    Ok(())
}
