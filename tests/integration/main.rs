//! GTP integration test harness.
//!
//! Every test starts its own gate on loopback ports picked by the OS and
//! talks to it with the client connector, so tests run in parallel without
//! any external setup:
//!
//!   cargo test --test integration
//!
//! Timeouts are shortened so failure paths finish in well under a second.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use gtp_core::GateConfig;
use gtp_gate::{ClientSession, Connector, Gate, GateBuilder, GateError, Session, SessionState, Transport};

mod handshake;
mod lifecycle;
mod resume;
mod traffic;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WS_PATH: &str = "/gtp";

/// A gate under test and the addresses it bound.
pub struct TestGate {
    pub gate: Gate,
    pub tcp: SocketAddr,
    pub ws: SocketAddr,
}

/// Loopback listeners on ephemeral ports with short timeouts.
pub fn test_config() -> GateConfig {
    let mut config = GateConfig::default();
    config.listen.tcp_address = "127.0.0.1:0".into();
    config.listen.websocket_address = "127.0.0.1:0".into();
    config.listen.websocket_path = WS_PATH.into();
    config.io.timeout_ms = 1_000;
    config.io.retries = 2;
    config.io.heartbeat_interval_ms = 500;
    config.session.accept_timeout_ms = 3_000;
    config.session.inactive_timeout_ms = 5_000;
    config
}

pub async fn start(builder: GateBuilder) -> Result<TestGate> {
    let gate = builder.build().context("gate build")?;
    let addrs = gate.start().await.context("gate start")?;
    Ok(TestGate {
        tcp: addrs.tcp.context("tcp listener not bound")?,
        ws: addrs.websocket.context("websocket listener not bound")?,
        gate,
    })
}

pub async fn start_default() -> Result<TestGate> {
    start(Gate::builder(test_config())).await
}

pub fn connector() -> Connector {
    Connector::new().timeout(Duration::from_millis(1_000), 2)
}

/// Dial the gate over TCP and run a fresh handshake.
pub async fn connect(tg: &TestGate, connector: &Connector) -> Result<ClientSession> {
    let transport = Transport::connect_tcp(tg.tcp).await?;
    Ok(connector.connect(transport).await?)
}

/// Poll `check` until it holds, failing after three seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// The gate side of a client session, once its loop has gone Active.
pub async fn server_session(tg: &TestGate, client: &ClientSession) -> Result<Arc<Session>> {
    let id = client.id().to_owned();
    wait_until("session registered", || tg.gate.get_session(&id).is_some()).await?;
    let session = tg.gate.get_session(&id).context("session vanished")?;
    wait_until("session active", || session.state() == SessionState::Active).await?;
    Ok(session)
}

/// Bound a future that is expected to finish promptly.
pub async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(3), fut)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

/// The reset code carried by a handshake or session error.
pub fn reset_code(err: &GateError) -> Option<gtp_core::wire::RstCode> {
    match err {
        GateError::PeerReset(rst) | GateError::Handshake(rst) => Some(rst.code),
        _ => None,
    }
}

/// Downcast an anyhow error from the harness back to the gate error.
pub fn gate_error(err: &anyhow::Error) -> Option<&GateError> {
    err.downcast_ref::<GateError>()
}
