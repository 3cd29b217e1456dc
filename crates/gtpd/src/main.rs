//! gtpd — standalone GTP gateway.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use gtp_core::GateConfig;
use gtp_gate::Gate;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match GateConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = GateConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GateConfig::default()
    });

    let gate = Gate::builder(config).build().context("invalid gate configuration")?;
    let addrs = gate.start().await.context("failed to start listeners")?;
    tracing::info!(tcp = ?addrs.tcp, websocket = ?addrs.websocket, "gtpd started");

    let watch_ctx = CancellationToken::new();
    let _watcher = gate.watch(watch_ctx.clone(), |change| {
        tracing::debug!(
            session_id = %change.session_id,
            user_id = %change.user_id,
            old = %change.old,
            new = %change.new,
            "session state changed"
        );
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("ctrl-c received");

    watch_ctx.cancel();
    gate.shutdown().await;
    Ok(())
}
