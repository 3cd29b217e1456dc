//! Runs one connection's handshake under the gate's accept timeout.

use std::sync::Arc;
use std::time::Duration;

use gtp_core::wire::RstCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{GateError, RstError};
use crate::gate::GateShared;
use crate::handshake::ServerHandshake;
use crate::session::Session;
use crate::transceiver::Transceiver;
use crate::transport::Transport;

#[derive(Clone)]
pub struct Acceptor {
    shared: Arc<GateShared>,
}

impl Acceptor {
    pub(crate) fn new(shared: Arc<GateShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.shared.tracker
    }

    pub(crate) fn accept_timeout(&self) -> Duration {
        self.shared.config.session.accept_timeout()
    }

    /// Handshake over `transport`.
    ///
    /// On success the session is registered (fresh) or rebound (resume) and
    /// its loop is running. On failure the connection has been closed.
    pub async fn accept(&self, transport: Transport) -> Result<Arc<Session>, GateError> {
        let io = &self.shared.config.io;
        let mut link = Transceiver::new(transport, io.timeout(), io.retries);
        let remote_addr = link.info().remote_addr;

        if self.shared.cancel.is_cancelled() {
            link.send_rst(&RstError::new(RstCode::Shutdown, "gate shutting down")).await;
            link.close().await;
            return Err(GateError::ShuttingDown);
        }

        // panics inside the handshake come back as GateError::Panicked
        let handshake = ServerHandshake::new(Arc::clone(&self.shared), link).run();
        let result = tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(GateError::ShuttingDown),
            res = tokio::time::timeout(self.accept_timeout(), handshake) => match res {
                Ok(res) => res,
                Err(_) => Err(GateError::Timeout("accept")),
            },
        };

        match &result {
            Ok(session) => {
                tracing::info!(%remote_addr, session_id = %session.id(), user_id = %session.user_id(), "handshake complete");
            }
            Err(GateError::Panicked(msg)) => {
                tracing::error!(%remote_addr, panic = %msg, "handshake panicked");
            }
            Err(e) => {
                tracing::warn!(%remote_addr, error = %e, "handshake failed");
            }
        }
        result
    }
}
