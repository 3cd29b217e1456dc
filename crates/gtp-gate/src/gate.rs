//! The gate: listeners, the session registry and gate-level watchers.
//!
//! Every task the gate starts (accept loops, handshakes, session loops,
//! watchers) is spawned on one `TaskTracker`, and every cancellation token
//! descends from the gate's root token, so `shutdown` reaches all of them
//! and can wait for them to drain.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::{SigningKey, VerifyingKey};
use gtp_core::crypto;
use gtp_core::wire::SignatureAlgorithm;
use gtp_core::GateConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::acceptor::Acceptor;
use crate::auth::Authenticator;
use crate::error::GateError;
use crate::listener;
use crate::registry::Registry;
use crate::session::{Session, SessionState, StateChange, Watcher, WatcherList};
use crate::transport::{load_tls_acceptor, Transport};

pub type StateHandler = Arc<dyn Fn(&Session, SessionState, SessionState) + Send + Sync>;

/// State shared by the gate, its acceptors and its sessions.
pub(crate) struct GateShared {
    pub(crate) config: GateConfig,
    pub(crate) registry: Registry,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) state_handler: Option<StateHandler>,
    pub(crate) watchers: WatcherList<StateChange>,
    pub(crate) signing_key: Option<SigningKey>,
    pub(crate) client_key: Option<VerifyingKey>,
}

impl GateShared {
    pub(crate) fn new(config: GateConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            authenticator: None,
            state_handler: None,
            watchers: WatcherList::new(),
            signing_key: None,
            client_key: None,
        }
    }

    pub(crate) fn state_changed(&self, session: &Session, old: SessionState, new: SessionState) {
        if let Some(handler) = &self.state_handler {
            handler(session, old, new);
        }
        if !self.watchers.is_empty() {
            self.watchers.notify(&StateChange {
                session_id: session.id().to_owned(),
                user_id: session.user_id(),
                old,
                new,
            });
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct GateBuilder {
    config: GateConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    state_handler: Option<StateHandler>,
}

impl GateBuilder {
    pub fn new(config: GateConfig) -> Self {
        Self { config, authenticator: None, state_handler: None }
    }

    /// Require every client to authenticate. Without an authenticator only
    /// resumes send Auth (to prove they own the session).
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Called inline on every session state transition.
    pub fn on_state_change(mut self, handler: impl Fn(&Session, SessionState, SessionState) + Send + Sync + 'static) -> Self {
        self.state_handler = Some(Arc::new(handler));
        self
    }

    /// Validate the configuration and load keys and certificates.
    pub fn build(self) -> Result<Gate, GateError> {
        self.config.validate()?;
        let h = &self.config.handshake;

        let signing_key = match h.signature_algorithm {
            SignatureAlgorithm::None => None,
            _ => Some(crypto::signing_key_from_hex(&h.signature_private_key)?),
        };
        let client_key = if h.verify_client_signature {
            Some(crypto::verifying_key_from_hex(&h.client_public_key)?)
        } else {
            None
        };

        let l = &self.config.listen;
        let tls = match (&l.tls_cert_path, &l.tls_key_path) {
            (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
            _ => None,
        };

        let mut shared = GateShared::new(self.config);
        shared.authenticator = self.authenticator;
        shared.state_handler = self.state_handler;
        shared.signing_key = signing_key;
        shared.client_key = client_key;

        Ok(Gate { shared: Arc::new(shared), tls })
    }
}

// ── Gate ──────────────────────────────────────────────────────────────────────

/// Addresses the gate actually bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenAddrs {
    pub tcp: Option<SocketAddr>,
    pub websocket: Option<SocketAddr>,
}

pub struct Gate {
    shared: Arc<GateShared>,
    tls: Option<TlsAcceptor>,
}

impl Gate {
    pub fn builder(config: GateConfig) -> GateBuilder {
        GateBuilder::new(config)
    }

    pub fn config(&self) -> &GateConfig {
        &self.shared.config
    }

    /// Bind the configured listeners and start accepting.
    ///
    /// Every listener is bound before any accept loop starts, so a failed
    /// bind leaves nothing running.
    pub async fn start(&self) -> Result<ListenAddrs, GateError> {
        if self.shared.cancel.is_cancelled() {
            return Err(GateError::ShuttingDown);
        }
        let l = &self.shared.config.listen;

        let tcp = match l.tcp_address.as_str() {
            "" => None,
            addr => Some(bind(addr).await?),
        };
        let websocket = match l.websocket_address.as_str() {
            "" => None,
            addr => Some(bind(addr).await?),
        };
        if tcp.is_none() && websocket.is_none() {
            return Err(gtp_core::config::ConfigError::NoListener.into());
        }

        let mut addrs = ListenAddrs::default();
        if let Some((listener, local)) = tcp {
            tracing::info!(addr = %local, tls = self.tls.is_some(), "tcp listener started");
            self.shared.tracker.spawn(listener::serve_tcp(listener, self.acceptor(), self.tls.clone()));
            addrs.tcp = Some(local);
        }
        if let Some((listener, local)) = websocket {
            tracing::info!(addr = %local, path = %l.websocket_path, tls = self.tls.is_some(), "websocket listener started");
            self.shared.tracker.spawn(listener::serve_websocket(
                listener,
                self.acceptor(),
                self.tls.clone(),
                l.websocket_path.clone(),
            ));
            addrs.websocket = Some(local);
        }
        Ok(addrs)
    }

    /// Run a handshake over a connection obtained elsewhere.
    pub async fn accept(&self, transport: Transport) -> Result<Arc<Session>, GateError> {
        self.acceptor().accept(transport).await
    }

    pub fn acceptor(&self) -> Acceptor {
        Acceptor::new(Arc::clone(&self.shared))
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.registry.get(id)
    }

    /// Visit sessions until `f` returns false.
    pub fn range_sessions(&self, f: impl FnMut(&Arc<Session>) -> bool) {
        self.shared.registry.range(f)
    }

    pub fn each_sessions(&self, f: impl FnMut(&Arc<Session>)) {
        self.shared.registry.each(f)
    }

    pub fn count_sessions(&self) -> i64 {
        self.shared.registry.count()
    }

    /// Subscribe to session state changes until `ctx` fires, the watcher is
    /// stopped or the gate shuts down.
    pub fn watch(&self, ctx: CancellationToken, handler: impl FnMut(StateChange) + Send + 'static) -> Watcher {
        self.shared.watchers.watch(&self.shared.cancel, ctx, &self.shared.tracker, handler)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub fn is_shutting_down(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop accepting, reset every session with `shutdown` and wait for all
    /// tasks to finish.
    pub async fn shutdown(&self) {
        tracing::info!(sessions = self.count_sessions(), "gate shutting down");
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        tracing::info!("gate stopped");
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("sessions", &self.count_sessions())
            .field("tls", &self.tls.is_some())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Bind `addr` and report the address actually bound.
async fn bind(addr: &str) -> Result<(TcpListener, SocketAddr), GateError> {
    let addr: SocketAddr = addr.parse().map_err(|_| gtp_core::config::ConfigError::BadAddress {
        field: "listen",
        value: addr.to_owned(),
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| GateError::BindFailed(addr, e))?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}
