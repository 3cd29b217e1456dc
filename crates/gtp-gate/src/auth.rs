//! Authentication delegate.

use std::net::SocketAddr;

use crate::transport::TransportKind;

/// What the gate knows about a connection when it asks for authentication.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub session_id: String,
    pub transport: TransportKind,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// The client is resuming an existing session.
    pub resume: bool,
}

/// Decides whether a client may open (or resume) a session.
///
/// An error rejects the handshake with an `auth-failed` reset carrying the
/// error's message.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, conn: &ConnInfo, user_id: &str, token: &str, extensions: &[u8]) -> anyhow::Result<()>;
}

impl<F> Authenticator for F
where
    F: Fn(&ConnInfo, &str, &str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn authenticate(&self, conn: &ConnInfo, user_id: &str, token: &str, extensions: &[u8]) -> anyhow::Result<()> {
        self(conn, user_id, token, extensions)
    }
}
