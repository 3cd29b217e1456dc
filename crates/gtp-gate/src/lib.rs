//! gtp-gate — the GTP gateway: listeners, handshake, sessions with resume,
//! and a client connector.
//!
//! ```no_run
//! # async fn run() -> Result<(), gtp_gate::GateError> {
//! let config = gtp_core::GateConfig::default();
//! let gate = gtp_gate::Gate::builder(config)
//!     .authenticator(|_: &gtp_gate::ConnInfo, user: &str, token: &str, _: &[u8]| {
//!         anyhow::ensure!(!user.is_empty() && !token.is_empty(), "missing credentials");
//!         Ok(())
//!     })
//!     .build()?;
//! gate.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod auth;
pub mod connector;
pub mod error;
pub mod gate;
pub mod handshake;
mod listener;
pub mod registry;
pub mod session;
pub mod synchronizer;
pub mod transceiver;
pub mod transport;

pub use acceptor::Acceptor;
pub use auth::{Authenticator, ConnInfo};
pub use connector::{ClientSession, Connector, Received, ResumeTicket};
pub use error::{GateError, RstError};
pub use gate::{Gate, GateBuilder, ListenAddrs, StateHandler};
pub use session::{Event, Session, SessionSettings, SessionState, StateChange, Watcher};
pub use transport::{LinkInfo, Transport, TransportKind};
