//! Error types for the gate.

use std::fmt;
use std::net::SocketAddr;

use gtp_core::codec::CodecError;
use gtp_core::config::ConfigError;
use gtp_core::crypto::CryptoError;
use gtp_core::wire::{MsgId, Rst, RstCode, WireError};
use thiserror::Error;

use crate::session::SessionState;
use crate::synchronizer::SyncError;

const MAX_RST_MESSAGE: usize = u16::MAX as usize;

/// A reset with a machine-readable code, sent to or received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstError {
    pub code: RstCode,
    pub message: String,
}

impl RstError {
    pub fn new(code: RstCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// The wire form. Messages too long for the field are cut on a char
    /// boundary.
    pub fn to_message(&self) -> Rst {
        let mut end = self.message.len().min(MAX_RST_MESSAGE);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }
        Rst { code: self.code, message: self.message[..end].to_owned() }
    }
}

impl From<Rst> for RstError {
    fn from(rst: Rst) -> Self {
        Self { code: rst.code, message: rst.message }
    }
}

impl fmt::Display for RstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for RstError {}

/// Errors that can occur in the gate, its sessions and the client connector.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Handshake failure reported to the peer with this code.
    #[error("handshake failed: {0}")]
    Handshake(RstError),

    /// The peer sent a reset.
    #[error("reset by peer: {0}")]
    PeerReset(RstError),

    #[error("unexpected message {got:?}, expected {expected:?}")]
    UnexpectedMessage { expected: MsgId, got: MsgId },

    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("incorrect session state: {0}")]
    IncorrectState(SessionState),

    #[error("session closed")]
    SessionClosed,

    #[error("gate is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("custom event id {0} is below the custom range")]
    InvalidEventId(u8),

    #[error("handshake panicked: {0}")]
    Panicked(String),
}

impl GateError {
    /// Reset code to send to the peer when this error ends a handshake.
    pub fn rst_code(&self) -> RstCode {
        match self {
            GateError::Handshake(rst) => rst.code,
            // malformed frames are not a cipher problem
            GateError::Codec(CodecError::Wire(_)) => RstCode::Unspecified,
            GateError::Codec(_) | GateError::Crypto(_) => RstCode::EncryptFailed,
            GateError::ShuttingDown => RstCode::Shutdown,
            GateError::Panicked(_) => RstCode::ServerInternalError,
            _ => RstCode::Unspecified,
        }
    }

    /// Whether sending a reset for this error is pointless because the
    /// connection is already gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, GateError::ConnectionClosed | GateError::Io(_) | GateError::WebSocket(_))
    }
}

impl From<RstError> for GateError {
    fn from(rst: RstError) -> Self {
        GateError::Handshake(rst)
    }
}

impl From<WireError> for GateError {
    fn from(err: WireError) -> Self {
        GateError::Codec(err.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GateError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GateError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rst_error_display() {
        let err = RstError::new(RstCode::ContinueFailed, "gap too large");
        assert_eq!(err.to_string(), "continue-failed: gap too large");
        assert_eq!(RstError::new(RstCode::Shutdown, "").to_string(), "shutdown");
    }

    #[test]
    fn rst_codes_for_errors() {
        assert_eq!(GateError::from(RstError::new(RstCode::AuthFailed, "x")).rst_code(), RstCode::AuthFailed);
        assert_eq!(GateError::Codec(CodecError::MacMismatch).rst_code(), RstCode::EncryptFailed);
        assert_eq!(GateError::Timeout("hello").rst_code(), RstCode::Unspecified);
        assert!(GateError::ConnectionClosed.is_disconnect());
        let truncated = GateError::Codec(CodecError::Wire(WireError::Truncated("hello.random")));
        assert_eq!(truncated.rst_code(), RstCode::Unspecified);
    }

    #[test]
    fn long_rst_message_cut_on_char_boundary() {
        let err = RstError::new(RstCode::AuthFailed, format!("{}é", "a".repeat(65534)));
        let rst = err.to_message();
        assert_eq!(rst.message.len(), 65534);
        assert!(rst.message.chars().all(|c| c == 'a'));
        assert!(gtp_core::wire::Message::to_bytes(&rst).is_ok());
    }

    #[test]
    fn rst_message_round_trip() {
        let err = RstError::new(RstCode::VersionError, "want 0x0100");
        assert_eq!(RstError::from(err.to_message()), err);
    }
}
