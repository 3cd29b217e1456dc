//! Configuration for a GTP gate.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GTP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gtp/config.toml
//!   3. ~/.config/gtp/config.toml
//!
//! Delegates (authenticator, state-change handler) are code, not config;
//! they are passed to the gate builder.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError, DEFAULT_THRESHOLD};
use crate::crypto::{self, CryptoError};
use crate::wire::{CipherSuite, Compression, NamedCurve, SignatureAlgorithm};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub listen: ListenConfig,
    pub io: IoConfig,
    pub handshake: HandshakeConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// TCP listen address. Empty = no TCP listener.
    pub tcp_address: String,
    /// WebSocket listen address. Empty = no WebSocket listener.
    pub websocket_address: String,
    /// Request path accepted for WebSocket upgrades.
    pub websocket_path: String,
    /// PEM certificate chain. Set together with `tls_key_path` to enable TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Per read/write timeout.
    pub timeout_ms: u64,
    /// Retries after a timed-out read or flush.
    pub retries: u32,
    /// Interval between heartbeat pings on an active session.
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Honor the cipher suite proposed by the client.
    pub agree_client_cipher_suite: bool,
    /// Honor the compression proposed by the client.
    pub agree_client_compression: bool,
    pub cipher_suite: CipherSuite,
    pub compression: Compression,
    /// Bodies smaller than this go out uncompressed.
    pub compression_threshold: usize,
    pub named_curve: NamedCurve,
    /// Algorithm used to sign the server key exchange. `none` = unsigned.
    pub signature_algorithm: SignatureAlgorithm,
    /// Hex-encoded 32-byte private key for `signature_algorithm`.
    pub signature_private_key: String,
    /// Require and verify a client signature on its key exchange.
    pub verify_client_signature: bool,
    /// Hex-encoded 32-byte public key used to verify client signatures.
    pub client_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on one connection's whole handshake.
    pub accept_timeout_ms: u64,
    /// How long a session without a link stays resumable.
    pub inactive_timeout_ms: u64,
    /// Inbound data channel depth. 0 = no channel delivery.
    pub recv_data_channel_size: usize,
    /// Inbound event channel depth. 0 = no channel delivery.
    pub recv_event_channel_size: usize,
    /// Sequenced messages kept for redelivery until acknowledged.
    pub synchronizer_capacity: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp_address: "0.0.0.0:7100".into(),
            websocket_address: String::new(),
            websocket_path: "/".into(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            retries: 3,
            heartbeat_interval_ms: 10_000,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            agree_client_cipher_suite: true,
            agree_client_compression: true,
            cipher_suite: CipherSuite::default(),
            compression: Compression::Gzip,
            compression_threshold: DEFAULT_THRESHOLD,
            named_curve: NamedCurve::X25519,
            signature_algorithm: SignatureAlgorithm::None,
            signature_private_key: String::new(),
            verify_client_signature: false,
            client_public_key: String::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accept_timeout_ms: 5_000,
            inactive_timeout_ms: 60_000,
            recv_data_channel_size: 1024,
            recv_event_channel_size: 1024,
            synchronizer_capacity: 1024,
        }
    }
}

impl IoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence after which a link counts as lost: `timeout × (retries + 1)`.
    pub fn link_timeout(&self) -> Duration {
        self.timeout() * (self.retries + 1)
    }
}

impl SessionConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.inactive_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gtp")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("no listener configured")]
    NoListener,
    #[error("{field}: invalid socket address {value:?}")]
    BadAddress { field: &'static str, value: String },
    #[error("tls_cert_path and tls_key_path must be set together")]
    TlsIncomplete,
    #[error("cipher suite: {0}")]
    CipherSuite(#[from] CodecError),
    #[error("{field}: {source}")]
    Key { field: &'static str, source: CryptoError },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GateConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GateConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GTP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&GateConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GTP_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("GTP_LISTEN__TCP_ADDRESS") {
            self.listen.tcp_address = v;
        }
        if let Some(v) = var("GTP_LISTEN__WEBSOCKET_ADDRESS") {
            self.listen.websocket_address = v;
        }
        if let Some(v) = var("GTP_IO__TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.io.timeout_ms = ms;
            }
        }
        if let Some(v) = var("GTP_SESSION__INACTIVE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.session.inactive_timeout_ms = ms;
            }
        }
    }

    /// Check everything that would otherwise fail after listening started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.listen;
        if l.tcp_address.is_empty() && l.websocket_address.is_empty() {
            return Err(ConfigError::NoListener);
        }
        for (field, value) in [("listen.tcp_address", &l.tcp_address), ("listen.websocket_address", &l.websocket_address)] {
            if !value.is_empty() && value.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::BadAddress { field, value: value.clone() });
            }
        }
        if l.tls_cert_path.is_some() != l.tls_key_path.is_some() {
            return Err(ConfigError::TlsIncomplete);
        }

        let h = &self.handshake;
        codec::params(&h.cipher_suite)?;
        if h.signature_algorithm != SignatureAlgorithm::None {
            crypto::signing_key_from_hex(&h.signature_private_key)
                .map_err(|source| ConfigError::Key { field: "handshake.signature_private_key", source })?;
        }
        if h.verify_client_signature {
            crypto::verifying_key_from_hex(&h.client_public_key)
                .map_err(|source| ConfigError::Key { field: "handshake.client_public_key", source })?;
        }

        for (field, value) in [
            ("io.timeout_ms", self.io.timeout_ms),
            ("io.heartbeat_interval_ms", self.io.heartbeat_interval_ms),
            ("session.accept_timeout_ms", self.session.accept_timeout_ms),
            ("session.inactive_timeout_ms", self.session.inactive_timeout_ms),
            ("session.synchronizer_capacity", self.session.synchronizer_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(field));
            }
        }
        Ok(())
    }
}
