//! gtp-core — wire format, codec pipeline and cryptographic primitives of the
//! GTP gateway protocol. No async runtime; every other GTP crate depends on
//! this one.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod wire;

pub use config::GateConfig;
pub use wire::{CipherSuite, Compression, MsgId, RstCode};
