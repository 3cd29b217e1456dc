//! Connection transports.
//!
//! Byte streams (TCP, TLS over TCP) carry packets back to back and are framed
//! by the `len` field of the packet head. WebSocket connections carry exactly
//! one packet per binary message. Both are split into a reader and a writer
//! half so a session can read and write concurrently.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{self, FramedRead, FramedWrite};

use gtp_core::wire::{WireError, HEAD_SIZE, MAX_PACKET_LEN};

use crate::error::GateError;

/// Any bidirectional byte stream a transport can run over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::WebSocket => "websocket",
        })
    }
}

/// Where a link runs: transport kind and both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub kind: TransportKind,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Splits a byte stream into whole packets using the head's length field.
#[derive(Debug, Default)]
pub struct PacketFramer;

impl codec::Decoder for PacketFramer {
    type Item = BytesMut;
    type Error = GateError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, GateError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < HEAD_SIZE {
            return Err(WireError::Truncated("packet length").into());
        }
        if len > MAX_PACKET_LEN {
            return Err(WireError::PacketTooLarge(len).into());
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len)))
    }
}

impl codec::Encoder<Bytes> for PacketFramer {
    type Error = GateError;

    fn encode(&mut self, packet: Bytes, dst: &mut BytesMut) -> Result<(), GateError> {
        dst.extend_from_slice(&packet);
        Ok(())
    }
}

// ── Reader / Writer ───────────────────────────────────────────────────────────

pub enum PacketReader {
    Stream(FramedRead<ReadHalf<BoxedIo>, PacketFramer>),
    WebSocket(SplitStream<WebSocketStream<BoxedIo>>),
}

impl PacketReader {
    /// Next complete packet, or `None` once the peer has closed.
    ///
    /// Cancel safe: a packet is either returned whole or left buffered.
    pub async fn next_packet(&mut self) -> Result<Option<Bytes>, GateError> {
        match self {
            PacketReader::Stream(framed) => match framed.next().await {
                Some(Ok(packet)) => Ok(Some(packet.freeze())),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
            PacketReader::WebSocket(ws) => loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(Bytes::from(data))),
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                    // pings are answered by tungstenite on the next write
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }
    }
}

pub enum PacketWriter {
    Stream(FramedWrite<WriteHalf<BoxedIo>, PacketFramer>),
    WebSocket(SplitSink<WebSocketStream<BoxedIo>, WsMessage>),
}

impl PacketWriter {
    /// Queue a packet without flushing.
    pub async fn feed(&mut self, packet: Bytes) -> Result<(), GateError> {
        match self {
            PacketWriter::Stream(framed) => framed.feed(packet).await,
            PacketWriter::WebSocket(ws) => Ok(ws.feed(WsMessage::Binary(packet.to_vec())).await?),
        }
    }

    pub async fn flush(&mut self) -> Result<(), GateError> {
        match self {
            PacketWriter::Stream(framed) => framed.flush().await,
            PacketWriter::WebSocket(ws) => Ok(ws.flush().await?),
        }
    }

    /// Flush and close the write half. Errors are ignored; the peer may be gone.
    pub async fn close(&mut self) {
        let _ = match self {
            PacketWriter::Stream(framed) => framed.close().await,
            PacketWriter::WebSocket(ws) => ws.close().await.map_err(GateError::from),
        };
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// A connected, split transport.
pub struct Transport {
    pub reader: PacketReader,
    pub writer: PacketWriter,
    pub kind: TransportKind,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl Transport {
    /// Wrap a byte stream (plain TCP or TLS).
    pub fn stream(io: BoxedIo, kind: TransportKind, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (r, w) = tokio::io::split(io);
        Self {
            reader: PacketReader::Stream(FramedRead::new(r, PacketFramer)),
            writer: PacketWriter::Stream(FramedWrite::new(w, PacketFramer)),
            kind,
            local_addr,
            remote_addr,
        }
    }

    /// Wrap an upgraded WebSocket connection.
    pub fn websocket(ws: WebSocketStream<BoxedIo>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        let (w, r) = ws.split();
        Self {
            reader: PacketReader::WebSocket(r),
            writer: PacketWriter::WebSocket(w),
            kind: TransportKind::WebSocket,
            local_addr,
            remote_addr,
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo { kind: self.kind, local_addr: self.local_addr, remote_addr: self.remote_addr }
    }

    /// Dial a gate over plain TCP.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, GateError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        Ok(Self::stream(Box::new(tcp), TransportKind::Tcp, local, addr))
    }

    /// Dial a gate's WebSocket listener at `path`.
    pub async fn connect_websocket(addr: SocketAddr, path: &str) -> Result<Self, GateError> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        let url = format!("ws://{addr}{path}");
        let (ws, _) = tokio_tungstenite::client_async(url, Box::new(tcp) as BoxedIo).await?;
        Ok(Self::websocket(ws, local, addr))
    }
}

/// Server side WebSocket upgrade, accepting only requests for `path`.
pub async fn accept_websocket(io: BoxedIo, path: &str) -> Result<WebSocketStream<BoxedIo>, GateError> {
    let expected = path.to_owned();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            return Ok(resp);
        }
        let mut err = ErrorResponse::new(Some("not found".into()));
        *err.status_mut() = StatusCode::NOT_FOUND;
        Err(err)
    };
    Ok(tokio_tungstenite::accept_hdr_async(io, check_path).await?)
}

// ── TLS ───────────────────────────────────────────────────────────────────────

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, GateError> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e: std::io::Error| GateError::Tls(e.to_string()))?;
    if certs.is_empty() {
        return Err(GateError::Tls(format!("no certificates in {}", cert_path.display())));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e: std::io::Error| GateError::Tls(e.to_string()))?
        .ok_or_else(|| GateError::Tls(format!("no private key in {}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| GateError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GateError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
