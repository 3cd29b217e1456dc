//! Accept loops for the TCP and WebSocket listeners.
//!
//! Each accepted connection gets its own task for the TLS and WebSocket
//! upgrades and the handshake. Failures are logged and the connection is
//! dropped; they never end the accept loop.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::acceptor::Acceptor;
use crate::error::GateError;
use crate::transport::{accept_websocket, BoxedIo, Transport, TransportKind};

pub(crate) async fn serve_tcp(listener: TcpListener, acceptor: Acceptor, tls: Option<TlsAcceptor>) {
    let cancel = acceptor.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("tcp listener shutting down");
                return;
            }

            result = listener.accept() => {
                let (tcp, remote_addr) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                tracing::debug!(%remote_addr, "tcp connection accepted");

                let conn = acceptor.clone();
                let tls = tls.clone();
                acceptor.tracker().spawn(async move {
                    let accept_timeout = conn.accept_timeout();
                    let transport = match tokio::time::timeout(accept_timeout, open_stream(tcp, remote_addr, tls)).await {
                        Ok(Ok(t)) => t,
                        Ok(Err(e)) => {
                            tracing::warn!(%remote_addr, error = %e, "connection setup failed");
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(%remote_addr, "connection setup timed out");
                            return;
                        }
                    };
                    let _ = conn.accept(transport).await;
                });
            }
        }
    }
}

pub(crate) async fn serve_websocket(listener: TcpListener, acceptor: Acceptor, tls: Option<TlsAcceptor>, path: String) {
    let cancel = acceptor.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("websocket listener shutting down");
                return;
            }

            result = listener.accept() => {
                let (tcp, remote_addr) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket accept failed");
                        continue;
                    }
                };
                tracing::debug!(%remote_addr, "websocket connection accepted");

                let conn = acceptor.clone();
                let tls = tls.clone();
                let path = path.clone();
                acceptor.tracker().spawn(async move {
                    let accept_timeout = conn.accept_timeout();
                    let transport = match tokio::time::timeout(accept_timeout, open_websocket(tcp, remote_addr, tls, &path)).await {
                        Ok(Ok(t)) => t,
                        Ok(Err(e)) => {
                            tracing::warn!(%remote_addr, error = %e, "websocket upgrade failed");
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(%remote_addr, "websocket upgrade timed out");
                            return;
                        }
                    };
                    let _ = conn.accept(transport).await;
                });
            }
        }
    }
}

async fn wrap_tls(tcp: TcpStream, tls: Option<TlsAcceptor>) -> Result<(BoxedIo, bool), GateError> {
    tcp.set_nodelay(true)?;
    match tls {
        Some(tls) => {
            let stream = tls.accept(tcp).await.map_err(|e| GateError::Tls(e.to_string()))?;
            Ok((Box::new(stream), true))
        }
        None => Ok((Box::new(tcp), false)),
    }
}

async fn open_stream(tcp: TcpStream, remote_addr: SocketAddr, tls: Option<TlsAcceptor>) -> Result<Transport, GateError> {
    let local_addr = tcp.local_addr()?;
    let (io, secure) = wrap_tls(tcp, tls).await?;
    let kind = if secure { TransportKind::Tls } else { TransportKind::Tcp };
    Ok(Transport::stream(io, kind, local_addr, remote_addr))
}

async fn open_websocket(
    tcp: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    path: &str,
) -> Result<Transport, GateError> {
    let local_addr = tcp.local_addr()?;
    let (io, _) = wrap_tls(tcp, tls).await?;
    let ws = accept_websocket(io, path).await?;
    Ok(Transport::websocket(ws, local_addr, remote_addr))
}
