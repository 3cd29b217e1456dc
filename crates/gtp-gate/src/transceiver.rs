//! A transport paired with its packet encoder and decoder.
//!
//! Starts out with plain codecs; the handshake swaps in the negotiated ones
//! one direction at a time, right after each side's ChangeCipherSpec.

use std::time::Duration;

use bytes::Bytes;
use gtp_core::codec::{Decoder, Encoder, Packet};
use gtp_core::wire::{flags, Message, MsgId, Rst};

use crate::error::{GateError, RstError};
use crate::transport::{LinkInfo, Transport};

pub struct Transceiver {
    transport: Transport,
    encoder: Encoder,
    decoder: Decoder,
    timeout: Duration,
    retries: u32,
}

impl Transceiver {
    pub fn new(transport: Transport, timeout: Duration, retries: u32) -> Self {
        Self { transport, encoder: Encoder::plain(), decoder: Decoder::plain(), timeout, retries }
    }

    pub fn info(&self) -> LinkInfo {
        self.transport.info()
    }

    /// Outbound packets from now on go through `encoder`.
    pub fn install_encoder(&mut self, encoder: Encoder) {
        self.encoder = encoder;
    }

    /// Inbound packets from now on go through `decoder`.
    pub fn install_decoder(&mut self, decoder: Decoder) {
        self.decoder = decoder;
    }

    pub fn is_encrypted(&self) -> bool {
        self.encoder.is_encrypted()
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    /// Encode and write one packet. Each write attempt is bounded by the I/O
    /// timeout and retried up to the configured count.
    pub async fn send(&mut self, msg_id: MsgId, msg_flags: u8, seq: u32, ack: u32, body: &[u8]) -> Result<(), GateError> {
        let packet = self.encoder.encode(msg_id, msg_flags, seq, ack, body)?;
        tracing::trace!(?msg_id, len = packet.len(), seq, ack, "send packet");
        self.write(packet).await
    }

    /// Send an unsequenced handshake or control message.
    pub async fn send_message<M: Message>(&mut self, msg_flags: u8, msg: &M) -> Result<(), GateError> {
        self.send(M::ID, msg_flags, 0, 0, &msg.to_bytes()?).await
    }

    async fn write(&mut self, packet: Bytes) -> Result<(), GateError> {
        let writer = &mut self.transport.writer;

        let mut queued = false;
        for _ in 0..=self.retries {
            if let Ok(res) = tokio::time::timeout(self.timeout, writer.feed(packet.clone())).await {
                res?;
                queued = true;
                break;
            }
        }
        if !queued {
            return Err(GateError::Timeout("send"));
        }

        for attempt in 0..=self.retries {
            match tokio::time::timeout(self.timeout, writer.flush()).await {
                Ok(res) => return res,
                Err(_) => tracing::debug!(attempt, "flush timed out"),
            }
        }
        Err(GateError::Timeout("send"))
    }

    /// Tell the peer why the connection is ending. Failures are logged only.
    pub async fn send_rst(&mut self, err: &RstError) {
        if let Err(e) = self.send_message(0, &err.to_message()).await {
            tracing::debug!(error = %e, code = %err.code, "failed to send rst");
        }
    }

    pub async fn close(&mut self) {
        self.transport.writer.close().await;
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    /// Next decoded packet with no deadline. Cancel safe.
    pub async fn read_packet(&mut self) -> Result<Packet, GateError> {
        match self.transport.reader.next_packet().await? {
            Some(raw) => {
                let packet = self.decoder.decode(&raw)?;
                tracing::trace!(msg_id = ?packet.msg_id, len = raw.len(), seq = packet.seq, ack = packet.ack, "recv packet");
                Ok(packet)
            }
            None => Err(GateError::ConnectionClosed),
        }
    }

    /// Wait for a message of type `M` during the handshake step `stage`.
    ///
    /// Returns the message and its message-specific flag bits. A reset from
    /// the peer surfaces as [`GateError::PeerReset`]; any other message is
    /// a protocol violation.
    pub async fn recv_message<M: Message>(&mut self, stage: &'static str) -> Result<(M, u8), GateError> {
        for _ in 0..=self.retries {
            let packet = match tokio::time::timeout(self.timeout, self.read_packet()).await {
                Ok(res) => res?,
                Err(_) => continue,
            };
            if packet.msg_id == MsgId::Rst && M::ID != MsgId::Rst {
                let rst: Rst = packet.message()?;
                return Err(GateError::PeerReset(rst.into()));
            }
            if packet.msg_id != M::ID {
                return Err(GateError::UnexpectedMessage { expected: M::ID, got: packet.msg_id });
            }
            let msg = packet.message::<M>()?;
            return Ok((msg, packet.flags & flags::MESSAGE_MASK));
        }
        Err(GateError::Timeout(stage))
    }
}
