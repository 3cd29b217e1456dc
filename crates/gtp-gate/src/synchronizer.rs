//! Sequence numbers and the redelivery cache.
//!
//! Every sequenced message (payload or custom event) gets the next send
//! sequence number and stays cached until the peer acknowledges it. A resume
//! rewinds the send cursor to the peer's receive sequence so everything it
//! missed goes out again through the new codec.
//!
//! Sequence numbers wrap; all comparisons use wrapping distance.

use std::collections::VecDeque;

use bytes::Bytes;
use gtp_core::wire::MsgId;
use thiserror::Error;

/// A sequenced message kept for redelivery. Stored as plaintext body so it
/// can be re-encoded with whatever codec is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced {
    pub seq: u32,
    pub msg_id: MsgId,
    pub flags: u8,
    pub body: Bytes,
}

/// Outcome of checking an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// In order: deliver it.
    Deliver,
    /// Already delivered before a resume: drop it.
    Duplicate,
}

#[derive(Debug)]
pub struct Synchronizer {
    send_seq: u32,
    recv_seq: u32,
    cache: VecDeque<Sequenced>,
    /// Index into `cache` of the first entry not yet written to the link.
    cursor: usize,
    capacity: usize,
}

fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

impl Synchronizer {
    pub fn new(capacity: usize) -> Self {
        Self {
            send_seq: 0,
            recv_seq: 0,
            cache: VecDeque::with_capacity(capacity.min(1024)),
            cursor: 0,
            capacity: capacity.max(1),
        }
    }

    /// Next sequence number this side will assign.
    pub fn send_seq(&self) -> u32 {
        self.send_seq
    }

    /// Next sequence number this side expects from the peer.
    pub fn recv_seq(&self) -> u32 {
        self.recv_seq
    }

    /// Assign a sequence number and queue for sending.
    ///
    /// When the cache is full the oldest entry is evicted, but only if it has
    /// already been written; unsent entries are never dropped.
    pub fn push(&mut self, msg_id: MsgId, flags: u8, body: Bytes) -> Result<u32, SyncError> {
        if self.cache.len() >= self.capacity {
            if self.cursor == 0 {
                return Err(SyncError::QueueFull(self.capacity));
            }
            self.cache.pop_front();
            self.cursor -= 1;
        }
        let seq = self.send_seq;
        self.cache.push_back(Sequenced { seq, msg_id, flags, body });
        self.send_seq = self.send_seq.wrapping_add(1);
        Ok(seq)
    }

    /// Take the next entry to write, advancing the cursor.
    pub fn next_unsent(&mut self) -> Option<Sequenced> {
        let entry = self.cache.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(entry)
    }

    /// Drop every cached entry the peer has acknowledged (`seq < ack`).
    pub fn ack(&mut self, ack: u32) {
        while let Some(front) = self.cache.front() {
            if !before(front.seq, ack) {
                break;
            }
            self.cache.pop_front();
            self.cursor = self.cursor.saturating_sub(1);
        }
    }

    /// Check an inbound sequence number and advance `recv_seq` when in order.
    pub fn accept(&mut self, seq: u32) -> Result<Inbound, SyncError> {
        if seq == self.recv_seq {
            self.recv_seq = self.recv_seq.wrapping_add(1);
            Ok(Inbound::Deliver)
        } else if before(seq, self.recv_seq) {
            Ok(Inbound::Duplicate)
        } else {
            Err(SyncError::Gap { expected: self.recv_seq, got: seq })
        }
    }

    /// Whether everything from `remote_recv_seq` on can still be redelivered.
    pub fn validate(&self, remote_recv_seq: u32) -> Result<(), SyncError> {
        let oldest = self.cache.front().map_or(self.send_seq, |e| e.seq);
        if before(remote_recv_seq, oldest) || before(self.send_seq, remote_recv_seq) {
            return Err(SyncError::OutOfWindow { remote: remote_recv_seq, oldest, next: self.send_seq });
        }
        Ok(())
    }

    /// Rewind for redelivery starting at `remote_recv_seq`.
    pub fn synchronize(&mut self, remote_recv_seq: u32) -> Result<(), SyncError> {
        self.validate(remote_recv_seq)?;
        self.ack(remote_recv_seq);
        self.cursor = 0;
        Ok(())
    }

    /// Adopt the sequence numbers agreed in Finished (client side).
    pub fn reset(&mut self, send_seq: u32, recv_seq: u32) {
        self.cache.clear();
        self.cursor = 0;
        self.send_seq = send_seq;
        self.recv_seq = recv_seq;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("send queue full ({0} unsent messages)")]
    QueueFull(usize),

    #[error("sequence gap: expected {expected}, got {got}")]
    Gap { expected: u32, got: u32 },

    #[error("peer receive sequence {remote} outside redelivery window [{oldest}, {next}]")]
    OutOfWindow { remote: u32, oldest: u32, next: u32 },
}
