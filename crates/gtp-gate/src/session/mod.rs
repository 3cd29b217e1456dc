//! Sessions: the long-lived state behind a client connection.
//!
//! A session outlives its links. When the link drops the session goes
//! Inactive and waits for the client to resume on a new connection; if none
//! arrives within the inactive timeout it dies and leaves the registry.
//!
//! One task per session runs [`Session::run`], pumping the current link:
//! inbound packets are acknowledged, ordered by the synchronizer and handed to
//! handlers, channels and watchers; outbound sequenced messages are drained
//! from the synchronizer whenever `outbound` is notified.

pub mod settings;
mod state;
pub mod watcher;

pub use settings::{DataHandler, EventHandler, SessionSettings};
pub use state::{SessionState, StateChange};
pub use watcher::{Watcher, WatcherList};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use gtp_core::codec::Packet;
use gtp_core::wire::{flags, CipherSuite, Compression, MsgId, Rst, RstCode, MSG_CUSTOMIZE};

use crate::error::{GateError, RstError};
use crate::gate::GateShared;
use crate::synchronizer::{Inbound, SyncError, Synchronizer};
use crate::transceiver::Transceiver;
use crate::transport::{LinkInfo, TransportKind};

/// A typed custom event. Ids start at [`MSG_CUSTOMIZE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: u8,
    /// Message-specific flag bits (low nibble).
    pub flags: u8,
    pub body: Bytes,
}

impl Event {
    pub fn new(id: u8, body: impl Into<Bytes>) -> Self {
        Self { id, flags: 0, body: body.into() }
    }
}

#[derive(Debug, Default)]
struct Identity {
    user_id: String,
    token: String,
}

struct Delivery {
    settings: SessionSettings,
    data_tx: Option<mpsc::Sender<Bytes>>,
    event_tx: Option<mpsc::Sender<Event>>,
}

/// Receivers are created once, when the session first becomes Active and
/// its settings freeze.
struct Receivers {
    data: Option<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    event: Option<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
}

/// How a link ended.
enum LinkEnd {
    /// A resume installed a newer link.
    Replaced,
    /// Transport error, protocol violation or silence.
    Lost(GateError),
    /// The peer sent a reset.
    Reset(RstError),
    /// The session itself was closed.
    Cancelled,
}

pub struct Session {
    id: String,
    shared: Arc<GateShared>,
    cipher_suite: CipherSuite,
    compression: Compression,
    state: Mutex<SessionState>,
    identity: RwLock<Identity>,
    link_info: RwLock<LinkInfo>,

    delivery: Mutex<Delivery>,
    receivers: OnceLock<Receivers>,
    activated: CancellationToken,
    data_watchers: WatcherList<Bytes>,
    event_watchers: WatcherList<Event>,

    sync: Mutex<Synchronizer>,
    outbound: Notify,
    slot: Mutex<Option<(Transceiver, CancellationToken)>>,
    link_cancel: Mutex<CancellationToken>,
    relinked: Notify,
    /// Held for writing by a handshake between Auth and Finished.
    pub(crate) io_pause: Arc<tokio::sync::RwLock<()>>,
    /// Held by the one resume handshake allowed at a time.
    pub(crate) resuming: Arc<tokio::sync::Mutex<()>>,

    started: AtomicBool,
    close_reason: Mutex<Option<RstError>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: String,
        shared: Arc<GateShared>,
        cipher_suite: CipherSuite,
        compression: Compression,
        link_info: LinkInfo,
    ) -> Arc<Self> {
        let settings = SessionSettings::from_config(&shared.config.session);
        let capacity = shared.config.session.synchronizer_capacity;
        let cancel = shared.cancel.child_token();
        Arc::new(Self {
            id,
            cipher_suite,
            compression,
            state: Mutex::new(SessionState::Birth),
            identity: RwLock::new(Identity::default()),
            link_info: RwLock::new(link_info),
            delivery: Mutex::new(Delivery { settings, data_tx: None, event_tx: None }),
            receivers: OnceLock::new(),
            activated: CancellationToken::new(),
            data_watchers: WatcherList::new(),
            event_watchers: WatcherList::new(),
            sync: Mutex::new(Synchronizer::new(capacity)),
            outbound: Notify::new(),
            slot: Mutex::new(None),
            link_cancel: Mutex::new(cancel.child_token()),
            relinked: Notify::new(),
            io_pause: Arc::new(tokio::sync::RwLock::new(())),
            resuming: Arc::new(tokio::sync::Mutex::new(())),
            started: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel,
            done: CancellationToken::new(),
            shared,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> String {
        self.identity.read().user_id.clone()
    }

    pub fn token(&self) -> String {
        self.identity.read().token.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link_info.read().local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.link_info.read().remote_addr
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.link_info.read().kind
    }

    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// `(send_seq, recv_seq)`: next sequence to assign, next expected.
    pub fn sequences(&self) -> (u32, u32) {
        let sync = self.sync.lock();
        (sync.send_seq(), sync.recv_seq())
    }

    pub fn settings(&self) -> SessionSettings {
        self.delivery.lock().settings.clone()
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    /// Change delivery settings. Only allowed before the session goes Active.
    pub fn update_settings(&self, f: impl FnOnce(&mut SessionSettings)) -> Result<(), GateError> {
        let state = self.state.lock();
        if !state.settings_mutable() {
            return Err(GateError::IncorrectState(*state));
        }
        f(&mut self.delivery.lock().settings);
        Ok(())
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Queue application data. Returns its sequence number.
    pub fn send_data(&self, data: impl Into<Bytes>) -> Result<u32, GateError> {
        self.enqueue(MsgId::Payload, 0, data.into())
    }

    /// Queue a custom event. Returns its sequence number.
    pub fn send_event(&self, event: Event) -> Result<u32, GateError> {
        if event.id < MSG_CUSTOMIZE {
            return Err(GateError::InvalidEventId(event.id));
        }
        self.enqueue(MsgId::Custom(event.id), event.flags & flags::MESSAGE_MASK, event.body)
    }

    fn enqueue(&self, msg_id: MsgId, msg_flags: u8, body: Bytes) -> Result<u32, GateError> {
        if self.state() == SessionState::Death {
            return Err(GateError::SessionClosed);
        }
        let seq = self.sync.lock().push(msg_id, msg_flags, body)?;
        self.outbound.notify_one();
        Ok(seq)
    }

    // ── Receiving ─────────────────────────────────────────────────────────────

    /// Next inbound data from the session's data channel.
    ///
    /// Waits for the session to become Active. `None` once the session is
    /// closed, or immediately if the data channel is disabled.
    pub async fn recv_data(&self) -> Option<Bytes> {
        let rx = self.receivers().await?.data.as_ref()?;
        let mut rx = rx.lock().await;
        rx.recv().await
    }

    /// Next inbound custom event. Same rules as [`Session::recv_data`].
    pub async fn recv_event(&self) -> Option<Event> {
        let rx = self.receivers().await?.event.as_ref()?;
        let mut rx = rx.lock().await;
        rx.recv().await
    }

    async fn receivers(&self) -> Option<&Receivers> {
        tokio::select! {
            _ = self.activated.cancelled() => {}
            _ = self.done.cancelled() => {}
        }
        self.receivers.get()
    }

    /// Watch inbound data until `ctx` fires, the watcher is stopped or the
    /// session ends.
    pub fn watch_data(&self, ctx: CancellationToken, handler: impl FnMut(Bytes) + Send + 'static) -> Watcher {
        self.data_watchers.watch(&self.cancel, ctx, &self.shared.tracker, handler)
    }

    pub fn watch_event(&self, ctx: CancellationToken, handler: impl FnMut(Event) + Send + 'static) -> Watcher {
        self.event_watchers.watch(&self.cancel, ctx, &self.shared.tracker, handler)
    }

    // ── Closing ───────────────────────────────────────────────────────────────

    /// Close the session. `reason` is sent to the client as a reset.
    ///
    /// Await [`Session::closed`] to know when teardown has finished.
    pub fn close(&self, reason: Option<RstError>) {
        {
            let mut r = self.close_reason.lock();
            if r.is_none() {
                *r = reason;
            }
        }
        self.cancel.cancel();
        if !self.started.load(Ordering::Acquire) {
            self.set_state(SessionState::Death);
            self.done.cancel();
        }
    }

    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    // ── Handshake hooks ───────────────────────────────────────────────────────

    pub(crate) fn set_state(&self, new: SessionState) {
        let old = {
            let mut state = self.state.lock();
            if *state == SessionState::Death || *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        if new == SessionState::Active {
            self.activate();
        }
        tracing::debug!(session_id = %self.id, %old, %new, "session state changed");
        self.shared.state_changed(self, old, new);
    }

    pub(crate) fn set_identity(&self, user_id: String, token: String) {
        *self.identity.write() = Identity { user_id, token };
    }

    /// Whether everything the client has not yet received can be redelivered.
    pub(crate) fn validate_resume(&self, remote_recv_seq: u32) -> Result<(), SyncError> {
        self.sync.lock().validate(remote_recv_seq)
    }

    /// Rewind the send cursor to the client's position.
    /// Returns `(send_seq, recv_seq)` for Finished.
    pub(crate) fn synchronize(&self, remote_recv_seq: u32) -> Result<(u32, u32), SyncError> {
        let mut sync = self.sync.lock();
        sync.synchronize(remote_recv_seq)?;
        Ok((remote_recv_seq, sync.recv_seq()))
    }

    /// Start the session loop on its first link. Hands the link back if
    /// the session was closed first.
    pub(crate) fn start(self: &Arc<Self>, link: Transceiver) -> Result<(), Transceiver> {
        self.install_link(link)?;
        self.started.store(true, Ordering::Release);
        let session = Arc::clone(self);
        self.shared.tracker.spawn(async move { session.run().await });
        Ok(())
    }

    /// Swap in the link of a successful resume, retiring the current one.
    /// Hands the link back if the session died while the resume ran.
    pub(crate) fn relink(&self, link: Transceiver) -> Result<(), Transceiver> {
        let remote_addr = link.info().remote_addr;
        self.install_link(link)?;
        tracing::info!(session_id = %self.id, %remote_addr, "session resumed");
        Ok(())
    }

    fn install_link(&self, link: Transceiver) -> Result<(), Transceiver> {
        // finish() clears the slot under the same lock after cancelling
        let mut slot = self.slot.lock();
        if self.cancel.is_cancelled() || self.state() == SessionState::Death {
            return Err(link);
        }
        *self.link_info.write() = link.info();
        let token = self.cancel.child_token();
        let prev = std::mem::replace(&mut *self.link_cancel.lock(), token.clone());
        *slot = Some((link, token));
        drop(slot);
        prev.cancel();
        self.relinked.notify_one();
        Ok(())
    }

    fn activate(&self) {
        if self.activated.is_cancelled() {
            return;
        }
        let mut delivery = self.delivery.lock();
        let (data_tx, data_rx) = channel(delivery.settings.recv_data_channel_size);
        let (event_tx, event_rx) = channel(delivery.settings.recv_event_channel_size);
        delivery.data_tx = data_tx;
        delivery.event_tx = event_tx;
        let _ = self.receivers.set(Receivers {
            data: data_rx.map(tokio::sync::Mutex::new),
            event: event_rx.map(tokio::sync::Mutex::new),
        });
        self.activated.cancel();
    }

    // ── Session loop ──────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        while let Some((link, token)) = self.next_link().await {
            self.set_state(SessionState::Active);
            match self.run_link(link, token).await {
                LinkEnd::Replaced => continue,
                LinkEnd::Lost(e) => {
                    tracing::info!(session_id = %self.id, error = %e, "link lost, session inactive");
                    self.set_state(SessionState::Inactive);
                }
                LinkEnd::Reset(rst) => {
                    tracing::info!(session_id = %self.id, reason = %rst, "session reset by client");
                    break;
                }
                LinkEnd::Cancelled => break,
            }
        }
        self.finish();
    }

    /// Wait for a link to pump. `None` when the session should end.
    async fn next_link(&self) -> Option<(Transceiver, CancellationToken)> {
        let deadline = Instant::now() + self.shared.config.session.inactive_timeout();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(link) = self.slot.lock().take() {
                return Some(link);
            }
            tokio::select! {
                _ = self.relinked.notified() => {}
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => {
                    // a resume in flight owns the session until it installs its link or fails
                    let Ok(_reaping) = self.resuming.try_lock() else {
                        tokio::select! {
                            _ = self.relinked.notified() => {}
                            _ = self.cancel.cancelled() => return None,
                            _ = self.resuming.lock() => {}
                        }
                        continue;
                    };
                    tracing::info!(session_id = %self.id, "not resumed within inactive timeout");
                    {
                        let mut r = self.close_reason.lock();
                        if r.is_none() {
                            *r = Some(RstError::new(RstCode::SessionDeath, "inactive timeout"));
                        }
                    }
                    self.cancel.cancel();
                    self.set_state(SessionState::Death);
                    return None;
                }
            }
        }
    }

    async fn run_link(&self, mut link: Transceiver, token: CancellationToken) -> LinkEnd {
        let end = self.pump(&mut link, &token).await;
        if let LinkEnd::Cancelled = end {
            link.send_rst(&self.close_rst()).await;
        }
        link.close().await;
        end
    }

    fn close_rst(&self) -> RstError {
        if let Some(reason) = self.close_reason.lock().clone() {
            return reason;
        }
        if self.shared.cancel.is_cancelled() {
            RstError::new(RstCode::Shutdown, "gate shutting down")
        } else {
            RstError::new(RstCode::Unspecified, "session closed")
        }
    }

    async fn pump(&self, link: &mut Transceiver, token: &CancellationToken) -> LinkEnd {
        let io = &self.shared.config.io;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + io.heartbeat_interval(), io.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(io.link_timeout());
        tokio::pin!(idle);

        // anything queued before this link, or rewound by a resume
        self.outbound.notify_one();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    return if self.cancel.is_cancelled() { LinkEnd::Cancelled } else { LinkEnd::Replaced };
                }

                packet = link.read_packet() => {
                    let packet = match packet {
                        Ok(p) => p,
                        Err(e) => return LinkEnd::Lost(e),
                    };
                    idle.as_mut().reset(Instant::now() + io.link_timeout());
                    let _pause = self.io_pause.read().await;
                    if token.is_cancelled() {
                        continue;
                    }
                    if let Some(end) = self.handle_packet(link, packet).await {
                        return end;
                    }
                }

                _ = self.outbound.notified() => {
                    let _pause = self.io_pause.read().await;
                    if token.is_cancelled() {
                        continue;
                    }
                    if let Err(e) = self.flush_outbound(link).await {
                        return LinkEnd::Lost(e);
                    }
                }

                _ = heartbeat.tick() => {
                    let ack = self.sync.lock().recv_seq();
                    if let Err(e) = link.send(MsgId::Heartbeat, flags::HEARTBEAT_PING, 0, ack, &[]).await {
                        return LinkEnd::Lost(e);
                    }
                }

                _ = &mut idle => return LinkEnd::Lost(GateError::Timeout("link idle")),
            }
        }
    }

    async fn flush_outbound(&self, link: &mut Transceiver) -> Result<(), GateError> {
        loop {
            let (entry, ack) = {
                let mut sync = self.sync.lock();
                match sync.next_unsent() {
                    Some(entry) => (entry, sync.recv_seq()),
                    None => return Ok(()),
                }
            };
            link.send(entry.msg_id, entry.flags | flags::SEQUENCED, entry.seq, ack, &entry.body).await?;
        }
    }

    async fn handle_packet(&self, link: &mut Transceiver, packet: Packet) -> Option<LinkEnd> {
        self.sync.lock().ack(packet.ack);

        match packet.msg_id {
            MsgId::Heartbeat => {
                if packet.has_flag(flags::HEARTBEAT_PING) {
                    let ack = self.sync.lock().recv_seq();
                    if let Err(e) = link.send(MsgId::Heartbeat, flags::HEARTBEAT_PONG, 0, ack, &[]).await {
                        return Some(LinkEnd::Lost(e));
                    }
                }
            }
            MsgId::Rst => {
                return Some(match packet.message::<Rst>() {
                    Ok(rst) => LinkEnd::Reset(rst.into()),
                    Err(e) => LinkEnd::Lost(e.into()),
                });
            }
            MsgId::Payload | MsgId::Custom(_) => {
                let accepted = self.sync.lock().accept(packet.seq);
                match accepted {
                    Ok(Inbound::Deliver) => self.deliver(packet),
                    Ok(Inbound::Duplicate) => {
                        tracing::trace!(session_id = %self.id, seq = packet.seq, "duplicate dropped");
                    }
                    Err(e) => return Some(LinkEnd::Lost(e.into())),
                }
            }
            other => {
                tracing::warn!(session_id = %self.id, msg_id = ?other, "unexpected message on established session");
            }
        }
        None
    }

    fn deliver(&self, packet: Packet) {
        match packet.msg_id {
            MsgId::Payload => self.dispatch_data(packet.body),
            MsgId::Custom(id) => self.dispatch_event(Event {
                id,
                flags: packet.flags & flags::MESSAGE_MASK,
                body: packet.body,
            }),
            _ => {}
        }
    }

    fn dispatch_data(&self, data: Bytes) {
        let (handler, tx) = {
            let d = self.delivery.lock();
            (d.settings.data_handler.clone(), d.data_tx.clone())
        };
        if let Some(handler) = handler {
            handler(self, data.clone());
        }
        if let Some(tx) = tx {
            if let Err(TrySendError::Full(_)) = tx.try_send(data.clone()) {
                tracing::warn!(session_id = %self.id, "data channel full, dropped");
            }
        }
        self.data_watchers.notify(&data);
    }

    fn dispatch_event(&self, event: Event) {
        let (handler, tx) = {
            let d = self.delivery.lock();
            (d.settings.event_handler.clone(), d.event_tx.clone())
        };
        if let Some(handler) = handler {
            handler(self, event.clone());
        }
        if let Some(tx) = tx {
            if let Err(TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!(session_id = %self.id, event_id = event.id, "event channel full, dropped");
            }
        }
        self.event_watchers.notify(&event);
    }

    fn finish(self: &Arc<Self>) {
        self.cancel.cancel();
        self.set_state(SessionState::Death);
        // a link installed after the loop stopped looking is dropped, closing it
        drop(self.slot.lock().take());
        self.shared.registry.remove(&self.id, self);
        {
            let mut d = self.delivery.lock();
            d.data_tx = None;
            d.event_tx = None;
        }
        self.done.cancel();
        tracing::info!(session_id = %self.id, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .field("cipher_suite", &self.cipher_suite)
            .finish()
    }
}

fn channel<T>(size: usize) -> (Option<mpsc::Sender<T>>, Option<mpsc::Receiver<T>>) {
    if size == 0 {
        return (None, None);
    }
    let (tx, rx) = mpsc::channel(size);
    (Some(tx), Some(rx))
}
