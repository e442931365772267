//! The per-session upgrade state machine.
//!
//! A [`Socket`] owns exactly one active transport and, while an upgrade is
//! in flight, one candidate. Every transport bound to the socket publishes
//! onto the same channel, which a single pump task drains into
//! [`Socket::handle_transport_event`]. All state lives behind one mutex so
//! the upgrade handoff is a single critical section.
//!
//! Lock order is socket, then transport. Close hooks run after the socket
//! lock is released.

use crate::packet::{Handshake, Packet, Sid, PROBE};
use crate::transport::{
    CloseReason, EventSink, Transport, TransportEvent, TransportId, TransportKind,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Upgrading,
    Upgraded,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub upgrade_timeout: Duration,
    /// Variants advertised in the handshake and accepted by `maybe_upgrade`.
    pub upgrades: Vec<TransportKind>,
}

/// What a socket reports to its listeners.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    Message(String),
    /// The candidate answered the probe; carries the candidate's name.
    Upgrading(&'static str),
    Upgrade {
        discarded: Arc<dyn Transport>,
    },
    Close(CloseReason),
}

/// Runs once when the socket reaches its terminal close.
pub type CloseHook = Box<dyn FnOnce(&Sid, &CloseReason) + Send>;

/// Why `maybe_upgrade` refused a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeRejected {
    AlreadyUpgraded,
    UpgradeInProgress,
    NotAllowed {
        from: TransportKind,
        to: TransportKind,
    },
    UnknownSid(Sid),
    Closed,
}

impl fmt::Display for UpgradeRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeRejected::AlreadyUpgraded => write!(f, "socket is already upgraded"),
            UpgradeRejected::UpgradeInProgress => write!(f, "an upgrade is already in progress"),
            UpgradeRejected::NotAllowed { from, to } => {
                write!(f, "upgrade from {} to {} is not allowed", from, to)
            }
            UpgradeRejected::UnknownSid(sid) => write!(f, "no session with id {}", sid),
            UpgradeRejected::Closed => write!(f, "socket is closed"),
        }
    }
}

impl std::error::Error for UpgradeRejected {}

#[derive(Debug)]
struct Candidate {
    transport: Arc<dyn Transport>,
    timer: AbortHandle,
}

struct SocketInner {
    state: SocketState,
    upgraded: bool,
    transport: Arc<dyn Transport>,
    candidate: Option<Candidate>,
    write_buffer: VecDeque<Packet>,
    heartbeat: Option<AbortHandle>,
    on_close: Option<CloseHook>,
}

pub struct Socket {
    sid: Sid,
    options: SocketOptions,
    me: Weak<Socket>,
    sink: EventSink,
    events: broadcast::Sender<SocketEvent>,
    inner: Mutex<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("state", &self.state())
            .finish()
    }
}

impl Socket {
    /// Binds `transport` to a new session, queues the open packet and starts
    /// the heartbeat. Must be called inside a tokio runtime.
    pub fn open(
        sid: Sid,
        transport: Arc<dyn Transport>,
        options: SocketOptions,
        on_close: Option<CloseHook>,
    ) -> Arc<Socket> {
        let (sink, pump_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handshake = Packet::Open(Handshake {
            sid: sid.clone(),
            upgrades: options
                .upgrades
                .iter()
                .map(|kind| kind.name().to_string())
                .collect(),
            ping_interval: duration_ms(options.ping_interval),
            ping_timeout: duration_ms(options.ping_timeout),
        });

        let socket = Arc::new_cyclic(|me| Socket {
            sid,
            options,
            me: me.clone(),
            sink,
            events,
            inner: Mutex::new(SocketInner {
                state: SocketState::Open,
                upgraded: false,
                transport: transport.clone(),
                candidate: None,
                write_buffer: VecDeque::from([handshake]),
                heartbeat: None,
                on_close,
            }),
        });

        tokio::spawn(pump(Arc::downgrade(&socket), pump_rx));
        transport.bind(socket.sink.clone());
        {
            let mut inner = socket.inner();
            socket.reset_heartbeat(&mut inner);
            socket.flush(&mut inner);
        }
        tracing::debug!(sid = %socket.sid, transport = transport.name(), "socket opened");
        socket
    }

    fn inner(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    pub fn state(&self) -> SocketState {
        self.inner().state
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner().upgraded
    }

    /// The transport currently carrying traffic.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner().transport.clone()
    }

    /// Number of frames waiting for a writable transport.
    pub fn pending_writes(&self) -> usize {
        self.inner().write_buffer.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    pub fn send(&self, data: impl Into<String>) {
        self.send_packet(Packet::message(data));
    }

    /// Queues a frame and flushes if the active transport can take it.
    pub fn send_packet(&self, packet: Packet) {
        let mut inner = self.inner();
        if inner.state == SocketState::Closed {
            return;
        }
        inner.write_buffer.push_back(packet);
        self.flush(&mut inner);
    }

    /// Starts an upgrade to `candidate`. A rejected candidate is discarded
    /// and the socket is left untouched.
    pub fn maybe_upgrade(&self, candidate: Arc<dyn Transport>) -> Result<(), UpgradeRejected> {
        let mut inner = self.inner();
        let target = candidate.kind();
        let rejection = if inner.state == SocketState::Closed {
            Some(UpgradeRejected::Closed)
        } else if inner.upgraded {
            Some(UpgradeRejected::AlreadyUpgraded)
        } else if inner.candidate.is_some() {
            Some(UpgradeRejected::UpgradeInProgress)
        } else if !self.options.upgrades.contains(&target)
            || !inner.transport.upgrades_to().contains(&target)
        {
            Some(UpgradeRejected::NotAllowed {
                from: inner.transport.kind(),
                to: target,
            })
        } else {
            None
        };
        if let Some(rejection) = rejection {
            drop(inner);
            tracing::debug!(sid = %self.sid, transport = candidate.name(), %rejection, "upgrade rejected");
            candidate.discard();
            return Err(rejection);
        }

        let timer = self.spawn_upgrade_timeout(candidate.id());
        candidate.bind(self.sink.clone());
        inner.candidate = Some(Candidate {
            transport: candidate,
            timer,
        });
        inner.state = SocketState::Upgrading;
        Ok(())
    }

    /// Closes the socket and its transport.
    pub fn close(&self) {
        self.close_with(CloseReason::ForcedClose);
    }

    pub(crate) fn close_with(&self, reason: CloseReason) {
        let (transport, hook) = {
            let mut inner = self.inner();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            if let Some(heartbeat) = inner.heartbeat.take() {
                heartbeat.abort();
            }
            if let Some(candidate) = inner.candidate.take() {
                candidate.timer.abort();
                candidate.transport.discard();
            }
            inner.write_buffer.clear();
            (inner.transport.clone(), inner.on_close.take())
        };

        transport.close(None);
        tracing::debug!(sid = %self.sid, %reason, "socket closed");
        if let Some(hook) = hook {
            hook(&self.sid, &reason);
        }
        let _ = self.events.send(SocketEvent::Close(reason));
    }

    pub(crate) fn handle_transport_event(&self, id: TransportId, event: TransportEvent) {
        let close = {
            let mut inner = self.inner();
            if inner.state == SocketState::Closed {
                return;
            }
            if inner.transport.id() == id {
                self.on_active_event(&mut inner, event)
            } else if inner
                .candidate
                .as_ref()
                .is_some_and(|candidate| candidate.transport.id() == id)
            {
                self.on_candidate_event(&mut inner, event);
                None
            } else {
                tracing::trace!(sid = %self.sid, transport = id, "event from detached transport ignored");
                None
            }
        };
        if let Some(reason) = close {
            self.close_with(reason);
        }
    }

    fn on_active_event(&self, inner: &mut SocketInner, event: TransportEvent) -> Option<CloseReason> {
        match event {
            TransportEvent::Drain => {
                self.flush(inner);
                inner.transport.on_flushed();
                None
            }
            TransportEvent::Packet(packet) => {
                self.reset_heartbeat(inner);
                match packet {
                    Packet::Ping(data) => {
                        inner.write_buffer.push_back(Packet::Pong(data));
                        self.flush(inner);
                        None
                    }
                    Packet::Message(data) => {
                        let _ = self.events.send(SocketEvent::Message(data));
                        None
                    }
                    Packet::Close => Some(CloseReason::TransportClose),
                    other => {
                        tracing::trace!(sid = %self.sid, packet = ?other, "ignoring packet");
                        None
                    }
                }
            }
            TransportEvent::Close(reason) => Some(reason),
        }
    }

    fn on_candidate_event(&self, inner: &mut SocketInner, event: TransportEvent) {
        match event {
            TransportEvent::Drain => {}
            TransportEvent::Packet(packet) if packet.is_probe() => {
                let Some(candidate) = inner.candidate.as_ref() else {
                    return;
                };
                let name = candidate.transport.name();
                if let Err(err) = candidate
                    .transport
                    .send(vec![Packet::Pong(Some(PROBE.to_string()))])
                {
                    tracing::debug!(sid = %self.sid, error = %err.error, "probe answer failed");
                }
                // Release a parked long-poll so the client can send the upgrade.
                if inner.transport.is_writable() {
                    let _ = inner.transport.send(vec![Packet::Noop]);
                }
                let _ = self.events.send(SocketEvent::Upgrading(name));
            }
            TransportEvent::Packet(Packet::Upgrade) => self.complete_upgrade(inner),
            TransportEvent::Packet(_) | TransportEvent::Close(_) => {
                tracing::debug!(sid = %self.sid, "upgrade abandoned by candidate");
                self.abandon_upgrade(inner);
            }
        }
    }

    fn complete_upgrade(&self, inner: &mut SocketInner) {
        let Some(candidate) = inner.candidate.take() else {
            return;
        };
        candidate.timer.abort();
        let previous = std::mem::replace(&mut inner.transport, candidate.transport);
        inner.state = SocketState::Upgraded;
        self.flush(inner);
        previous.discard();
        inner.upgraded = true;
        tracing::info!(
            sid = %self.sid,
            from = previous.name(),
            to = inner.transport.name(),
            "transport upgraded"
        );
        let _ = self.events.send(SocketEvent::Upgrade {
            discarded: previous,
        });
    }

    fn abandon_upgrade(&self, inner: &mut SocketInner) {
        if let Some(candidate) = inner.candidate.take() {
            candidate.timer.abort();
            candidate.transport.discard();
        }
        inner.state = SocketState::Open;
        self.flush(inner);
    }

    fn on_upgrade_timeout(&self, id: TransportId) {
        let mut inner = self.inner();
        if inner
            .candidate
            .as_ref()
            .is_some_and(|candidate| candidate.transport.id() == id)
        {
            tracing::debug!(sid = %self.sid, "upgrade timed out");
            self.abandon_upgrade(&mut inner);
        }
    }

    /// Writes the whole buffer to the active transport in one batch.
    /// Frames stay buffered while an upgrade is pending.
    fn flush(&self, inner: &mut SocketInner) {
        if !matches!(inner.state, SocketState::Open | SocketState::Upgraded)
            || inner.write_buffer.is_empty()
            || !inner.transport.is_writable()
        {
            return;
        }
        let batch: Vec<Packet> = inner.write_buffer.drain(..).collect();
        if let Err(err) = inner.transport.send(batch) {
            for packet in err.packets.into_iter().rev() {
                inner.write_buffer.push_front(packet);
            }
        }
    }

    fn reset_heartbeat(&self, inner: &mut SocketInner) {
        if let Some(previous) = inner.heartbeat.take() {
            previous.abort();
        }
        let socket = self.me.clone();
        let idle = self.options.ping_interval + self.options.ping_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(socket) = socket.upgrade() {
                socket.close_with(CloseReason::PingTimeout);
            }
        });
        inner.heartbeat = Some(handle.abort_handle());
    }

    fn spawn_upgrade_timeout(&self, id: TransportId) -> AbortHandle {
        let socket = self.me.clone();
        let timeout = self.options.upgrade_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(socket) = socket.upgrade() {
                socket.on_upgrade_timeout(id);
            }
        })
        .abort_handle()
    }
}

async fn pump(
    handle: Weak<Socket>,
    mut events: mpsc::UnboundedReceiver<(TransportId, TransportEvent)>,
) {
    while let Some((id, event)) = events.recv().await {
        let Some(socket) = handle.upgrade() else {
            break;
        };
        socket.handle_transport_event(id, event);
        if socket.state() == SocketState::Closed {
            break;
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "tests/socket_tests.rs"]
mod tests;
