//! Transport variants and the capability contract a socket drives them through.
//!
//! A transport never calls into its socket. It publishes [`TransportEvent`]s
//! onto the sink it was bound to, tagged with its [`TransportId`], and the
//! owning socket drains that channel from a single task. Events emitted
//! before a transport is bound are queued and replayed on bind.

pub mod polling;
pub mod websocket;

use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub use polling::{PollingFlavor, PollingTransport};
pub use websocket::{SocketFlavor, WebSocketTransport};

/// Process-unique identity of a transport instance.
pub type TransportId = u64;

/// Channel a bound transport publishes its events onto.
pub type EventSink = mpsc::UnboundedSender<(TransportId, TransportEvent)>;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_transport_id() -> TransportId {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The registered transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "polling-xhr")]
    PollingXhr,
    #[serde(rename = "polling-jsonp")]
    PollingJsonp,
    #[serde(rename = "polling-dynamic")]
    PollingDynamic,
    #[serde(rename = "persistent-socket")]
    PersistentSocket,
    #[serde(rename = "policy-probe")]
    PolicyProbe,
}

const POLLING_UPGRADES: &[TransportKind] =
    &[TransportKind::PersistentSocket, TransportKind::PolicyProbe];

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        TransportKind::PollingXhr,
        TransportKind::PollingJsonp,
        TransportKind::PollingDynamic,
        TransportKind::PersistentSocket,
        TransportKind::PolicyProbe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TransportKind::PollingXhr => "polling-xhr",
            TransportKind::PollingJsonp => "polling-jsonp",
            TransportKind::PollingDynamic => "polling-dynamic",
            TransportKind::PersistentSocket => "persistent-socket",
            TransportKind::PolicyProbe => "policy-probe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// The static upgrade table: which variants a session on `self` may move to.
    pub fn upgrades_to(self) -> &'static [TransportKind] {
        match self {
            TransportKind::PollingXhr
            | TransportKind::PollingJsonp
            | TransportKind::PollingDynamic => POLLING_UPGRADES,
            TransportKind::PersistentSocket | TransportKind::PolicyProbe => &[],
        }
    }

    pub fn is_polling(self) -> bool {
        matches!(
            self,
            TransportKind::PollingXhr | TransportKind::PollingJsonp | TransportKind::PollingDynamic
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown transport \"{}\"", s))
    }
}

/// Why a transport or socket closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the transport cleanly.
    TransportClose,
    /// The underlying connection failed.
    TransportError(String),
    /// No packet arrived within the heartbeat window.
    PingTimeout,
    /// The server closed the socket.
    ForcedClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TransportClose => write!(f, "transport close"),
            CloseReason::TransportError(detail) => write!(f, "transport error: {}", detail),
            CloseReason::PingTimeout => write!(f, "ping timeout"),
            CloseReason::ForcedClose => write!(f, "forced close"),
        }
    }
}

/// Something a transport reports to the socket it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A packet arrived from the client.
    Packet(Packet),
    /// The transport became writable.
    Drain,
    /// The transport is gone.
    Close(CloseReason),
}

/// Errors returned by transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No request is parked to carry a response.
    NotWritable,
    /// The transport was closed or discarded.
    Closed,
    /// A second poll arrived while one was still parked.
    OverlappingPoll,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotWritable => write!(f, "transport is not writable"),
            TransportError::Closed => write!(f, "transport is closed"),
            TransportError::OverlappingPoll => write!(f, "overlapping poll from client"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A failed [`Transport::send`], handing the unsent packets back in order.
#[derive(Debug)]
pub struct SendError {
    pub error: TransportError,
    pub packets: Vec<Packet>,
}

/// The capability set every transport variant exposes to a socket.
pub trait Transport: Send + Sync + fmt::Debug {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn upgrades_to(&self) -> &'static [TransportKind] {
        self.kind().upgrades_to()
    }

    fn is_writable(&self) -> bool;

    /// Sends an ordered batch of packets.
    fn send(&self, packets: Vec<Packet>) -> Result<(), SendError>;

    /// Closes gracefully, resolving `on_closed` once the close completed.
    fn close(&self, on_closed: Option<oneshot::Sender<()>>);

    /// Hard-stops without a closing handshake. A discarded transport emits
    /// no further events and accepts no further packets.
    fn discard(&self);

    /// Routes this transport's events to `sink`.
    fn bind(&self, sink: EventSink);

    /// Called by the owning socket after it flushed in response to a drain.
    fn on_flushed(&self) {}

    fn as_polling(&self) -> Option<&PollingTransport> {
        None
    }
}

/// Queues events until a socket binds, then forwards them.
#[derive(Debug, Default)]
pub(crate) struct EventRelay {
    sink: Option<EventSink>,
    queued: Vec<TransportEvent>,
    detached: bool,
}

impl EventRelay {
    pub(crate) fn bind(&mut self, id: TransportId, sink: EventSink) {
        if self.detached {
            return;
        }
        for event in self.queued.drain(..) {
            let _ = sink.send((id, event));
        }
        self.sink = Some(sink);
    }

    pub(crate) fn emit(&mut self, id: TransportId, event: TransportEvent) {
        if self.detached {
            return;
        }
        match &self.sink {
            Some(sink) => {
                let _ = sink.send((id, event));
            }
            None => self.queued.push(event),
        }
    }

    pub(crate) fn detach(&mut self) {
        self.detached = true;
        self.sink = None;
        self.queued.clear();
    }
}

/// A freshly built transport, with the concrete handle the HTTP or
/// websocket layer drives it through.
#[derive(Debug)]
pub enum TransportHandle {
    Polling(Arc<PollingTransport>),
    Socket {
        transport: Arc<WebSocketTransport>,
        /// Packets the socket writes; the framing layer drains this.
        outbound: mpsc::UnboundedReceiver<Packet>,
    },
}

impl TransportHandle {
    pub fn build(kind: TransportKind) -> Self {
        match kind {
            TransportKind::PollingXhr => {
                TransportHandle::Polling(PollingTransport::new(PollingFlavor::Xhr))
            }
            TransportKind::PollingJsonp => {
                TransportHandle::Polling(PollingTransport::new(PollingFlavor::Jsonp))
            }
            TransportKind::PollingDynamic => {
                TransportHandle::Polling(PollingTransport::new(PollingFlavor::Dynamic))
            }
            TransportKind::PersistentSocket => {
                let (transport, outbound) = WebSocketTransport::new(SocketFlavor::WebSocket);
                TransportHandle::Socket {
                    transport,
                    outbound,
                }
            }
            TransportKind::PolicyProbe => {
                let (transport, outbound) = WebSocketTransport::new(SocketFlavor::PolicyProbe);
                TransportHandle::Socket {
                    transport,
                    outbound,
                }
            }
        }
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        match self {
            TransportHandle::Polling(transport) => transport.clone(),
            TransportHandle::Socket { transport, .. } => transport.clone(),
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod registry_tests;
