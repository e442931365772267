//! Persistent socket transports.
//!
//! The external framing layer owns the actual connection. It pumps the
//! outbound receiver returned by [`WebSocketTransport::new`] into frames,
//! and reports decoded inbound packets and disconnects back here.

use super::{
    next_transport_id, CloseReason, EventRelay, EventSink, SendError, Transport,
    TransportError, TransportEvent, TransportId, TransportKind,
};
use crate::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFlavor {
    WebSocket,
    /// A flash-style socket whose raw stream first passed the policy probe.
    PolicyProbe,
}

#[derive(Debug)]
struct SocketInner {
    relay: EventRelay,
    outbound: Option<mpsc::UnboundedSender<Packet>>,
    closed: bool,
}

#[derive(Debug)]
pub struct WebSocketTransport {
    id: TransportId,
    flavor: SocketFlavor,
    inner: Mutex<SocketInner>,
}

impl WebSocketTransport {
    pub fn new(flavor: SocketFlavor) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: next_transport_id(),
            flavor,
            inner: Mutex::new(SocketInner {
                relay: EventRelay::default(),
                outbound: Some(tx),
                closed: false,
            }),
        });
        (transport, rx)
    }

    fn inner(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers one decoded inbound frame.
    pub fn on_packet(&self, packet: Packet) {
        let mut inner = self.inner();
        if inner.closed {
            return;
        }
        inner.relay.emit(self.id, TransportEvent::Packet(packet));
    }

    /// Reports that the connection went away. `None` means a clean close.
    pub fn on_disconnect(&self, error: Option<String>) {
        let mut inner = self.inner();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.outbound = None;
        let reason = match error {
            Some(detail) => CloseReason::TransportError(detail),
            None => CloseReason::TransportClose,
        };
        inner.relay.emit(self.id, TransportEvent::Close(reason));
    }
}

impl Transport for WebSocketTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        match self.flavor {
            SocketFlavor::WebSocket => TransportKind::PersistentSocket,
            SocketFlavor::PolicyProbe => TransportKind::PolicyProbe,
        }
    }

    fn is_writable(&self) -> bool {
        let inner = self.inner();
        !inner.closed && inner.outbound.is_some()
    }

    fn send(&self, packets: Vec<Packet>) -> Result<(), SendError> {
        let inner = self.inner();
        let Some(outbound) = inner.outbound.as_ref().filter(|_| !inner.closed) else {
            return Err(SendError {
                error: TransportError::Closed,
                packets,
            });
        };
        let mut pending: VecDeque<Packet> = packets.into();
        while let Some(packet) = pending.pop_front() {
            if let Err(mpsc::error::SendError(packet)) = outbound.send(packet) {
                pending.push_front(packet);
                return Err(SendError {
                    error: TransportError::Closed,
                    packets: pending.into(),
                });
            }
        }
        Ok(())
    }

    fn close(&self, on_closed: Option<oneshot::Sender<()>>) {
        let mut inner = self.inner();
        if !inner.closed {
            inner.closed = true;
            // Dropping the sender ends the framing layer's outbound stream.
            inner.outbound = None;
            inner
                .relay
                .emit(self.id, TransportEvent::Close(CloseReason::ForcedClose));
        }
        if let Some(done) = on_closed {
            let _ = done.send(());
        }
    }

    fn discard(&self) {
        let mut inner = self.inner();
        inner.closed = true;
        inner.outbound = None;
        inner.relay.detach();
    }

    fn bind(&self, sink: EventSink) {
        self.inner().relay.bind(self.id, sink);
    }
}

#[cfg(test)]
#[path = "tests/websocket_tests.rs"]
mod tests;
