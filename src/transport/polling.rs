//! Long-polling transports.
//!
//! Each client GET parks a poll until the owning socket flushes into it.
//! Client POSTs deliver packets through [`PollingTransport::on_data`].

use super::{
    next_transport_id, CloseReason, EventRelay, EventSink, SendError, Transport,
    TransportError, TransportEvent, TransportId, TransportKind,
};
use crate::packet::Packet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// The three polling encodings. They differ only in how the HTTP layer
/// frames a response, except that `Dynamic` never holds a poll open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingFlavor {
    Xhr,
    Jsonp,
    Dynamic,
}

impl PollingFlavor {
    fn kind(self) -> TransportKind {
        match self {
            PollingFlavor::Xhr => TransportKind::PollingXhr,
            PollingFlavor::Jsonp => TransportKind::PollingJsonp,
            PollingFlavor::Dynamic => TransportKind::PollingDynamic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    /// Close requested with no poll parked; the next poll carries it.
    Closing,
    Closed,
    Discarded,
}

#[derive(Debug)]
struct PollingInner {
    relay: EventRelay,
    poll: Option<oneshot::Sender<Vec<Packet>>>,
    phase: Phase,
    on_closed: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
pub struct PollingTransport {
    id: TransportId,
    flavor: PollingFlavor,
    inner: Mutex<PollingInner>,
}

impl PollingTransport {
    pub fn new(flavor: PollingFlavor) -> Arc<Self> {
        Arc::new(Self {
            id: next_transport_id(),
            flavor,
            inner: Mutex::new(PollingInner {
                relay: EventRelay::default(),
                poll: None,
                phase: Phase::Open,
                on_closed: None,
            }),
        })
    }

    pub fn flavor(&self) -> PollingFlavor {
        self.flavor
    }

    fn inner(&self) -> MutexGuard<'_, PollingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks a client poll. The returned receiver resolves with the batch
    /// to write as the HTTP response; it errors if the poll is abandoned.
    pub fn on_poll_request(&self) -> Result<oneshot::Receiver<Vec<Packet>>, TransportError> {
        let mut inner = self.inner();
        let (tx, rx) = oneshot::channel();
        match inner.phase {
            Phase::Closed | Phase::Discarded => return Err(TransportError::Closed),
            Phase::Closing => {
                let _ = tx.send(vec![Packet::Close]);
                finish_close(&mut inner, self.id, CloseReason::ForcedClose);
                return Ok(rx);
            }
            Phase::Open => {}
        }

        if inner.poll.is_some() {
            tracing::debug!(transport = self.id, "overlapping poll, closing transport");
            inner.poll = None;
            let reason = CloseReason::TransportError(TransportError::OverlappingPoll.to_string());
            finish_close(&mut inner, self.id, reason);
            return Err(TransportError::OverlappingPoll);
        }

        inner.poll = Some(tx);
        inner.relay.emit(self.id, TransportEvent::Drain);
        Ok(rx)
    }

    /// Delivers the packets decoded from a client data request.
    pub fn on_data(&self, packets: Vec<Packet>) {
        let mut inner = self.inner();
        if inner.phase != Phase::Open {
            return;
        }
        for packet in packets {
            inner.relay.emit(self.id, TransportEvent::Packet(packet));
        }
    }

    /// Reports a failure of the underlying HTTP exchange.
    pub fn on_error(&self, detail: impl Into<String>) {
        let mut inner = self.inner();
        if matches!(inner.phase, Phase::Closed | Phase::Discarded) {
            return;
        }
        inner.poll = None;
        finish_close(&mut inner, self.id, CloseReason::TransportError(detail.into()));
    }
}

fn finish_close(inner: &mut PollingInner, id: TransportId, reason: CloseReason) {
    inner.phase = Phase::Closed;
    if let Some(done) = inner.on_closed.take() {
        let _ = done.send(());
    }
    inner.relay.emit(id, TransportEvent::Close(reason));
}

impl Transport for PollingTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.flavor.kind()
    }

    fn is_writable(&self) -> bool {
        let inner = self.inner();
        inner.phase == Phase::Open && inner.poll.is_some()
    }

    fn send(&self, packets: Vec<Packet>) -> Result<(), SendError> {
        let mut inner = self.inner();
        if inner.phase != Phase::Open {
            return Err(SendError {
                error: TransportError::Closed,
                packets,
            });
        }
        let Some(poll) = inner.poll.take() else {
            return Err(SendError {
                error: TransportError::NotWritable,
                packets,
            });
        };
        // A dropped receiver means the HTTP side hung up mid-poll.
        poll.send(packets).map_err(|packets| SendError {
            error: TransportError::NotWritable,
            packets,
        })
    }

    fn close(&self, on_closed: Option<oneshot::Sender<()>>) {
        let mut inner = self.inner();
        match inner.phase {
            Phase::Open => {}
            Phase::Closing => {
                let previous = inner.on_closed.take();
                inner.on_closed = on_closed.or(previous);
                return;
            }
            Phase::Closed | Phase::Discarded => {
                if let Some(done) = on_closed {
                    let _ = done.send(());
                }
                return;
            }
        }
        inner.on_closed = on_closed;
        match inner.poll.take() {
            Some(poll) => {
                let _ = poll.send(vec![Packet::Close]);
                finish_close(&mut inner, self.id, CloseReason::ForcedClose);
            }
            None => inner.phase = Phase::Closing,
        }
    }

    fn discard(&self) {
        let mut inner = self.inner();
        inner.phase = Phase::Discarded;
        inner.poll = None;
        inner.on_closed = None;
        inner.relay.detach();
    }

    fn bind(&self, sink: EventSink) {
        self.inner().relay.bind(self.id, sink);
    }

    fn on_flushed(&self) {
        if self.flavor != PollingFlavor::Dynamic {
            return;
        }
        let mut inner = self.inner();
        if inner.phase != Phase::Open {
            return;
        }
        if let Some(poll) = inner.poll.take() {
            let _ = poll.send(Vec::new());
        }
    }

    fn as_polling(&self) -> Option<&PollingTransport> {
        Some(self)
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
