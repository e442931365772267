//! Worker-side end of the coordinator channel.
//!
//! Nothing is spawned until the first call. At that point one writer task
//! and exactly one reader task are started; the reader resolves pending
//! calls by correlation id and retires each id after its single response.

use super::protocol::{
    decode_line, write_lines, Envelope, Inbound, ProtocolError, RemoteCall, RemoteReply, WorkerId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

type BoxReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxWriter = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The coordinator channel is gone.
    ChannelClosed,
    /// No response arrived within the configured deadline.
    Timeout,
    Protocol(ProtocolError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::ChannelClosed => write!(f, "coordinator channel closed"),
            RpcError::Timeout => write!(f, "coordinator did not answer in time"),
            RpcError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        RpcError::Protocol(e)
    }
}

#[derive(Debug, Default)]
struct PendingCalls {
    next_id: AtomicU64,
    table: Mutex<PendingTable>,
}

#[derive(Debug, Default)]
struct PendingTable {
    callbacks: HashMap<u64, oneshot::Sender<Vec<Value>>>,
    closed: bool,
}

impl PendingCalls {
    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Vec<Value>>, RpcError> {
        let mut table = self.table();
        if table.closed {
            return Err(RpcError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        table.callbacks.insert(id, tx);
        Ok(rx)
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Vec<Value>>> {
        self.table().callbacks.remove(&id)
    }

    /// Fails every outstanding call and refuses new ones.
    fn close(&self) {
        let mut table = self.table();
        table.closed = true;
        table.callbacks.clear();
    }

    fn len(&self) -> usize {
        self.table().callbacks.len()
    }
}

struct Started {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<PendingCalls>,
}

/// RPC client a worker uses to reach the coordinator.
pub struct RpcClient {
    worker_id: WorkerId,
    io: Mutex<Option<(BoxReader, BoxWriter)>>,
    started: OnceLock<Started>,
    timeout: Option<Duration>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("worker_id", &self.worker_id)
            .field("started", &self.started.get().is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcClient {
    pub fn new<R, W>(worker_id: WorkerId, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            worker_id,
            io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
            started: OnceLock::new(),
            timeout: None,
        }
    }

    /// A client speaking over this process's stdin/stdout, as set up by
    /// `Coordinator::spawn_worker`.
    pub fn from_stdio(worker_id: WorkerId) -> Self {
        Self::new(worker_id, tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.started.get().map_or(0, |started| started.pending.len())
    }

    fn started(&self) -> Result<&Started, RpcError> {
        if let Some(started) = self.started.get() {
            return Ok(started);
        }
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(started) = self.started.get() {
            return Ok(started);
        }
        let Some((reader, writer)) = io.take() else {
            return Err(RpcError::ChannelClosed);
        };

        let (outbound, lines) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingCalls::default());
        tokio::spawn(write_lines(lines, writer));
        tokio::spawn(listen(self.worker_id, reader, pending.clone()));
        tracing::debug!(worker = %self.worker_id, "coordinator channel started");

        let _ = self.started.set(Started { outbound, pending });
        drop(io);
        self.started.get().ok_or(RpcError::ChannelClosed)
    }

    /// Calls a remote function and waits for its single response.
    pub async fn call(&self, call: RemoteCall) -> Result<RemoteReply, RpcError> {
        let started = self.started()?;
        let id = started.pending.next_id();
        let line = Envelope::request(self.worker_id, &call, Some(id)).to_line()?;
        let response = started.pending.register(id)?;
        if started.outbound.send(line).is_err() {
            started.pending.take(id);
            return Err(RpcError::ChannelClosed);
        }

        let args = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(result) => result,
                Err(_) => {
                    started.pending.take(id);
                    tracing::warn!(worker = %self.worker_id, function = %call.function(), "rpc call timed out");
                    return Err(RpcError::Timeout);
                }
            },
            None => response.await,
        }
        .map_err(|_| RpcError::ChannelClosed)?;

        Ok(RemoteReply::from_args(call.function(), &args)?)
    }

    /// Sends a call without asking for a response.
    pub fn notify(&self, call: RemoteCall) -> Result<(), RpcError> {
        let line = Envelope::request(self.worker_id, &call, None).to_line()?;
        self.send_line(line)
    }

    /// Writes an application message onto the shared channel.
    pub fn send_raw(&self, payload: &Value) -> Result<(), RpcError> {
        let line = serde_json::to_string(payload)
            .map_err(|e| RpcError::Protocol(ProtocolError::Json(e.to_string())))?;
        self.send_line(line)
    }

    fn send_line(&self, line: String) -> Result<(), RpcError> {
        self.started()?
            .outbound
            .send(line)
            .map_err(|_| RpcError::ChannelClosed)
    }
}

async fn listen(worker: WorkerId, reader: BoxReader, pending: Arc<PendingCalls>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => resolve(worker, &line, &pending),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(worker = %worker, error = %e, "coordinator channel read failed");
                break;
            }
        }
    }
    tracing::debug!(worker = %worker, outstanding = pending.len(), "coordinator channel closed");
    pending.close();
}

fn resolve(worker: WorkerId, line: &str, pending: &PendingCalls) {
    if line.trim().is_empty() {
        return;
    }
    match decode_line(line) {
        Inbound::Tagged(envelope) => {
            let Some(id) = envelope.id else {
                tracing::debug!(worker = %worker, function = %envelope.function, "ignoring uncorrelated message");
                return;
            };
            match pending.take(id) {
                Some(callback) => {
                    let _ = callback.send(envelope.args);
                }
                None => tracing::debug!(worker = %worker, id, "ignoring stale rpc response"),
            }
        }
        Inbound::Foreign(_) => {
            tracing::trace!(worker = %worker, "ignoring application message");
        }
        Inbound::Malformed(e) => {
            tracing::warn!(worker = %worker, error = %e, "dropping malformed message");
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
