//! Master-side session ownership registry.
//!
//! [`CoordinatorState`] is the plain data: the sid → worker map, its
//! reverse index, and the live worker table. [`Coordinator`] wraps it for
//! concurrent use and runs one reader task per worker channel.

use super::protocol::{
    decode_line, write_lines, Envelope, Inbound, RemoteCall, RemoteReply, WorkerId, WORKER_ID_ENV,
};
use crate::packet::Sid;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub sessions: usize,
    pub online_since: DateTime<Utc>,
}

/// Lifecycle and passthrough notifications from the coordinator.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    WorkerOnline(WorkerId),
    WorkerExit { worker: WorkerId, purged: Vec<Sid> },
    /// A non-engine message a worker wrote to its channel.
    Message { worker: WorkerId, payload: Value },
}

#[derive(Debug)]
struct WorkerEntry {
    outbound: mpsc::UnboundedSender<String>,
    online_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CoordinatorState {
    sids: HashMap<Sid, WorkerId>,
    owned: HashMap<WorkerId, HashSet<Sid>>,
    workers: HashMap<WorkerId, WorkerEntry>,
}

impl CoordinatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one remote function on behalf of `origin`.
    pub fn dispatch(&mut self, origin: WorkerId, call: RemoteCall) -> RemoteReply {
        match call {
            RemoteCall::Verify(sid) => RemoteReply::Verified(self.sids.contains_key(&sid)),
            RemoteCall::Handshake(sid) => {
                if let Some(previous) = self.sids.insert(sid.clone(), origin) {
                    if previous != origin {
                        self.disown(previous, &sid);
                    }
                }
                self.owned.entry(origin).or_default().insert(sid);
                RemoteReply::Ack
            }
            RemoteCall::Close(sid) => {
                if let Some(owner) = self.sids.remove(&sid) {
                    self.disown(owner, &sid);
                }
                RemoteReply::Ack
            }
            RemoteCall::LookupWorker(sid) => RemoteReply::Owner(self.sids.get(&sid).copied()),
        }
    }

    fn disown(&mut self, worker: WorkerId, sid: &Sid) {
        if let Some(set) = self.owned.get_mut(&worker) {
            set.remove(sid);
            if set.is_empty() {
                self.owned.remove(&worker);
            }
        }
    }

    pub fn worker_online(&mut self, worker: WorkerId, outbound: mpsc::UnboundedSender<String>) {
        self.workers.insert(
            worker,
            WorkerEntry {
                outbound,
                online_at: Utc::now(),
            },
        );
    }

    /// Drops `worker` and every sid it owned. Returns `None` when there was
    /// nothing to clean up, so repeated sweeps are silent.
    pub fn worker_exit(&mut self, worker: WorkerId) -> Option<Vec<Sid>> {
        let known = self.workers.remove(&worker).is_some();
        let mut purged: Vec<Sid> = self
            .owned
            .remove(&worker)
            .unwrap_or_default()
            .into_iter()
            .filter(|sid| self.sids.get(sid) == Some(&worker))
            .collect();
        for sid in &purged {
            self.sids.remove(sid);
        }
        if !known && purged.is_empty() {
            return None;
        }
        purged.sort();
        Some(purged)
    }

    pub fn is_online(&self, worker: WorkerId) -> bool {
        self.workers.contains_key(&worker)
    }

    pub fn lookup(&self, sid: &Sid) -> Option<WorkerId> {
        self.sids.get(sid).copied()
    }

    pub fn session_count(&self) -> usize {
        self.sids.len()
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        let mut summaries: Vec<WorkerSummary> = self
            .workers
            .iter()
            .map(|(id, entry)| WorkerSummary {
                id: *id,
                sessions: self.owned.get(id).map_or(0, HashSet::len),
                online_since: entry.online_at,
            })
            .collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    fn outbound(&self, worker: WorkerId) -> Option<mpsc::UnboundedSender<String>> {
        self.workers.get(&worker).map(|entry| entry.outbound.clone())
    }
}

/// The cluster coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<CoordinatorState>>,
    events: broadcast::Sender<ClusterEvent>,
    next_id: Arc<AtomicU32>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(CoordinatorState::new())),
            events,
            next_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Registers `worker` and starts serving its channel. The returned task
    /// ends after the channel closes and the worker's sessions are swept.
    pub async fn attach_worker<R, W>(&self, worker: WorkerId, reader: R, writer: W) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, lines) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(lines, writer));
        self.state.lock().await.worker_online(worker, outbound);
        tracing::info!(worker = %worker, "worker online");
        let _ = self.events.send(ClusterEvent::WorkerOnline(worker));

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.serve_channel(worker, reader).await;
            coordinator.worker_exit(worker).await;
        })
    }

    /// Starts a worker process with its stdio as the RPC channel.
    pub async fn spawn_worker(&self, mut command: Command) -> Result<WorkerId> {
        let worker = self.next_worker_id();
        command
            .env(WORKER_ID_ENV, worker.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker {}", worker))?;
        let stdin = child.stdin.take().context("Worker stdin was not piped")?;
        let stdout = child.stdout.take().context("Worker stdout was not piped")?;

        self.attach_worker(worker, stdout, stdin).await;

        let coordinator = self.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(worker = %worker, %status, "worker exited"),
                Err(e) => tracing::warn!(worker = %worker, error = %e, "failed to wait for worker"),
            }
            coordinator.worker_exit(worker).await;
        });
        Ok(worker)
    }

    async fn serve_channel<R>(&self, worker: WorkerId, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(worker, &line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(worker = %worker, error = %e, "worker channel read failed");
                    break;
                }
            }
        }
    }

    async fn handle_line(&self, worker: WorkerId, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let envelope = match decode_line(line) {
            Inbound::Tagged(envelope) => envelope,
            Inbound::Foreign(payload) => {
                let _ = self.events.send(ClusterEvent::Message { worker, payload });
                return;
            }
            Inbound::Malformed(e) => {
                tracing::warn!(worker = %worker, error = %e, "dropping malformed message");
                return;
            }
        };
        if envelope.wid != worker {
            tracing::warn!(worker = %worker, claimed = %envelope.wid, "message carries another worker id");
        }
        let call = match RemoteCall::from_envelope(&envelope) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(worker = %worker, error = %e, "dropping invalid rpc call");
                return;
            }
        };
        tracing::debug!(worker = %worker, function = %envelope.function, sid = %call.sid(), "rpc call");

        let (reply, outbound) = {
            let mut state = self.state.lock().await;
            let reply = state.dispatch(worker, call);
            (reply, state.outbound(worker))
        };
        if envelope.id.is_none() {
            return;
        }
        let response = match Envelope::response(&envelope, &reply).to_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(worker = %worker, error = %e, "failed to encode rpc response");
                return;
            }
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(response);
        }
    }

    /// Sweeps a dead worker. Safe to call more than once.
    pub async fn worker_exit(&self, worker: WorkerId) -> Vec<Sid> {
        let Some(purged) = self.state.lock().await.worker_exit(worker) else {
            return Vec::new();
        };
        tracing::info!(worker = %worker, purged = purged.len(), "worker gone, sessions released");
        let _ = self.events.send(ClusterEvent::WorkerExit {
            worker,
            purged: purged.clone(),
        });
        purged
    }

    pub async fn workers(&self) -> Vec<WorkerSummary> {
        self.state.lock().await.summaries()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.session_count()
    }

    pub async fn lookup(&self, sid: &Sid) -> Option<WorkerId> {
        self.state.lock().await.lookup(sid)
    }

    pub async fn is_online(&self, worker: WorkerId) -> bool {
        self.state.lock().await.is_online(worker)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
