//! Connection manager.
//!
//! Owns the session table for one worker. Requests are verified against
//! the local table first and, in a cluster, against the coordinator. The
//! table lock is held for sid generation, socket construction and insert,
//! so a sid can never be handed out twice by the same worker.

mod error;
mod request;

pub use error::{EngineError, VerifyError, VERIFY_FAILURE_STATUS};
pub use request::{Method, Request};

use crate::cluster::{RemoteCall, RemoteReply, RpcClient, WorkerId};
use crate::config::EngineConfig;
use crate::packet::Sid;
use crate::policy::{serve_policy_probe, ProbeResult};
use crate::socket::{CloseHook, Socket, SocketOptions, UpgradeRejected};
use crate::transport::{CloseReason, Transport, TransportHandle, TransportKind};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

const CONNECTION_CAPACITY: usize = 64;

/// Where a verified HTTP request should go.
#[derive(Debug)]
pub enum RequestRoute {
    /// A new session was created for a sid-less request.
    Handshake {
        socket: Arc<Socket>,
        transport: TransportHandle,
    },
    /// The sid belongs to a local session.
    Session(Arc<Socket>),
    /// The sid lives on another worker; re-dispatch there.
    Remote(WorkerId),
}

/// Result of a persistent-socket connection attempt.
#[derive(Debug)]
pub enum UpgradeOutcome {
    /// No sid: the connection became a new session of its own.
    Handshake(Arc<Socket>),
    /// The candidate is bound to the existing session.
    Upgrading(Arc<Socket>),
    /// The session lives on another worker.
    Forward(WorkerId),
}

struct ServerInner {
    config: EngineConfig,
    clients: Mutex<HashMap<Sid, Arc<Socket>>>,
    clients_count: AtomicUsize,
    connections: broadcast::Sender<Arc<Socket>>,
    cluster: Option<Arc<RpcClient>>,
    policy: Arc<[u8]>,
}

impl ServerInner {
    fn clients(&self) -> MutexGuard<'_, HashMap<Sid, Arc<Socket>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_client(&self, sid: &Sid, reason: &CloseReason) {
        if self.clients().remove(sid).is_none() {
            return;
        }
        self.clients_count.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(sid = %sid, %reason, "client removed");
        if let Some(rpc) = &self.cluster {
            if let Err(e) = rpc.notify(RemoteCall::Close(sid.clone())) {
                tracing::warn!(sid = %sid, error = %e, "failed to release sid in cluster");
            }
        }
    }
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// A standalone server.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// A server running as one worker of a cluster. A configured
    /// `rpc_timeout_ms` replaces the client's own deadline.
    pub fn clustered(config: EngineConfig, rpc: RpcClient) -> Result<Self> {
        let rpc = match config.rpc_timeout() {
            Some(limit) => rpc.with_timeout(Some(limit)),
            None => rpc,
        };
        Self::build(config, Some(Arc::new(rpc)))
    }

    fn build(config: EngineConfig, cluster: Option<Arc<RpcClient>>) -> Result<Self> {
        let policy = config.policy_document()?;
        let (connections, _) = broadcast::channel(CONNECTION_CAPACITY);
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                clients: Mutex::new(HashMap::new()),
                clients_count: AtomicUsize::new(0),
                connections,
                cluster,
                policy,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn in_cluster(&self) -> bool {
        self.inner.cluster.is_some()
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        self.inner.cluster.as_ref().map(|rpc| rpc.worker_id())
    }

    /// Variants a session on `kind` may upgrade to under this config.
    pub fn upgrades(&self, kind: TransportKind) -> Vec<TransportKind> {
        if !self.inner.config.allow_upgrades {
            return Vec::new();
        }
        kind.upgrades_to()
            .iter()
            .copied()
            .filter(|target| self.inner.config.is_registered(*target))
            .collect()
    }

    pub fn clients_count(&self) -> usize {
        self.inner.clients_count.load(Ordering::SeqCst)
    }

    pub fn client(&self, sid: &Sid) -> Option<Arc<Socket>> {
        self.inner.clients().get(sid).cloned()
    }

    /// Receives every socket created by a handshake.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Socket>> {
        self.inner.connections.subscribe()
    }

    /// Checks the transport, sid and method of a request.
    pub async fn verify(&self, req: &Request) -> Result<(), VerifyError> {
        self.verify_request(req).await.map(|_| ())
    }

    async fn verify_request(&self, req: &Request) -> Result<TransportKind, VerifyError> {
        let name = req.transport().unwrap_or_default();
        let kind = TransportKind::from_name(name)
            .filter(|kind| self.inner.config.is_registered(*kind))
            .ok_or_else(|| VerifyError::UnknownTransport(name.to_string()))?;

        let Some(sid) = req.sid() else {
            if req.method == Method::Get {
                return Ok(kind);
            }
            return Err(VerifyError::BadHandshakeMethod(req.method));
        };

        if self.inner.clients().contains_key(&sid) {
            return Ok(kind);
        }
        let Some(rpc) = &self.inner.cluster else {
            return Err(VerifyError::UnknownSid(sid));
        };
        tracing::debug!(sid = %sid, "verifying sid with coordinator");
        match rpc
            .call(RemoteCall::Verify(sid.clone()))
            .await
            .map_err(VerifyError::Cluster)?
        {
            RemoteReply::Verified(true) => Ok(kind),
            _ => Err(VerifyError::UnknownSid(sid)),
        }
    }

    /// Verifies and routes an HTTP request.
    pub async fn handle_request(&self, req: &Request) -> Result<RequestRoute, VerifyError> {
        let kind = self.verify_request(req).await.inspect_err(|e| {
            tracing::debug!(method = %req.method, error = %e, "request could not be verified");
        })?;

        let Some(sid) = req.sid() else {
            let (socket, transport) = self.handshake(kind).await;
            return Ok(RequestRoute::Handshake { socket, transport });
        };
        if let Some(socket) = self.client(&sid) {
            return Ok(RequestRoute::Session(socket));
        }
        match self.remote_owner(&sid).await? {
            Some(worker) => Ok(RequestRoute::Remote(worker)),
            None => Err(VerifyError::UnknownSid(sid)),
        }
    }

    /// Creates a session on a new transport of `kind`.
    pub async fn handshake(&self, kind: TransportKind) -> (Arc<Socket>, TransportHandle) {
        let handle = TransportHandle::build(kind);
        let socket = self.register(handle.shared()).await;
        (socket, handle)
    }

    async fn register(&self, transport: Arc<dyn Transport>) -> Arc<Socket> {
        let options = SocketOptions {
            ping_interval: self.inner.config.ping_interval(),
            ping_timeout: self.inner.config.ping_timeout(),
            upgrade_timeout: self.inner.config.upgrade_timeout(),
            upgrades: self.upgrades(transport.kind()),
        };
        let socket = {
            let mut clients = self.inner.clients();
            let sid = loop {
                let sid = Sid::generate();
                if !clients.contains_key(&sid) {
                    break sid;
                }
            };
            let socket = Socket::open(sid.clone(), transport, options, Some(self.close_hook()));
            clients.insert(sid, socket.clone());
            self.inner.clients_count.fetch_add(1, Ordering::SeqCst);
            socket
        };
        tracing::info!(sid = %socket.sid(), transport = socket.transport().name(), "client handshaken");

        if let Some(rpc) = &self.inner.cluster {
            if let Err(e) = rpc.call(RemoteCall::Handshake(socket.sid().clone())).await {
                tracing::warn!(sid = %socket.sid(), error = %e, "failed to register sid in cluster");
            }
        }
        let _ = self.inner.connections.send(socket.clone());
        socket
    }

    fn close_hook(&self) -> CloseHook {
        let server = Arc::downgrade(&self.inner);
        Box::new(move |sid, reason| {
            if let Some(server) = server.upgrade() {
                server.remove_client(sid, reason);
            }
        })
    }

    async fn remote_owner(&self, sid: &Sid) -> Result<Option<WorkerId>, VerifyError> {
        let Some(rpc) = &self.inner.cluster else {
            return Ok(None);
        };
        match rpc
            .call(RemoteCall::LookupWorker(sid.clone()))
            .await
            .map_err(VerifyError::Cluster)?
        {
            RemoteReply::Owner(Some(worker)) if worker != rpc.worker_id() => Ok(Some(worker)),
            _ => Ok(None),
        }
    }

    /// Handles a persistent-socket connection produced by an HTTP upgrade.
    ///
    /// The candidate is discarded if verification fails or its session
    /// lives elsewhere, and closed if its session was already upgraded.
    pub async fn handle_upgrade_request(
        &self,
        req: &Request,
        candidate: Arc<dyn Transport>,
    ) -> Result<UpgradeOutcome, EngineError> {
        if let Err(e) = self.verify_request(req).await {
            tracing::debug!(error = %e, "upgrade verification failed");
            candidate.discard();
            return Err(e.into());
        }

        let Some(sid) = req.sid() else {
            return Ok(UpgradeOutcome::Handshake(self.register(candidate).await));
        };

        if let Some(socket) = self.client(&sid) {
            if socket.is_upgraded() {
                tracing::debug!(sid = %sid, "transport had already been upgraded");
                candidate.close(None);
                return Err(UpgradeRejected::AlreadyUpgraded.into());
            }
            socket.maybe_upgrade(candidate)?;
            return Ok(UpgradeOutcome::Upgrading(socket));
        }

        match self.remote_owner(&sid).await {
            Ok(Some(worker)) => {
                tracing::debug!(sid = %sid, worker = %worker, "upgrade belongs to another worker");
                candidate.discard();
                Ok(UpgradeOutcome::Forward(worker))
            }
            Ok(None) => {
                candidate.discard();
                Err(UpgradeRejected::UnknownSid(sid).into())
            }
            Err(e) => {
                candidate.discard();
                Err(e.into())
            }
        }
    }

    /// Answers legacy policy probes on a raw stream, or hands it back.
    pub async fn probe_legacy_policy<S>(&self, stream: S) -> std::io::Result<ProbeResult<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.inner.config.is_registered(TransportKind::PolicyProbe) {
            return Ok(ProbeResult::Detached {
                stream,
                consumed: Vec::new(),
            });
        }
        serve_policy_probe(stream, &self.inner.policy).await
    }

    /// Closes every open session.
    pub fn close(&self) {
        let sockets: Vec<Arc<Socket>> = self.inner.clients().values().cloned().collect();
        tracing::debug!(count = sockets.len(), "closing all open clients");
        for socket in sockets {
            socket.close();
        }
    }
}

#[cfg(test)]
#[path = "tests/server_tests.rs"]
mod server_tests;

#[cfg(test)]
#[path = "tests/cluster_tests.rs"]
mod cluster_tests;
