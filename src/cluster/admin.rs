//! Read-only admin service for inspecting a running coordinator.
//!
//! Served over localhost TCP with bincode framing. The listener stops when
//! the shutdown broadcast fires.

use super::coordinator::{Coordinator, WorkerSummary};
use super::protocol::WorkerId;
use crate::packet::Sid;
use futures::StreamExt;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Bincode;
use tokio::sync::broadcast;

/// Git SHA the engine was built from.
pub const BUILD_SHA: &str = env!("ENGINE_GIT_SHA");

#[tarpc::service]
pub trait ClusterAdmin {
    /// Live workers, ordered by id.
    async fn workers() -> Vec<WorkerSummary>;

    /// The worker that owns `sid`, if any.
    async fn lookup_worker(sid: Sid) -> Option<WorkerId>;

    /// Number of sessions tracked cluster-wide.
    async fn session_count() -> usize;

    async fn build_sha() -> String;
}

#[derive(Clone)]
pub struct AdminServer {
    coordinator: Coordinator,
}

impl AdminServer {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}

impl ClusterAdmin for AdminServer {
    async fn workers(self, _: tarpc::context::Context) -> Vec<WorkerSummary> {
        self.coordinator.workers().await
    }

    async fn lookup_worker(self, _: tarpc::context::Context, sid: Sid) -> Option<WorkerId> {
        self.coordinator.lookup(&sid).await
    }

    async fn session_count(self, _: tarpc::context::Context) -> usize {
        self.coordinator.session_count().await
    }

    async fn build_sha(self, _: tarpc::context::Context) -> String {
        BUILD_SHA.to_string()
    }
}

/// Serves [`ClusterAdmin`] on `127.0.0.1:port` until shutdown.
pub async fn run_admin_server(
    coordinator: Coordinator,
    shutdown_tx: broadcast::Sender<()>,
    port: u16,
) -> anyhow::Result<()> {
    use tarpc::serde_transport::tcp;

    let addr = format!("127.0.0.1:{}", port);
    let mut listener = tcp::listen(&addr, Bincode::default).await?;
    tracing::info!(%addr, "cluster admin listening");

    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            Some(result) = listener.next() => {
                match result {
                    Ok(transport) => {
                        let server = AdminServer::new(coordinator.clone());
                        let channel = server::BaseChannel::with_defaults(transport);

                        tokio::spawn(async move {
                            channel.execute(server.serve()).for_each(|response| async {
                                tokio::spawn(response);
                            }).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "admin accept error");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    tracing::info!(%addr, "cluster admin stopped");
    Ok(())
}

/// Find an available TCP port.
pub async fn find_available_port() -> anyhow::Result<u16> {
    use tokio::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
#[path = "tests/admin_tests.rs"]
mod tests;
