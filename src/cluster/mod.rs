//! Cluster session affinity.
//!
//! Workers share one listening port, but each session lives in exactly one
//! worker. The [`Coordinator`] in the master process tracks which worker
//! owns each sid; workers reach it through an [`RpcClient`] over a
//! line-delimited JSON channel on the worker's stdio.

pub mod admin;
pub mod client;
pub mod coordinator;
pub mod protocol;

pub use admin::{run_admin_server, ClusterAdmin, ClusterAdminClient};
pub use client::{RpcClient, RpcError};
pub use coordinator::{ClusterEvent, Coordinator, CoordinatorState, WorkerSummary};
pub use protocol::{RemoteCall, RemoteFn, RemoteReply, WorkerId};
