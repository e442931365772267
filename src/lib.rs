//! Realtime session engine.
//!
//! A session starts on a polling transport and may be moved to a
//! persistent socket without losing frames. In a multi-process deployment
//! a coordinator tracks which worker owns each session id, so any worker
//! can verify a request and route it to the owner.

pub mod cluster;
pub mod config;
pub mod logging;
pub mod packet;
pub mod policy;
pub mod server;
pub mod socket;
pub mod transport;

pub use config::EngineConfig;
pub use packet::{Packet, Sid};
pub use server::{EngineError, Request, RequestRoute, Server, UpgradeOutcome, VerifyError};
pub use socket::{Socket, SocketEvent, SocketState, UpgradeRejected};
pub use transport::{Transport, TransportKind};
