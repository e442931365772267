//! Wire format of the worker/coordinator channel.
//!
//! One JSON object per line. Engine messages carry `"__engine": true`;
//! anything else on the channel belongs to the application and is passed
//! through untouched.
//!
//! ```text
//! {"__engine":true,"fn":"verify","args":["<sid>"],"id":3,"wid":2}
//! ```
//!
//! A response reuses the request's `fn` and `id`, with `args` holding the
//! result values. Calls sent without an `id` get no response.

use crate::packet::Sid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Environment variable a worker reads its id from.
pub const WORKER_ID_ENV: &str = "ENGINE_WORKER_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Reads the worker id assigned by the coordinator, if any.
    pub fn from_env() -> Option<Self> {
        std::env::var(WORKER_ID_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(WorkerId)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteFn {
    Verify,
    Handshake,
    Close,
    LookupWorker,
}

impl fmt::Display for RemoteFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteFn::Verify => "verify",
            RemoteFn::Handshake => "handshake",
            RemoteFn::Close => "close",
            RemoteFn::LookupWorker => "lookupWorker",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "__engine")]
    pub tag: bool,
    #[serde(rename = "fn")]
    pub function: RemoteFn,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub wid: WorkerId,
}

impl Envelope {
    pub fn request(wid: WorkerId, call: &RemoteCall, id: Option<u64>) -> Self {
        Self {
            tag: true,
            function: call.function(),
            args: call.to_args(),
            id,
            wid,
        }
    }

    /// Builds the answer to `request` carrying `reply`.
    pub fn response(request: &Envelope, reply: &RemoteReply) -> Self {
        Self {
            tag: true,
            function: request.function,
            args: reply.to_args(),
            id: request.id,
            wid: request.wid,
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Json(e.to_string()))
    }
}

/// A request from a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Verify(Sid),
    Handshake(Sid),
    Close(Sid),
    LookupWorker(Sid),
}

impl RemoteCall {
    pub fn function(&self) -> RemoteFn {
        match self {
            RemoteCall::Verify(_) => RemoteFn::Verify,
            RemoteCall::Handshake(_) => RemoteFn::Handshake,
            RemoteCall::Close(_) => RemoteFn::Close,
            RemoteCall::LookupWorker(_) => RemoteFn::LookupWorker,
        }
    }

    pub fn sid(&self) -> &Sid {
        match self {
            RemoteCall::Verify(sid)
            | RemoteCall::Handshake(sid)
            | RemoteCall::Close(sid)
            | RemoteCall::LookupWorker(sid) => sid,
        }
    }

    pub fn to_args(&self) -> Vec<Value> {
        vec![Value::String(self.sid().to_string())]
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let sid = match envelope.args.first() {
            Some(Value::String(sid)) => Sid::from(sid.as_str()),
            Some(_) => {
                return Err(ProtocolError::InvalidArgument {
                    function: envelope.function,
                    index: 0,
                })
            }
            None => {
                return Err(ProtocolError::MissingArgument {
                    function: envelope.function,
                    index: 0,
                })
            }
        };
        Ok(match envelope.function {
            RemoteFn::Verify => RemoteCall::Verify(sid),
            RemoteFn::Handshake => RemoteCall::Handshake(sid),
            RemoteFn::Close => RemoteCall::Close(sid),
            RemoteFn::LookupWorker => RemoteCall::LookupWorker(sid),
        })
    }
}

/// The coordinator's answer to a [`RemoteCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteReply {
    Verified(bool),
    Ack,
    Owner(Option<WorkerId>),
}

impl RemoteReply {
    pub fn to_args(&self) -> Vec<Value> {
        match self {
            RemoteReply::Verified(exists) => vec![Value::Bool(*exists)],
            RemoteReply::Ack | RemoteReply::Owner(None) => Vec::new(),
            RemoteReply::Owner(Some(worker)) => vec![Value::from(worker.0)],
        }
    }

    /// Decodes the result values of a response to `function`.
    pub fn from_args(function: RemoteFn, args: &[Value]) -> Result<Self, ProtocolError> {
        match function {
            RemoteFn::Verify => match args.first() {
                Some(Value::Bool(exists)) => Ok(RemoteReply::Verified(*exists)),
                Some(_) => Err(ProtocolError::InvalidArgument { function, index: 0 }),
                None => Err(ProtocolError::MissingArgument { function, index: 0 }),
            },
            RemoteFn::Handshake | RemoteFn::Close => Ok(RemoteReply::Ack),
            RemoteFn::LookupWorker => match args.first() {
                None | Some(Value::Null) => Ok(RemoteReply::Owner(None)),
                Some(value) => value
                    .as_u64()
                    .and_then(|raw| u32::try_from(raw).ok())
                    .map(|raw| RemoteReply::Owner(Some(WorkerId(raw))))
                    .ok_or(ProtocolError::InvalidArgument { function, index: 0 }),
            },
        }
    }
}

/// One decoded line from the channel.
#[derive(Debug)]
pub enum Inbound {
    Tagged(Envelope),
    /// An application message sharing the channel.
    Foreign(Value),
    Malformed(ProtocolError),
}

pub fn decode_line(line: &str) -> Inbound {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Inbound::Malformed(ProtocolError::Json(e.to_string())),
    };
    if value.get("__engine").and_then(Value::as_bool) != Some(true) {
        return Inbound::Foreign(value);
    }
    match serde_json::from_value(value) {
        Ok(envelope) => Inbound::Tagged(envelope),
        Err(e) => Inbound::Malformed(ProtocolError::Json(e.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Json(String),
    MissingArgument { function: RemoteFn, index: usize },
    InvalidArgument { function: RemoteFn, index: usize },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Json(detail) => write!(f, "invalid message: {}", detail),
            ProtocolError::MissingArgument { function, index } => {
                write!(f, "{} is missing argument {}", function, index)
            }
            ProtocolError::InvalidArgument { function, index } => {
                write!(f, "{} has an invalid argument {}", function, index)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Writes queued lines to `writer` until the queue closes or a write fails.
pub(crate) async fn write_lines<W>(mut lines: mpsc::UnboundedReceiver<String>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "cluster channel write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!(error = %e, "cluster channel flush failed");
            break;
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
