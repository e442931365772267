use super::request::Method;
use crate::cluster::RpcError;
use crate::packet::Sid;
use crate::socket::UpgradeRejected;
use std::fmt;

/// Status every verification failure is answered with.
pub const VERIFY_FAILURE_STATUS: u16 = 400;

/// Why a request was refused before any session state was touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    UnknownTransport(String),
    UnknownSid(Sid),
    BadHandshakeMethod(Method),
    /// The coordinator could not be asked.
    Cluster(RpcError),
}

impl VerifyError {
    /// Error code sent to the client.
    pub fn code(&self) -> u8 {
        match self {
            VerifyError::UnknownTransport(_) => 0,
            VerifyError::UnknownSid(_) | VerifyError::Cluster(_) => 1,
            VerifyError::BadHandshakeMethod(_) => 2,
        }
    }

    /// Client-facing message for [`code`](Self::code).
    pub fn message(&self) -> &'static str {
        match self {
            VerifyError::UnknownTransport(_) => "Transport unknown",
            VerifyError::UnknownSid(_) | VerifyError::Cluster(_) => "Session ID unknown",
            VerifyError::BadHandshakeMethod(_) => "Bad handshake method",
        }
    }

    pub fn status(&self) -> u16 {
        VERIFY_FAILURE_STATUS
    }

    /// JSON response body.
    pub fn body(&self) -> String {
        serde_json::json!({ "code": self.code(), "message": self.message() }).to_string()
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::UnknownTransport(name) => write!(f, "unknown transport \"{}\"", name),
            VerifyError::UnknownSid(sid) => write!(f, "unknown session id {}", sid),
            VerifyError::BadHandshakeMethod(method) => {
                write!(f, "handshake must use GET, got {}", method)
            }
            VerifyError::Cluster(e) => write!(f, "cluster verification failed: {}", e),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Failure of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Verify(VerifyError),
    Upgrade(UpgradeRejected),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Verify(e) => write!(f, "verification failed: {}", e),
            EngineError::Upgrade(e) => write!(f, "upgrade rejected: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<VerifyError> for EngineError {
    fn from(e: VerifyError) -> Self {
        EngineError::Verify(e)
    }
}

impl From<UpgradeRejected> for EngineError {
    fn from(e: UpgradeRejected) -> Self {
        EngineError::Upgrade(e)
    }
}
