//! Legacy cross-domain policy responder for raw TCP streams.
//!
//! Plugin-based socket clients open a plain connection and send a fixed
//! request before anything else. Streams that do not start that way are
//! handed back untouched, with whatever bytes were read, so the caller can
//! continue with normal HTTP handling.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The exact request a policy client sends, including the trailing NUL.
pub const POLICY_REQUEST: &[u8; 23] = b"<policy-file-request/>\0";

/// Served when no policy file is configured.
pub const DEFAULT_POLICY: &[u8] = b"<?xml version=\"1.0\"?>\n\
<!DOCTYPE cross-domain-policy SYSTEM \"http://www.macromedia.com/xml/dtds/cross-domain-policy.dtd\">\n\
<cross-domain-policy>\n\
  <allow-access-from domain=\"*\" to-ports=\"*\"/>\n\
</cross-domain-policy>\n\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Fewer than 23 bytes seen so far, all consistent with a probe.
    NeedMore,
    /// The full request matched; write the policy and end the stream.
    Respond,
    /// Not a policy request; stop inspecting this stream.
    Detach,
}

/// Incremental matcher over the first bytes of a stream. Once it decides,
/// the decision is final.
#[derive(Debug, Default)]
pub struct PolicyProbe {
    buffer: Vec<u8>,
    decided: Option<ProbeOutcome>,
}

impl PolicyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> ProbeOutcome {
        if let Some(outcome) = self.decided {
            return outcome;
        }
        let Some(&first) = self.buffer.first().or(chunk.first()) else {
            return ProbeOutcome::NeedMore;
        };
        if first != b'<' {
            return self.decide(ProbeOutcome::Detach);
        }

        let wanted = POLICY_REQUEST.len() - self.buffer.len();
        let take = wanted.min(chunk.len());
        self.buffer.extend_from_slice(&chunk[..take]);
        if self.buffer.len() < POLICY_REQUEST.len() {
            return ProbeOutcome::NeedMore;
        }

        if self.buffer.as_slice() == POLICY_REQUEST.as_slice() {
            self.decide(ProbeOutcome::Respond)
        } else {
            self.decide(ProbeOutcome::Detach)
        }
    }

    fn decide(&mut self, outcome: ProbeOutcome) -> ProbeOutcome {
        self.buffer = Vec::new();
        self.decided = Some(outcome);
        outcome
    }
}

/// Result of inspecting a raw stream.
#[derive(Debug)]
pub enum ProbeResult<S> {
    /// The policy was written and the stream shut down.
    Responded,
    /// The stream is not a policy client. `consumed` holds every byte read.
    Detached { stream: S, consumed: Vec<u8> },
}

/// Reads from `stream` until the probe decides, then either answers with
/// `policy` or hands the stream back.
pub async fn serve_policy_probe<S>(mut stream: S, policy: &[u8]) -> std::io::Result<ProbeResult<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut probe = PolicyProbe::new();
    let mut consumed = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(ProbeResult::Detached { stream, consumed });
        }
        consumed.extend_from_slice(&chunk[..read]);
        match probe.feed(&chunk[..read]) {
            ProbeOutcome::NeedMore => {}
            ProbeOutcome::Respond => {
                stream.write_all(policy).await?;
                stream.shutdown().await?;
                tracing::debug!("served cross-domain policy");
                return Ok(ProbeResult::Responded);
            }
            ProbeOutcome::Detach => return Ok(ProbeResult::Detached { stream, consumed }),
        }
    }
}

#[cfg(test)]
#[path = "tests/policy_tests.rs"]
mod tests;
