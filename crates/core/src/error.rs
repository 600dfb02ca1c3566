use crate::session::SessionState;
use std::time::Duration;

/// Everything that can go wrong between the caller and the vendor link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The transport could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The remote never sent its session-ready message.
    #[error("no negotiation message within {0:?}")]
    NegotiationTimeout(Duration),
    /// The first message after connecting was not the negotiation message.
    #[error("unexpected negotiation message: {0}")]
    UnexpectedMessage(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("operation not valid in state {0}")]
    InvalidState(SessionState),
    #[error("send failed: {0}")]
    Send(String),
    #[error("link error: {0}")]
    Link(String),
    #[error("a finalize is already outstanding")]
    AlreadyFinalizing,
    #[error("reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
    /// The vendor protocol could not encode or decode a payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request {0} is already streaming")]
    DuplicateRequest(String),
    #[error("session is closed")]
    Closed,
}

impl EngineError {
    /// Transport-level failures are worth another connect attempt; handshake
    /// and protocol failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Connect(_) | EngineError::Link(_) | EngineError::Send(_)
        )
    }
}
