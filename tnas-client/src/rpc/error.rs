use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the backend session.
///
/// The split matters to callers: transient errors mean the session is
/// reconnecting and the operation is safe to retry; faults came back from
/// the middleware itself and retrying will not help.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The socket is down or the session is between reconnect attempts.
    #[error("backend session unavailable: {0}")]
    Unavailable(String),

    /// The per-call deadline elapsed before a response arrived.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The middleware answered with a JSON-RPC error object.
    #[error("backend fault (code {code}): {message}")]
    Fault { code: i64, message: String },

    /// The peer sent a frame we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication was rejected by the middleware.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

impl RpcError {
    /// True when the operation may succeed after the session reconnects.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Unavailable(_) | RpcError::Timeout(_))
    }
}
