use thiserror::Error;

use crate::rpc::RpcError;

/// Errors returned by the typed TrueNAS client.
///
/// Every outward-facing variant carries a stable textual tag so operators
/// and tests can assert on it.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("dataset '{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists with a different configuration")]
    Mismatch(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("volume shrink refused: {current} bytes -> {requested} bytes")]
    ShrinkRefused { current: u64, requested: u64 },

    #[error("NoTCPNVMeOFPort: no TCP NVMe-oF port is configured on the backend")]
    NoTcpNvmeofPort,

    #[error("backend job failed: {0}")]
    JobFailed(String),

    #[error("unexpected backend reply: {0}")]
    UnexpectedReply(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ClientError {
    /// True when the operation is safe to retry after the session recovers.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Rpc(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tcp_port_tag_is_stable() {
        let err = ClientError::NoTcpNvmeofPort;
        assert!(err.to_string().starts_with("NoTCPNVMeOFPort"));
    }

    #[test]
    fn test_transient_follows_rpc_classification() {
        let transient = ClientError::Rpc(RpcError::Unavailable("gone".into()));
        assert!(transient.is_transient());

        let fault = ClientError::Rpc(RpcError::Fault {
            code: 22,
            message: "bad".into(),
        });
        assert!(!fault.is_transient());

        assert!(!ClientError::NotFound("tank/x".into()).is_transient());
        assert!(!ClientError::NoTcpNvmeofPort.is_transient());
    }
}
