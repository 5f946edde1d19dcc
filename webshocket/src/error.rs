//!
//! [`enum@Error`] enum declaration for webshocket-level errors.
//!
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection attempts exhausted: {0}")]
    ConnectionFailed(String),

    #[error("recv() timed out")]
    ReceiveTimeout,

    #[error("RPC call timed out waiting for a response")]
    RpcTimeout,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("{0}")]
    PacketError(String),

    #[error("failed to decode packet: {0}")]
    Decode(String),

    #[error("failed to encode packet: {0}")]
    Encode(String),

    #[error("RPC error: {0:?} {1}")]
    RpcError(crate::packet::ErrorCode, String),

    #[error(transparent)]
    Transport(#[from] webshocket_transport::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<borsh::io::Error> for Error {
    fn from(err: borsh::io::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
