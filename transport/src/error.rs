//!
//! [`enum@Error`] enum declaration for transport-level errors.
//!
use thiserror::Error;

/// Errors produced by the [`crate::server`] and [`crate::client`] transports.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Listen(String),

    #[error("{0}")]
    Connect(String),

    /// The peer closed the connection without completing the close handshake.
    #[error("Connection closed abnormally")]
    AbnormalClose,

    /// Upgrade request was rejected (e.g. server at capacity).
    #[error("Upgrade rejected: {status} {body}")]
    UpgradeRejected { status: u16, body: String },

    /// A frame carried a header that could not be parsed by the reassembly layer.
    #[error("Malformed frame header")]
    MalformedFrame,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Dispatch channel closed")]
    DispatchClosed,

    #[error("Error signaling listener shutdown: {0}")]
    Stop(String),
    #[error("Error waiting for listener shutdown: {0}")]
    Join(String),
}

impl<T> From<async_channel::SendError<T>> for Error {
    fn from(_: async_channel::SendError<T>) -> Self {
        Error::DispatchClosed
    }
}
