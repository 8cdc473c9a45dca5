//! Runtime error types.

use sockline_wire::{InvalidService, WireError};

/// Everything an IPC operation can surface to its caller.
///
/// `Wire` and `Protocol` in steady state are terminal for the connection
/// that produced them: the dispatch task sends a best-effort `Fail`,
/// closes the socket, and fires `on_disconnect` once. `NotConnected` and
/// `HandshakeRejected` only concern the calling operation.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Operation issued against a connection that is not open.
    #[error("connection is not open")]
    NotConnected,

    /// Transport or framing failure underneath the operation.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A syntactically valid frame arrived at a point the state machine
    /// does not accept it.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The peer refused the handshake; carries the peer's reason.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The service name could not be understood.
    #[error(transparent)]
    Endpoint(#[from] InvalidService),
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Wire(WireError::Io(e))
    }
}
