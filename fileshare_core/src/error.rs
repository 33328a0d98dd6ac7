use std::time::Duration;
use thiserror::Error;

use crate::transfer::message::MessageType;

/// Stream-level failures of the frame codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?} waiting for a frame")]
    Timeout(Duration),

    #[error("Message too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of a single exchange (list, download, upload) on either endpoint.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("File not found: {0}")]
    NotFound(String),

    /// Error frame received from the server
    #[error("Server error: {0}")]
    Remote(String),

    /// The peer aborted the transfer with an error frame; nothing more to send
    #[error("Peer aborted transfer: {0}")]
    PeerAborted(String),

    /// A local failure that has already been reported to the peer
    #[error("Transfer aborted: {0}")]
    Aborted(String),

    #[error("Unexpected response: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("Malformed {msg_type} payload: {reason}")]
    Malformed { msg_type: MessageType, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Incomplete transfer: {0}")]
    IncompleteTransfer(String),

    #[error("Invalid file upload request: {0}")]
    InvalidUpload(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout(after) => TransferError::Timeout(after),
            other => TransferError::Protocol(other),
        }
    }
}

impl TransferError {
    /// Stream-level failures end the server's connection loop; everything
    /// else is handled at the exchange level.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::NotConnected
                | TransferError::Connect { .. }
                | TransferError::ConnectionLost
                | TransferError::Timeout(_)
                | TransferError::Cancelled
                | TransferError::Protocol(_)
        )
    }

    /// Whether the peer has already been told about this failure (or told us),
    /// so no error frame should follow it.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            TransferError::PeerAborted(_) | TransferError::Aborted(_) | TransferError::Cancelled
        )
    }

    /// Whether the client connection can no longer be trusted to be in sync
    /// with the server after this failure.
    pub fn invalidates_connection(&self) -> bool {
        match self {
            TransferError::Cancelled => false,
            TransferError::UnexpectedMessage { .. }
            | TransferError::Malformed { .. }
            | TransferError::ProtocolViolation(_)
            | TransferError::IncompleteTransfer(_) => true,
            other => other.is_fatal(),
        }
    }
}
