//! Error types for the warden client.

use crate::protocol::MessageType;

/// Result type alias for warden client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the warden daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Generic I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection (EOF before or inside a frame).
    #[error("connection closed by server")]
    Disconnected,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The frame length header was not a decimal integer.
    #[error("malformed frame header: {0:?}")]
    InvalidHeader(String),

    /// The envelope carried a tag outside the known message set.
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    /// The envelope tag did not match the expected response variant.
    #[error("expected message type {expected:?}, got {got:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        got: MessageType,
    },

    /// A protobuf payload failed to decode.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// The server answered with an Error envelope.
    #[error(transparent)]
    Warden(#[from] WardenError),
}

impl Error {
    /// True when the error means the transport itself is broken and the
    /// connection must be discarded. Protocol and server errors leave the
    /// connection usable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Disconnected)
    }
}

/// A fault reported by the warden daemon.
///
/// Displays as the server's message verbatim; `data` and `backtrace` carry
/// whatever diagnostics the server attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WardenError {
    /// Human-readable failure description from the server.
    pub message: String,
    /// Opaque auxiliary data from the server.
    pub data: String,
    /// Server-side backtrace lines, if provided.
    pub backtrace: Vec<String>,
}
