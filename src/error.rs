//! Error types for kernel-link.

use thiserror::Error;

use crate::protocol::MessageId;

/// Main error type for all kernel operations.
#[derive(Debug, Error)]
pub enum KernelError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error (table codec).
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error (table codec).
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame prefix is invalid; the byte stream can no longer be trusted.
    #[error("Framing error: {0}")]
    Framing(String),

    /// A single message header could not be parsed or violates a message invariant.
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Payload fields could not be read in the expected order.
    #[error("Payload error: {0}")]
    Payload(String),

    /// No handler is registered for the command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// The worker state rejected an operation.
    #[error("{0}")]
    Domain(String),

    /// Correlation invariant broken (double fulfillment, duplicate registration).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// No reply arrived within the caller's bound.
    #[error("Timed out waiting for reply to message {0}")]
    ReplyTimeout(MessageId),
}

impl KernelError {
    /// Shorthand for a domain error.
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain(message.into())
    }

    /// Whether the error leaves the transport unusable.
    ///
    /// Header, payload and table errors are contained in one message;
    /// the reader has already consumed its bytes and can keep going.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MsgPackEncode(_)
                | Self::MsgPackDecode(_)
                | Self::MalformedHeader(_)
                | Self::Payload(_)
                | Self::UnknownCommand(_)
                | Self::Domain(_)
                | Self::ProtocolViolation(_)
                | Self::ReplyTimeout(_)
        )
    }
}

/// Result type alias using KernelError.
pub type Result<T> = std::result::Result<T, KernelError>;
