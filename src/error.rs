//! Error types for hybrid-transport.

use thiserror::Error;

/// Main error type for all transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error while binding or configuring a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connect attempt failed. Retryable by the caller.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The connection is gone; a new connect/accept is required.
    #[error("Disconnected")]
    Disconnected,

    /// Operation needs an established connection.
    #[error("Not connected")]
    NotConnected,

    /// Malformed or oversized frame on the wire.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Outbound payload does not fit the frame buffer.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// API misuse, such as the UDP send variant not matching the bound mode.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Dispatcher queue is at capacity.
    #[error("Dispatcher queue full")]
    QueueFull,

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
