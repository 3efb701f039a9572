//! Frame struct with typed accessors.
//!
//! Represents one decoded frame: a kind and its payload.
//! Uses `bytes::Bytes` so payloads can be handed to event callbacks and
//! dispatcher queues without further copies.
//!
//! # Example
//!
//! ```
//! use hybrid_transport::protocol::{Frame, FrameKind};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(FrameKind::Application, Bytes::from_static(b"hello"));
//!
//! assert!(frame.is_application());
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload bytes, without header.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from kind and payload.
    pub fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Create a frame from kind and raw bytes (copies data).
    pub fn from_parts(kind: FrameKind, payload: &[u8]) -> Self {
        Self {
            kind,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Whether this frame is for the application rather than the transport.
    #[inline]
    pub fn is_application(&self) -> bool {
        !self.kind.is_control()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Does not check the result against a buffer capacity; senders go through
/// [`FrameBuffer::encode`](super::FrameBuffer::encode) which does.
///
/// # Example
///
/// ```
/// use hybrid_transport::protocol::{build_frame, FrameKind};
///
/// let bytes = build_frame(FrameKind::Application, b"hi");
/// assert_eq!(bytes, [0x03, 0x00, 0x00, 0x00, 0x00, 0x68, 0x69]);
/// ```
pub fn build_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let header = Header::new((payload.len() + 1) as i32, kind);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
