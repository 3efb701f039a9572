//! Wire format encoding and decoding.
//!
//! Every frame starts with a 5-byte header:
//! ```text
//! ┌──────────────┬────────┬──────────────────────┐
//! │ Length       │ Kind   │ Payload              │
//! │ 4 bytes      │ 1 byte │ length - 1 bytes     │
//! │ int32 LE     │        │                      │
//! └──────────────┴────────┴──────────────────────┘
//! ```
//!
//! `length` counts the kind byte plus the payload, so it is always
//! `payload.len() + 1` and never less than 1.

use crate::error::{Result, TransportError};

/// Size of the little-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Header size in bytes (length prefix + kind).
pub const HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Default fixed buffer size shared by every frame (header included).
pub const DEFAULT_PACKET_SIZE: usize = 1024;

/// Kind tag carried in the fifth byte of every frame.
///
/// Kinds compare by wire value, so `Custom(1)` equals `UdpInformation`.
/// Decoding never produces `Custom` for 0, 1 or 2.
#[derive(Debug, Clone, Copy)]
pub enum FrameKind {
    /// Application payload (wire value 0).
    Application,
    /// UDP endpoint announcement sent over TCP during rendezvous (wire value 1).
    UdpInformation,
    /// Keepalive heartbeat with empty payload (wire value 2).
    Ping,
    /// Any other tag. Delivered to the application like `Application`.
    Custom(u8),
}

impl FrameKind {
    /// Wire value of this kind.
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Application => 0,
            FrameKind::UdpInformation => 1,
            FrameKind::Ping => 2,
            FrameKind::Custom(value) => value,
        }
    }

    /// Whether the transport consumes this kind internally.
    ///
    /// Decided by wire value, so `Custom(1)` and `Custom(2)` count too.
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self.as_u8(), 1 | 2)
    }
}

impl PartialEq for FrameKind {
    fn eq(&self, other: &Self) -> bool {
        self.as_u8() == other.as_u8()
    }
}

impl Eq for FrameKind {}

impl std::hash::Hash for FrameKind {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_u8().hash(state);
    }
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            0 => FrameKind::Application,
            1 => FrameKind::UdpInformation,
            2 => FrameKind::Ping,
            other => FrameKind::Custom(other),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(kind: FrameKind) -> Self {
        kind.as_u8()
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Declared length: kind byte plus payload.
    pub length: i32,
    /// Frame kind.
    pub kind: FrameKind,
}

impl Header {
    /// Create a new header.
    pub fn new(length: i32, kind: FrameKind) -> Self {
        Self { length, kind }
    }

    /// Header describing a payload of `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the length does not fit an `i32`.
    pub fn for_payload(kind: FrameKind, payload_len: usize) -> Result<Self> {
        let length = i32::try_from(payload_len + 1).map_err(|_| {
            TransportError::PayloadTooLarge {
                size: payload_len,
                max: i32::MAX as usize - 1,
            }
        })?;
        Ok(Self { length, kind })
    }

    /// Encode header to bytes (little endian length).
    ///
    /// # Example
    ///
    /// ```
    /// use hybrid_transport::protocol::{FrameKind, Header};
    ///
    /// let header = Header::new(3, FrameKind::Application);
    /// assert_eq!(header.encode(), [3, 0, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (5 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&self.length.to_le_bytes());
        buf[LENGTH_PREFIX_SIZE] = self.kind.as_u8();
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: decode_length([buf[0], buf[1], buf[2], buf[3]]),
            kind: FrameKind::from(buf[LENGTH_PREFIX_SIZE]),
        })
    }

    /// Check the declared length against a buffer capacity.
    pub fn validate(&self, capacity: usize) -> Result<()> {
        validate_length(self.length, capacity).map(|_| ())
    }

    /// Payload length implied by the declared length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.length.max(1) - 1) as usize
    }

    /// Total bytes on the wire for this frame, prefix included.
    #[inline]
    pub fn total_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.length.max(0) as usize
    }
}

/// Read a little-endian `i32` length prefix.
#[inline]
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> i32 {
    i32::from_le_bytes(prefix)
}

/// Validate a declared length, returning the total frame size in bytes.
///
/// A length of zero or less cannot hold the kind byte. A total size above
/// `capacity` would overrun the receiving buffer.
pub fn validate_length(length: i32, capacity: usize) -> Result<usize> {
    if length <= 0 {
        return Err(TransportError::ProtocolViolation(format!(
            "Declared frame length {} is not positive",
            length
        )));
    }

    let total = LENGTH_PREFIX_SIZE + length as usize;
    if total > capacity {
        return Err(TransportError::ProtocolViolation(format!(
            "Frame size {} exceeds buffer capacity {}",
            total, capacity
        )));
    }

    Ok(total)
}

/// Largest payload a buffer of `capacity` bytes can carry.
#[inline]
pub fn max_payload_size(capacity: usize) -> usize {
    capacity.saturating_sub(HEADER_SIZE)
}
