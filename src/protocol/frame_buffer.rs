//! Frame buffer for accumulating partial reads.
//!
//! A fixed-size buffer that rebuilds frames from an arbitrarily chunked
//! byte stream. The buffer is allocated once and reused for every frame:
//! - `Empty`: nothing buffered
//! - `Accumulating`: part of a frame (possibly part of the length prefix)
//! - `Complete`: a whole frame is buffered and can be taken
//!
//! The same type doubles as the per-connection send buffer through
//! [`FrameBuffer::encode`].
//!
//! # Example
//!
//! ```
//! use hybrid_transport::protocol::{build_frame, FrameBuffer, FrameKind};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(FrameKind::Application, b"hello");
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].payload(), b"hello");
//! ```

use super::wire_format::{
    decode_length, max_payload_size, validate_length, FrameKind, Header, DEFAULT_PACKET_SIZE,
    HEADER_SIZE, LENGTH_PREFIX_SIZE,
};
use super::Frame;
use crate::error::{Result, TransportError};

/// Accumulator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    /// No bytes buffered.
    Empty,
    /// Some bytes of a frame buffered.
    Accumulating,
    /// A whole frame is buffered.
    Complete,
}

/// Fixed-capacity frame accumulator and encoder.
pub struct FrameBuffer {
    /// Backing storage, `capacity` bytes.
    buffer: Box<[u8]>,
    /// Number of valid bytes in `buffer`.
    filled: usize,
    /// Total frame size once the length prefix is known.
    frame_size: Option<usize>,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default 1024-byte capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PACKET_SIZE)
    }

    /// Create a new frame buffer with custom capacity.
    ///
    /// Capacity below the header size is raised to `HEADER_SIZE`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(HEADER_SIZE)].into_boxed_slice(),
            filled: 0,
            frame_size: None,
        }
    }

    /// Total capacity in bytes (header included).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Largest payload this buffer can encode or accept.
    #[inline]
    pub fn max_payload(&self) -> usize {
        max_payload_size(self.capacity())
    }

    /// Write a frame for `payload` into the buffer.
    ///
    /// Returns the number of bytes written; the encoded frame is then
    /// available through [`encoded`](Self::encoded). Any partially
    /// accumulated data is discarded.
    ///
    /// # Errors
    ///
    /// Returns `PayloadTooLarge` if the frame does not fit the buffer.
    pub fn encode(&mut self, kind: FrameKind, payload: &[u8]) -> Result<usize> {
        if payload.len() > self.max_payload() {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload(),
            });
        }

        let header = Header::for_payload(kind, payload.len())?;
        let total = header.total_size();
        header.encode_into(&mut self.buffer[..HEADER_SIZE]);
        self.buffer[HEADER_SIZE..total].copy_from_slice(payload);

        self.filled = total;
        self.frame_size = Some(total);
        Ok(total)
    }

    /// Bytes of the most recently encoded (or accumulated) frame.
    #[inline]
    pub fn encoded(&self) -> &[u8] {
        &self.buffer[..self.filled]
    }

    /// Feed raw bytes into the accumulator.
    ///
    /// Consumes only what the current frame still needs and returns the
    /// unconsumed remainder, so one chunk can be drained into several
    /// frames. Nothing is consumed while a complete frame is still buffered.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` if the length prefix is not positive or
    /// the frame would not fit the buffer. The accumulator is reset first.
    pub fn append<'a>(&mut self, chunk: &'a [u8]) -> Result<&'a [u8]> {
        if self.is_complete() {
            return Ok(chunk);
        }

        let mut rest = chunk;

        if self.filled < LENGTH_PREFIX_SIZE {
            let take = (LENGTH_PREFIX_SIZE - self.filled).min(rest.len());
            self.buffer[self.filled..self.filled + take].copy_from_slice(&rest[..take]);
            self.filled += take;
            rest = &rest[take..];

            if self.filled == LENGTH_PREFIX_SIZE {
                let prefix = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                match validate_length(decode_length(prefix), self.capacity()) {
                    Ok(total) => self.frame_size = Some(total),
                    Err(e) => {
                        self.reset();
                        return Err(e);
                    }
                }
            }
        }

        if let Some(total) = self.frame_size {
            let take = (total - self.filled).min(rest.len());
            self.buffer[self.filled..self.filled + take].copy_from_slice(&rest[..take]);
            self.filled += take;
            rest = &rest[take..];
        }

        Ok(rest)
    }

    /// Whether a whole frame is buffered.
    #[inline]
    pub fn is_complete(&self) -> bool {
        matches!(self.frame_size, Some(total) if self.filled >= total)
    }

    /// Current accumulator state.
    pub fn state(&self) -> AccumulatorState {
        if self.is_complete() {
            AccumulatorState::Complete
        } else if self.filled == 0 {
            AccumulatorState::Empty
        } else {
            AccumulatorState::Accumulating
        }
    }

    /// Kind of the buffered frame, once its kind byte has arrived.
    pub fn kind(&self) -> Option<FrameKind> {
        (self.filled > LENGTH_PREFIX_SIZE).then(|| FrameKind::from(self.buffer[LENGTH_PREFIX_SIZE]))
    }

    /// Payload bytes buffered so far.
    pub fn payload(&self) -> &[u8] {
        if self.filled <= HEADER_SIZE {
            return &[];
        }
        &self.buffer[HEADER_SIZE..self.filled]
    }

    /// Take the complete frame out and reset to `Empty`.
    ///
    /// Returns `None` while the frame is still accumulating.
    pub fn take_frame(&mut self) -> Option<Frame> {
        if !self.is_complete() {
            return None;
        }
        let kind = self.kind()?;
        let frame = Frame::from_parts(kind, self.payload());
        self.reset();
        Some(frame)
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// This is the main API for processing incoming data from a socket.
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for an invalid length prefix. Use
    /// [`push_into`](Self::push_into) to keep the frames completed before it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        self.push_into(data, &mut frames)?;
        Ok(frames)
    }

    /// Like [`push`](Self::push), appending complete frames to `frames`.
    ///
    /// Frames completed before a protocol violation stay in `frames`; the
    /// rest of the chunk is discarded.
    pub fn push_into(&mut self, data: &[u8], frames: &mut Vec<Frame>) -> Result<()> {
        let mut rest = data;

        loop {
            rest = self.append(rest)?;
            match self.take_frame() {
                Some(frame) => frames.push(frame),
                None => break,
            }
            if rest.is_empty() {
                break;
            }
        }

        Ok(())
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Check if nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Return to `Empty`, keeping the allocation.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.frame_size = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity())
            .field("filled", &self.filled)
            .field("frame_size", &self.frame_size)
            .finish()
    }
}
