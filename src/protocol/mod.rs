//! Protocol module - wire format, framing, and control payloads.
//!
//! This module implements the binary framing shared by TCP and UDP:
//! - 5-byte header encoding/decoding (`int32 LE length` + kind byte)
//! - Fixed-capacity frame buffer for accumulating partial reads
//! - `UdpInformation` payload used by the rendezvous

mod frame;
mod frame_buffer;
mod rendezvous;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{AccumulatorState, FrameBuffer};
pub use rendezvous::{UdpInformation, UDP_INFORMATION_SIZE};
pub use wire_format::{
    decode_length, max_payload_size, validate_length, FrameKind, Header, DEFAULT_PACKET_SIZE,
    HEADER_SIZE, LENGTH_PREFIX_SIZE,
};
