//! Server-side peer state.
//!
//! A [`Peer`] is created when its TCP connection is accepted and learns its
//! UDP endpoint later, from the client's `UdpInformation` frame. Until then
//! it is not UDP-ready and UDP sends to it are dropped.

mod registry;

pub(crate) use registry::PeerRegistry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::Result;
use crate::keepalive::KeepaliveHandle;
use crate::protocol::{Frame, FrameBuffer, FrameKind};
use crate::sync::lock;
use crate::transport::{ConnectionId, TcpConnection};

/// Peer identifier; the id of the peer's TCP connection.
pub type PeerId = ConnectionId;

/// One connected client as seen by the server.
pub struct Peer {
    connection: TcpConnection,
    udp_endpoint: Mutex<Option<SocketAddr>>,
    udp_ready: AtomicBool,
    send_buffer: Mutex<FrameBuffer>,
    tcp_receive: Mutex<FrameBuffer>,
    udp_receive: Mutex<FrameBuffer>,
    keepalive: Mutex<Option<KeepaliveHandle>>,
}

impl Peer {
    pub(crate) fn new(connection: TcpConnection, packet_size: usize) -> Self {
        Self {
            connection,
            udp_endpoint: Mutex::new(None),
            udp_ready: AtomicBool::new(false),
            send_buffer: Mutex::new(FrameBuffer::with_capacity(packet_size)),
            tcp_receive: Mutex::new(FrameBuffer::with_capacity(packet_size)),
            udp_receive: Mutex::new(FrameBuffer::with_capacity(packet_size)),
            keepalive: Mutex::new(None),
        }
    }

    /// Peer identifier.
    #[inline]
    pub fn id(&self) -> PeerId {
        self.connection.id()
    }

    /// Remote address of the TCP connection.
    #[inline]
    pub fn tcp_remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    /// Announced UDP endpoint, once the rendezvous completed.
    pub fn udp_remote_addr(&self) -> Option<SocketAddr> {
        *lock(&self.udp_endpoint)
    }

    /// Whether the peer can be reached over UDP.
    #[inline]
    pub fn is_udp_ready(&self) -> bool {
        self.udp_ready.load(Ordering::Acquire)
    }

    pub(crate) fn connection(&self) -> &TcpConnection {
        &self.connection
    }

    /// Encode a frame through the peer's send buffer.
    pub(crate) fn encode(&self, kind: FrameKind, payload: &[u8]) -> Result<Bytes> {
        let mut buffer = lock(&self.send_buffer);
        buffer.encode(kind, payload)?;
        Ok(Bytes::copy_from_slice(buffer.encoded()))
    }

    /// Encode and queue a frame on the TCP connection.
    pub(crate) fn send_tcp(&self, kind: FrameKind, payload: &[u8]) -> Result<()> {
        let frame = self.encode(kind, payload)?;
        self.connection.send(frame)
    }

    /// Feed a TCP chunk, appending every frame it completes to `frames`.
    ///
    /// Frames completed before a framing error are kept.
    pub(crate) fn receive_tcp(&self, chunk: &[u8], frames: &mut Vec<Frame>) -> Result<()> {
        lock(&self.tcp_receive).push_into(chunk, frames)
    }

    /// Feed a datagram, appending every frame it completes to `frames`.
    ///
    /// On error the UDP accumulator has already been reset.
    pub(crate) fn receive_udp(&self, chunk: &[u8], frames: &mut Vec<Frame>) -> Result<()> {
        lock(&self.udp_receive).push_into(chunk, frames)
    }

    pub(crate) fn set_udp_endpoint(&self, endpoint: SocketAddr) {
        *lock(&self.udp_endpoint) = Some(endpoint);
        self.udp_ready.store(true, Ordering::Release);
    }

    pub(crate) fn clear_udp_endpoint(&self) {
        self.udp_ready.store(false, Ordering::Release);
        *lock(&self.udp_endpoint) = None;
    }

    /// Install the keepalive timer, cancelling any previous one.
    pub(crate) fn set_keepalive(&self, handle: KeepaliveHandle) {
        let previous = lock(&self.keepalive).replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    pub(crate) fn stop_keepalive(&self) {
        let handle = lock(&self.keepalive).take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Close the TCP connection; teardown follows from its read loop.
    pub(crate) fn close(&self) {
        self.connection.close();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("tcp", &self.tcp_remote_addr())
            .field("udp", &self.udp_remote_addr())
            .field("udp_ready", &self.is_udp_ready())
            .finish()
    }
}
