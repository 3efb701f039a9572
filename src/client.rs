//! Client facade: one TCP connection plus a connected UDP socket.
//!
//! The [`ClientBuilder`] registers callbacks and configuration. On
//! [`Client::connect`]:
//! 1. Connect TCP
//! 2. Open a UDP socket connected to the server's address
//! 3. Announce the UDP endpoint over TCP (`UdpInformation`)
//! 4. Raise `Connected`, then start reading
//!
//! # Example
//!
//! ```ignore
//! use hybrid_transport::{Client, Delivery};
//!
//! let client = Client::builder()
//!     .on_connected(|| println!("connected"))
//!     .on_message(|payload, delivery| println!("{:?}: {:?}", delivery, payload))
//!     .build();
//!
//! client.connect("127.0.0.1:27015".parse()?)?;
//! client.send(b"hello", Delivery::Udp)?;
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::config::TransportConfig;
use crate::dispatch::{EventDelivery, EventSink};
use crate::error::{Result, TransportError};
use crate::protocol::{Frame, FrameBuffer, FrameKind, UdpInformation};
use crate::sync::lock;
use crate::transport::{
    BoxFuture, ChannelState, Delivery, TcpClientChannel, TcpClientEvents, TcpConnection,
    UdpChannel, UdpEvents,
};

type NotifyCallback = Arc<dyn Fn() + Send + Sync>;
type FailedCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(Bytes, Delivery) + Send + Sync>;

#[derive(Clone, Default)]
struct ClientCallbacks {
    connected: Option<NotifyCallback>,
    connection_failed: Option<FailedCallback>,
    disconnected: Option<NotifyCallback>,
    message: Option<MessageCallback>,
}

/// Builder for configuring a [`Client`].
pub struct ClientBuilder {
    config: TransportConfig,
    delivery: EventDelivery,
    callbacks: ClientCallbacks,
}

impl ClientBuilder {
    /// Create a builder with default configuration and inline events.
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            delivery: EventDelivery::Inline,
            callbacks: ClientCallbacks::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the frame buffer size (header included). Must match the server.
    ///
    /// Default: 1024
    pub fn packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = size;
        self
    }

    /// Set the TCP connect timeout; `None` waits for the OS.
    ///
    /// Default: 10 seconds
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Choose where callbacks run.
    pub fn event_delivery(mut self, delivery: EventDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Called once the connection is up and the UDP endpoint announced.
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.connected = Some(Arc::new(callback));
        self
    }

    /// Called when a connect attempt fails. Connecting again is allowed.
    pub fn on_connection_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.callbacks.connection_failed = Some(Arc::new(callback));
        self
    }

    /// Called once an established connection ended.
    pub fn on_disconnected<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks.disconnected = Some(Arc::new(callback));
        self
    }

    /// Called for every application frame from the server.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(Bytes, Delivery) + Send + Sync + 'static,
    {
        self.callbacks.message = Some(Arc::new(callback));
        self
    }

    /// Build a disconnected client.
    pub fn build(self) -> Client {
        let packet_size = self.config.packet_size;
        Client {
            shared: Arc::new(ClientShared {
                tcp: TcpClientChannel::new(self.config.clone()),
                udp: UdpChannel::new(),
                send_buffer: Mutex::new(FrameBuffer::with_capacity(packet_size)),
                tcp_receive: Mutex::new(FrameBuffer::with_capacity(packet_size)),
                udp_receive: Mutex::new(FrameBuffer::with_capacity(packet_size)),
                events: EventSink::new(&self.delivery),
                callbacks: self.callbacks,
                config: self.config,
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientShared {
    config: TransportConfig,
    tcp: TcpClientChannel,
    udp: UdpChannel,
    send_buffer: Mutex<FrameBuffer>,
    tcp_receive: Mutex<FrameBuffer>,
    udp_receive: Mutex<FrameBuffer>,
    events: EventSink,
    callbacks: ClientCallbacks,
}

impl ClientShared {
    fn encode(&self, kind: FrameKind, payload: &[u8]) -> Result<Bytes> {
        let mut buffer = lock(&self.send_buffer);
        buffer.encode(kind, payload)?;
        Ok(Bytes::copy_from_slice(buffer.encoded()))
    }

    fn send_frame(&self, kind: FrameKind, payload: &[u8], delivery: Delivery) -> Result<()> {
        if self.tcp.state() != ChannelState::Connected {
            tracing::warn!("Cannot send: not connected");
            return Err(TransportError::NotConnected);
        }

        let frame = self.encode(kind, payload)?;
        match delivery {
            Delivery::Tcp => self.tcp.send(frame),
            Delivery::Udp => self.udp.send(frame),
        }
    }

    fn announce_udp(&self, local: SocketAddr) {
        let info = match UdpInformation::from_socket_addr(local) {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Cannot announce UDP endpoint: {}", e);
                return;
            }
        };

        match self.send_frame(FrameKind::UdpInformation, &info.encode(), Delivery::Tcp) {
            Ok(()) => tracing::debug!("Announced UDP endpoint {}", local),
            Err(e) => tracing::warn!("Failed to announce UDP endpoint {}: {}", local, e),
        }
    }

    fn handle_frame(&self, frame: Frame, delivery: Delivery) {
        match frame.kind {
            FrameKind::Ping => tracing::trace!("Ping over {:?}", delivery),
            FrameKind::UdpInformation => {
                tracing::debug!("Ignoring UdpInformation from server")
            }
            _ => self.emit_message(frame.payload, delivery),
        }
    }

    fn emit_notify(&self, callback: Option<&NotifyCallback>) {
        if let Some(callback) = callback {
            let callback = callback.clone();
            self.events.emit(move || callback());
        }
    }

    fn emit_message(&self, payload: Bytes, delivery: Delivery) {
        if let Some(callback) = &self.callbacks.message {
            let callback = callback.clone();
            self.events.emit(move || callback(payload, delivery));
        }
    }

    fn reset_receive_buffers(&self) {
        lock(&self.tcp_receive).reset();
        lock(&self.udp_receive).reset();
    }
}

impl TcpClientEvents for ClientShared {
    fn on_connected(self: Arc<Self>, connection: TcpConnection) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let remote = connection.remote_addr();
            let udp = self
                .udp
                .start_client(remote, self.clone(), self.config.packet_size)
                .await;

            match udp {
                Ok(local) => self.announce_udp(local),
                Err(e) => tracing::error!("Failed to open UDP socket to {}: {}", remote, e),
            }

            self.emit_notify(self.callbacks.connected.as_ref());
        })
    }

    fn on_connection_failed(&self, error: TransportError) {
        if let Some(callback) = &self.callbacks.connection_failed {
            let callback = callback.clone();
            self.events.emit(move || callback(&error));
        }
    }

    fn on_message(&self, chunk: &[u8]) {
        let mut frames = Vec::new();
        let result = lock(&self.tcp_receive).push_into(chunk, &mut frames);

        for frame in frames {
            self.handle_frame(frame, Delivery::Tcp);
        }

        if let Err(e) = result {
            tracing::warn!("Server sent a malformed frame, disconnecting: {}", e);
            self.tcp.disconnect();
        }
    }

    fn on_closing(&self) {
        self.udp.close();
        self.reset_receive_buffers();
    }

    fn on_disconnected(&self) {
        self.emit_notify(self.callbacks.disconnected.as_ref());
    }
}

impl UdpEvents for ClientShared {
    fn on_datagram(&self, _from: SocketAddr, chunk: &[u8]) {
        let mut frames = Vec::new();
        let result = lock(&self.udp_receive).push_into(chunk, &mut frames);
        if let Err(e) = result {
            tracing::debug!("Malformed datagram: {}", e);
        }

        for frame in frames {
            self.handle_frame(frame, Delivery::Udp);
        }
    }
}

/// A client connection to a server.
///
/// Dropping the client disconnects it.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start connecting to `remote`.
    ///
    /// Returns once the attempt is under way; the outcome is reported
    /// through `on_connected` or `on_connection_failed`. Must be called from
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Usage` if already connected or connecting.
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.shared.tcp.connect(remote, self.shared.clone())
    }

    /// Close the connection. `on_disconnected` follows if it was up.
    pub fn disconnect(&self) {
        self.shared.tcp.disconnect();
    }

    /// Send an application payload.
    ///
    /// UDP sends before the UDP socket is open are dropped silently.
    ///
    /// # Errors
    ///
    /// `NotConnected` without an established connection, `PayloadTooLarge`
    /// if the frame does not fit the packet size.
    pub fn send(&self, payload: &[u8], delivery: Delivery) -> Result<()> {
        self.shared
            .send_frame(FrameKind::Application, payload, delivery)
    }

    /// Send a payload with a custom frame kind.
    ///
    /// # Errors
    ///
    /// `Usage` for the transport's own control kinds, otherwise as
    /// [`send`](Self::send).
    pub fn send_kind(&self, kind: FrameKind, payload: &[u8], delivery: Delivery) -> Result<()> {
        if kind.is_control() {
            return Err(TransportError::Usage(format!(
                "{:?} frames are reserved for the transport",
                kind
            )));
        }
        self.shared.send_frame(kind, payload, delivery)
    }

    /// MessagePack-encode `value` and send it as an application payload.
    pub fn send_encoded<T: Serialize>(&self, value: &T, delivery: Delivery) -> Result<()> {
        let payload = MsgPackCodec::encode(value)?;
        self.send(&payload, delivery)
    }

    /// TCP connection state.
    pub fn state(&self) -> ChannelState {
        self.shared.tcp.state()
    }

    /// Whether the TCP connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Local TCP endpoint while connected.
    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.shared.tcp.connection().map(|c| c.local_addr())
    }

    /// Server TCP endpoint while connected.
    pub fn remote_tcp_addr(&self) -> Option<SocketAddr> {
        self.shared.tcp.connection().map(|c| c.remote_addr())
    }

    /// Local UDP endpoint while open.
    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.shared.udp.local_addr()
    }

    /// Run queued events on the calling thread.
    ///
    /// Only does work with `EventDelivery::Queued`. Returns the number of
    /// events run.
    pub fn drain_events(&self) -> usize {
        self.shared.events.drain()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.tcp.disconnect();
    }
}
