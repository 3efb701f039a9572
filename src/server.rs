//! Server facade: TCP listener, shared UDP socket and peer registry.
//!
//! The [`ServerBuilder`] registers callbacks and configuration; [`Server`]
//! runs the lifecycle:
//! 1. Bind the TCP listener
//! 2. Bind the UDP socket on the same resolved address
//! 3. Create a [`Peer`] per accepted connection
//! 4. Complete the rendezvous when the peer announces its UDP endpoint,
//!    then raise `PeerConnected` and start its keepalive
//!
//! # Example
//!
//! ```ignore
//! use hybrid_transport::{Delivery, Server};
//!
//! #[tokio::main]
//! async fn main() -> hybrid_transport::Result<()> {
//!     let server = Server::builder()
//!         .on_peer_connected(|peer| println!("peer {} connected", peer.id()))
//!         .on_message(|peer, payload, delivery| {
//!             println!("{} bytes from {} over {:?}", payload.len(), peer.id(), delivery);
//!         })
//!         .start("0.0.0.0:27015".parse().unwrap())
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::config::TransportConfig;
use crate::dispatch::{EventDelivery, EventSink};
use crate::error::{Result, TransportError};
use crate::keepalive;
use crate::peer::{Peer, PeerId, PeerRegistry};
use crate::protocol::{Frame, FrameKind, UdpInformation};
use crate::transport::{
    ConnectionId, Delivery, TcpConnection, TcpListenerChannel, TcpListenerEvents, UdpChannel,
    UdpEvents,
};

type PeerCallback = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Arc<Peer>, Bytes, Delivery) + Send + Sync>;

#[derive(Clone, Default)]
struct ServerCallbacks {
    peer_connected: Option<PeerCallback>,
    peer_disconnected: Option<PeerCallback>,
    message: Option<MessageCallback>,
}

/// Builder for configuring and starting a [`Server`].
pub struct ServerBuilder {
    config: TransportConfig,
    delivery: EventDelivery,
    callbacks: ServerCallbacks,
}

impl ServerBuilder {
    /// Create a builder with default configuration and inline events.
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            delivery: EventDelivery::Inline,
            callbacks: ServerCallbacks::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the frame buffer size (header included).
    ///
    /// Default: 1024
    pub fn packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = size;
        self
    }

    /// Set the keepalive ping interval; `None` disables pings.
    ///
    /// Default: 1 second
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the TCP listen backlog.
    ///
    /// Default: 100
    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.config.listen_backlog = backlog;
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted connections.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.config.nodelay = nodelay;
        self
    }

    /// Choose where callbacks run.
    pub fn event_delivery(mut self, delivery: EventDelivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Called once a peer completed the rendezvous.
    pub fn on_peer_connected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Peer>) + Send + Sync + 'static,
    {
        self.callbacks.peer_connected = Some(Arc::new(callback));
        self
    }

    /// Called once a connected peer's TCP connection ended.
    pub fn on_peer_disconnected<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Peer>) + Send + Sync + 'static,
    {
        self.callbacks.peer_disconnected = Some(Arc::new(callback));
        self
    }

    /// Called for every application frame from a peer.
    pub fn on_message<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Arc<Peer>, Bytes, Delivery) + Send + Sync + 'static,
    {
        self.callbacks.message = Some(Arc::new(callback));
        self
    }

    /// Bind `bind` for TCP and UDP and start serving.
    ///
    /// Port 0 picks an ephemeral TCP port; UDP binds the same port.
    pub async fn start(self, bind: SocketAddr) -> Result<Server> {
        Server::start(self, bind).await
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the facade and the socket loops.
struct ServerShared {
    config: TransportConfig,
    registry: PeerRegistry,
    udp: UdpChannel,
    events: EventSink,
    callbacks: ServerCallbacks,
}

impl ServerShared {
    fn new(config: TransportConfig, delivery: &EventDelivery, callbacks: ServerCallbacks) -> Self {
        Self {
            config,
            registry: PeerRegistry::new(),
            udp: UdpChannel::new(),
            events: EventSink::new(delivery),
            callbacks,
        }
    }

    fn handle_tcp_frame(&self, peer: &Arc<Peer>, frame: Frame) {
        match frame.kind {
            FrameKind::UdpInformation => self.complete_rendezvous(peer, &frame.payload),
            FrameKind::Ping => tracing::trace!("Ping from peer {}", peer.id()),
            _ => self.emit_message(peer, frame.payload, Delivery::Tcp),
        }
    }

    fn complete_rendezvous(&self, peer: &Arc<Peer>, payload: &[u8]) {
        let info = match UdpInformation::decode(payload) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("Ignoring UdpInformation from peer {}: {}", peer.id(), e);
                return;
            }
        };

        let endpoint = info.resolve(peer.tcp_remote_addr());
        match self.registry.bind_udp(peer.id(), endpoint) {
            Ok(true) => {
                tracing::info!("Peer {} bound UDP endpoint {}", peer.id(), endpoint);
                self.start_keepalive(peer);
                self.emit_peer(peer, self.callbacks.peer_connected.as_ref());
            }
            Ok(false) => {
                tracing::debug!("Peer {} re-announced UDP endpoint {}", peer.id(), endpoint)
            }
            Err(e) => tracing::warn!("Rejecting UDP endpoint of peer {}: {}", peer.id(), e),
        }
    }

    fn start_keepalive(&self, peer: &Arc<Peer>) {
        let Some(interval) = self.config.keepalive_interval else {
            return;
        };

        let weak = Arc::downgrade(peer);
        let handle = keepalive::spawn(interval, move || match weak.upgrade() {
            Some(peer) => match peer.send_tcp(FrameKind::Ping, &[]) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Keepalive for peer {} stopped: {}", peer.id(), e);
                    false
                }
            },
            None => false,
        });
        peer.set_keepalive(handle);
    }

    fn emit_peer(&self, peer: &Arc<Peer>, callback: Option<&PeerCallback>) {
        if let Some(callback) = callback {
            let callback = callback.clone();
            let peer = peer.clone();
            self.events.emit(move || callback(&peer));
        }
    }

    fn emit_message(&self, peer: &Arc<Peer>, payload: Bytes, delivery: Delivery) {
        if let Some(callback) = &self.callbacks.message {
            let callback = callback.clone();
            let peer = peer.clone();
            self.events.emit(move || callback(&peer, payload, delivery));
        }
    }

    fn send_frame(
        &self,
        peer: &Peer,
        kind: FrameKind,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<()> {
        let frame = peer.encode(kind, payload)?;
        match delivery {
            Delivery::Tcp => peer.connection().send(frame),
            Delivery::Udp => match peer.udp_remote_addr().filter(|_| peer.is_udp_ready()) {
                Some(endpoint) => self.udp.send_to(endpoint, frame),
                None => {
                    tracing::trace!("Peer {} is not UDP-ready, dropping datagram", peer.id());
                    Ok(())
                }
            },
        }
    }
}

impl TcpListenerEvents for ServerShared {
    fn on_connected(&self, connection: TcpConnection) {
        let peer = Arc::new(Peer::new(connection, self.config.packet_size));
        tracing::debug!(
            "Peer {} accepted from {}, awaiting UDP endpoint",
            peer.id(),
            peer.tcp_remote_addr()
        );
        self.registry.insert(peer);
        tracing::trace!("{} peers registered", self.registry.len());
    }

    fn on_message(&self, connection: ConnectionId, chunk: &[u8]) {
        let Some(peer) = self.registry.get(connection) else {
            tracing::trace!("Data for unknown connection {}", connection);
            return;
        };

        let mut frames = Vec::new();
        let result = peer.receive_tcp(chunk, &mut frames);

        for frame in frames {
            self.handle_tcp_frame(&peer, frame);
        }

        if let Err(e) = result {
            tracing::warn!("Peer {} sent a malformed frame, disconnecting: {}", peer.id(), e);
            peer.close();
        }
    }

    fn on_disconnected(&self, connection: ConnectionId) {
        let was_connected = self
            .registry
            .get(connection)
            .is_some_and(|peer| peer.is_udp_ready());

        let Some(peer) = self.registry.remove(connection) else {
            return;
        };
        peer.stop_keepalive();
        tracing::info!("Peer {} disconnected", peer.id());

        if was_connected {
            self.emit_peer(&peer, self.callbacks.peer_disconnected.as_ref());
        }
    }
}

impl UdpEvents for ServerShared {
    fn on_datagram(&self, from: SocketAddr, chunk: &[u8]) {
        let Some(peer) = self.registry.get_by_udp(from) else {
            tracing::trace!("Dropping datagram from unknown endpoint {}", from);
            return;
        };

        let mut frames = Vec::new();
        if let Err(e) = peer.receive_udp(chunk, &mut frames) {
            tracing::debug!("Malformed datagram from peer {}: {}", peer.id(), e);
        }

        for frame in frames {
            if frame.kind.is_control() {
                tracing::trace!("Ignoring {:?} over UDP from peer {}", frame.kind, peer.id());
                continue;
            }
            self.emit_message(&peer, frame.payload, Delivery::Udp);
        }
    }
}

/// A running server.
///
/// Dropping the server shuts it down.
pub struct Server {
    shared: Arc<ServerShared>,
    listener: TcpListenerChannel,
    local_addr: SocketAddr,
    udp_local_addr: SocketAddr,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    async fn start(builder: ServerBuilder, bind: SocketAddr) -> Result<Self> {
        let ServerBuilder {
            config,
            delivery,
            callbacks,
        } = builder;

        let shared = Arc::new(ServerShared::new(config.clone(), &delivery, callbacks));

        // 1. TCP listener
        let listener = TcpListenerChannel::new(config.clone());
        let local_addr = listener.start(bind, shared.clone()).await?;

        // 2. UDP on the address TCP resolved to
        let udp_local_addr = match shared
            .udp
            .start_server(local_addr, shared.clone(), config.packet_size)
            .await
        {
            Ok(addr) => addr,
            Err(e) => {
                listener.close();
                return Err(e);
            }
        };

        tracing::info!("Server started on {} (udp {})", local_addr, udp_local_addr);
        Ok(Self {
            shared,
            listener,
            local_addr,
            udp_local_addr,
        })
    }

    /// Bound TCP address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound UDP address.
    #[inline]
    pub fn udp_local_addr(&self) -> SocketAddr {
        self.udp_local_addr
    }

    /// Send an application payload to one peer.
    ///
    /// UDP sends to a peer that has not completed the rendezvous are
    /// dropped silently.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` if the frame does not fit the packet size,
    /// `Disconnected` if the peer's connection is gone.
    pub fn send(&self, peer: &Peer, payload: &[u8], delivery: Delivery) -> Result<()> {
        self.shared
            .send_frame(peer, FrameKind::Application, payload, delivery)
    }

    /// Send a payload with a custom frame kind.
    ///
    /// # Errors
    ///
    /// `Usage` for the transport's own control kinds, otherwise as
    /// [`send`](Self::send).
    pub fn send_kind(
        &self,
        peer: &Peer,
        kind: FrameKind,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<()> {
        if kind.is_control() {
            return Err(TransportError::Usage(format!(
                "{:?} frames are reserved for the transport",
                kind
            )));
        }
        self.shared.send_frame(peer, kind, payload, delivery)
    }

    /// MessagePack-encode `value` and send it as an application payload.
    pub fn send_encoded<T: Serialize>(
        &self,
        peer: &Peer,
        value: &T,
        delivery: Delivery,
    ) -> Result<()> {
        let payload = MsgPackCodec::encode(value)?;
        self.send(peer, &payload, delivery)
    }

    /// Send to every connected peer. Returns how many sends were queued.
    ///
    /// Per-peer failures are logged and skipped.
    pub fn send_all(&self, payload: &[u8], delivery: Delivery) -> usize {
        let mut sent = 0;
        for peer in self.peers() {
            match self.send(&peer, payload, delivery) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Broadcast to peer {} failed: {}", peer.id(), e),
            }
        }
        sent
    }

    /// Close a peer's TCP connection. `PeerDisconnected` follows.
    pub fn disconnect(&self, peer: &Peer) {
        peer.close();
    }

    /// Peers that completed the rendezvous.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.shared
            .registry
            .peers()
            .into_iter()
            .filter(|peer| peer.is_udp_ready())
            .collect()
    }

    /// Look up a connected peer.
    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.shared
            .registry
            .get(id)
            .filter(|peer| peer.is_udp_ready())
    }

    /// Number of peers that completed the rendezvous.
    pub fn peer_count(&self) -> usize {
        self.peers().len()
    }

    /// Run queued events on the calling thread.
    ///
    /// Only does work with `EventDelivery::Queued`. Returns the number of
    /// events run.
    pub fn drain_events(&self) -> usize {
        self.shared.events.drain()
    }

    /// Stop accepting, close every connection and the UDP socket.
    pub fn shutdown(&self) {
        for peer in self.shared.registry.peers() {
            peer.stop_keepalive();
        }
        self.listener.close();
        self.shared.udp.close();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
