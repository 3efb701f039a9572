//! UDP datagram channel.
//!
//! One socket, one receive loop task. In client mode the socket is
//! connected to the server endpoint; in server mode it is bound to a local
//! endpoint and addresses each send explicitly. Sends never block: a
//! datagram the kernel will not take right now is dropped.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};
use crate::sync::lock;

/// Binding of a [`UdpChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpMode {
    /// No socket.
    Unbound,
    /// Connected to one remote endpoint.
    Client {
        /// Server endpoint.
        remote: SocketAddr,
    },
    /// Bound to a local endpoint, talking to many peers.
    Server {
        /// Bound endpoint.
        local: SocketAddr,
    },
}

/// Receiver of inbound datagrams.
pub trait UdpEvents: Send + Sync + 'static {
    /// A datagram arrived from `from`.
    fn on_datagram(&self, from: SocketAddr, chunk: &[u8]);
}

struct UdpInner {
    mode: UdpMode,
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
}

/// Datagram socket with its own receive loop.
pub struct UdpChannel {
    inner: Mutex<UdpInner>,
}

impl UdpChannel {
    /// Create an unbound channel.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UdpInner {
                mode: UdpMode::Unbound,
                socket: None,
                recv_task: None,
            }),
        }
    }

    /// Bind an ephemeral local port and connect it to `remote`.
    ///
    /// Returns the local endpoint to announce.
    pub async fn start_client(
        &self,
        remote: SocketAddr,
        events: Arc<dyn UdpEvents>,
        buffer_size: usize,
    ) -> Result<SocketAddr> {
        self.ensure_unbound()?;

        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        let local = socket.local_addr()?;

        self.install(UdpMode::Client { remote }, socket, events, buffer_size)?;
        tracing::debug!("UDP client {} connected to {}", local, remote);
        Ok(local)
    }

    /// Bind `bind` and receive from any endpoint.
    pub async fn start_server(
        &self,
        bind: SocketAddr,
        events: Arc<dyn UdpEvents>,
        buffer_size: usize,
    ) -> Result<SocketAddr> {
        self.ensure_unbound()?;

        let socket = UdpSocket::bind(bind).await?;
        let local = socket.local_addr()?;

        self.install(UdpMode::Server { local }, socket, events, buffer_size)?;
        tracing::info!("UDP listening on {}", local);
        Ok(local)
    }

    fn ensure_unbound(&self) -> Result<()> {
        let mode = lock(&self.inner).mode;
        if mode != UdpMode::Unbound {
            return Err(TransportError::Usage(format!(
                "UDP channel already bound: {:?}",
                mode
            )));
        }
        Ok(())
    }

    fn install(
        &self,
        mode: UdpMode,
        socket: UdpSocket,
        events: Arc<dyn UdpEvents>,
        buffer_size: usize,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.mode != UdpMode::Unbound {
            return Err(TransportError::Usage(format!(
                "UDP channel already bound: {:?}",
                inner.mode
            )));
        }

        let socket = Arc::new(socket);
        inner.recv_task = Some(tokio::spawn(receive_loop(
            socket.clone(),
            events,
            buffer_size,
        )));
        inner.socket = Some(socket);
        inner.mode = mode;
        Ok(())
    }

    /// Send to the connected remote (client mode).
    ///
    /// Silently drops the datagram while unbound.
    ///
    /// # Errors
    ///
    /// Returns `Usage` in server mode.
    pub fn send(&self, datagram: Bytes) -> Result<()> {
        let inner = lock(&self.inner);
        match (inner.mode, &inner.socket) {
            (UdpMode::Client { remote }, Some(socket)) => {
                log_send_result(socket.try_send(&datagram), remote);
                Ok(())
            }
            (UdpMode::Server { .. }, _) => Err(TransportError::Usage(
                "UDP channel is in server mode; use send_to".to_string(),
            )),
            _ => {
                tracing::trace!("UDP channel unbound, dropping {} bytes", datagram.len());
                Ok(())
            }
        }
    }

    /// Send to `target` (server mode).
    ///
    /// Silently drops the datagram while unbound.
    ///
    /// # Errors
    ///
    /// Returns `Usage` in client mode.
    pub fn send_to(&self, target: SocketAddr, datagram: Bytes) -> Result<()> {
        let inner = lock(&self.inner);
        match (inner.mode, &inner.socket) {
            (UdpMode::Server { .. }, Some(socket)) => {
                log_send_result(socket.try_send_to(&datagram, target), target);
                Ok(())
            }
            (UdpMode::Client { .. }, _) => Err(TransportError::Usage(
                "UDP channel is in client mode; use send".to_string(),
            )),
            _ => {
                tracing::trace!("UDP channel unbound, dropping {} bytes", datagram.len());
                Ok(())
            }
        }
    }

    /// Stop the receive loop and release the socket.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if let Some(task) = inner.recv_task.take() {
            task.abort();
        }
        inner.socket = None;
        inner.mode = UdpMode::Unbound;
    }

    /// Current binding.
    pub fn mode(&self) -> UdpMode {
        lock(&self.inner).mode
    }

    /// Local endpoint while bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner)
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }
}

impl Default for UdpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn log_send_result(result: io::Result<usize>, target: SocketAddr) {
    match result {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tracing::debug!("UDP send buffer full, dropping datagram to {}", target)
        }
        Err(e) => tracing::warn!("UDP send to {} failed: {}", target, e),
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, events: Arc<dyn UdpEvents>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => events.on_datagram(from, &buf[..n]),
            // ICMP port unreachable from an earlier send surfaces here.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                tracing::debug!("UDP receive: {}", e);
            }
            Err(e) => {
                tracing::warn!("UDP receive failed, stopping receive loop: {}", e);
                break;
            }
        }
    }
}
