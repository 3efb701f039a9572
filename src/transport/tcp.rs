//! TCP listener and client channels.
//!
//! Both sides run one read loop task per connection and one writer task per
//! connection (see [`crate::writer`]). A connection is closed by notifying
//! its close signal; the read loop then exits, aborts the writer and raises
//! `Disconnected` exactly once. EOF and read faults take the same path.
//!
//! # Example
//!
//! ```ignore
//! use hybrid_transport::transport::TcpListenerChannel;
//!
//! let listener = TcpListenerChannel::new(TransportConfig::default());
//! let local = listener.start("127.0.0.1:0".parse()?, events).await?;
//! listener.send(connection_id, frame)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::BoxFuture;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::sync::lock;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Pause after a failed accept before re-arming.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a client-side TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Connection established.
    Connected,
}

/// Lifecycle of a TCP listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not yet started.
    Unbound,
    /// Accept loop running.
    Listening,
    /// Stopped; cannot be restarted.
    Closed,
}

/// Why a read loop ended.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Closed locally through [`TcpConnection::close`] or a write fault.
    Closed,
    /// Remote side closed the stream (0-byte read).
    RemoteClosed,
    /// Read error.
    Fault(io::Error),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed locally"),
            DisconnectReason::RemoteClosed => write!(f, "closed by remote"),
            DisconnectReason::Fault(e) => write!(f, "read error: {}", e),
        }
    }
}

/// Handle to one established TCP connection.
///
/// Cheaply cloneable. Sending and closing are non-blocking.
#[derive(Clone, Debug)]
pub struct TcpConnection {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    writer: WriterHandle,
    close: Arc<Notify>,
}

impl TcpConnection {
    /// Split a fresh stream into a connection handle, its read half and the
    /// writer task.
    fn establish(
        stream: TcpStream,
        nodelay: bool,
    ) -> io::Result<(Self, OwnedReadHalf, JoinHandle<()>)> {
        if nodelay {
            stream.set_nodelay(true)?;
        }
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (reader, write_half) = stream.into_split();

        let close = Arc::new(Notify::new());
        let (writer, writer_task) = spawn_writer_task(write_half, close.clone());

        let connection = Self {
            id: ConnectionId::next(),
            local_addr,
            remote_addr,
            writer,
            close,
        };
        Ok((connection, reader, writer_task))
    }

    /// Connection identifier.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local socket address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue an encoded frame (fire-and-forget).
    ///
    /// Write faults are logged by the writer task and close the connection;
    /// they are not reported here. Returns `Disconnected` if the connection
    /// is already torn down.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.writer.send(frame).map_err(|e| {
            tracing::debug!("Send on closed connection {}", self.id);
            e
        })
    }

    /// Close the connection abruptly. Its read loop raises `Disconnected`.
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Whether the connection has been torn down.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Frames queued on the writer task but not yet written.
    #[inline]
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// Connection whose writes land in the returned in-memory stream.
    #[cfg(test)]
    pub(crate) fn test_pair(remote_addr: SocketAddr) -> (Self, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let close = Arc::new(Notify::new());
        let (writer, _task) = spawn_writer_task(near, close.clone());
        let connection = Self {
            id: ConnectionId::next(),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            remote_addr,
            writer,
            close,
        };
        (connection, far)
    }
}

/// Read until EOF, a fault, or a local close.
///
/// Every non-empty read is handed to `on_chunk` in arrival order.
async fn read_loop<R, F>(
    mut reader: R,
    close: &Notify,
    buffer_size: usize,
    mut on_chunk: F,
) -> DisconnectReason
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            _ = close.notified() => return DisconnectReason::Closed,
            result = reader.read(&mut buf) => match result {
                Ok(0) => return DisconnectReason::RemoteClosed,
                Ok(n) => on_chunk(&buf[..n]),
                Err(e) => return DisconnectReason::Fault(e),
            },
        }
    }
}

fn log_disconnect(id: ConnectionId, remote: SocketAddr, reason: &DisconnectReason) {
    match reason {
        DisconnectReason::Fault(_) => {
            tracing::warn!("Connection {} ({}) disconnected: {}", id, remote, reason)
        }
        _ => tracing::info!("Connection {} ({}) disconnected: {}", id, remote, reason),
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Events raised by a [`TcpListenerChannel`].
///
/// Called from I/O tasks; implementations must not block.
pub trait TcpListenerEvents: Send + Sync + 'static {
    /// A connection was accepted. Raised before its read loop starts.
    fn on_connected(&self, connection: TcpConnection);

    /// Raw bytes arrived on a connection.
    fn on_message(&self, connection: ConnectionId, chunk: &[u8]);

    /// A connection ended. Raised exactly once per accepted connection.
    fn on_disconnected(&self, connection: ConnectionId);
}

struct ListenerShared {
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Mutex<HashMap<ConnectionId, TcpConnection>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// TCP listener with a perpetual accept loop.
pub struct TcpListenerChannel {
    shared: Arc<ListenerShared>,
    config: TransportConfig,
}

impl TcpListenerChannel {
    /// Create an unbound listener.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(ListenerShared {
                state: Mutex::new(ListenerState::Unbound),
                local_addr: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
            }),
            config,
        }
    }

    /// Bind, listen, and start accepting connections.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(
        &self,
        bind: SocketAddr,
        events: Arc<dyn TcpListenerEvents>,
    ) -> Result<SocketAddr> {
        let state = *lock(&self.shared.state);
        if state != ListenerState::Unbound {
            return Err(TransportError::Usage(format!(
                "TCP listener cannot start while {:?}",
                state
            )));
        }

        tracing::info!("Start listening on {}", bind);
        let socket = if bind.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind)?;
        let listener = socket.listen(self.config.listen_backlog)?;
        let local_addr = listener.local_addr()?;

        *lock(&self.shared.state) = ListenerState::Listening;
        *lock(&self.shared.local_addr) = Some(local_addr);

        let task = tokio::spawn(accept_loop(
            listener,
            self.shared.clone(),
            events,
            self.config.clone(),
        ));
        *lock(&self.shared.accept_task) = Some(task);

        tracing::info!("Started listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Queue an encoded frame on one connection (fire-and-forget).
    pub fn send(&self, connection: ConnectionId, frame: Bytes) -> Result<()> {
        let target = lock(&self.shared.connections).get(&connection).cloned();
        match target {
            Some(conn) => conn.send(frame),
            None => {
                tracing::info!("Cannot find connection {} to send data", connection);
                Err(TransportError::Disconnected)
            }
        }
    }

    /// Close one connection abruptly. Returns `false` if it is unknown.
    pub fn disconnect(&self, connection: ConnectionId) -> bool {
        match lock(&self.shared.connections).get(&connection) {
            Some(conn) => {
                conn.close();
                true
            }
            None => {
                tracing::info!("Cannot find connection {} to disconnect", connection);
                false
            }
        }
    }

    /// Close every live connection.
    pub fn disconnect_all(&self) {
        for conn in lock(&self.shared.connections).values() {
            conn.close();
        }
    }

    /// Stop accepting and close every connection.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.shared.state), ListenerState::Closed);
        if let Some(task) = lock(&self.shared.accept_task).take() {
            task.abort();
        }
        self.disconnect_all();
        if previous == ListenerState::Listening {
            tracing::info!("Listener closed");
        }
    }

    /// Current listener state.
    pub fn state(&self) -> ListenerState {
        *lock(&self.shared.state)
    }

    /// Bound address once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }
}

impl Drop for TcpListenerChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ListenerShared>,
    events: Arc<dyn TcpListenerEvents>,
    config: TransportConfig,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };

        let (connection, reader, writer_task) = match TcpConnection::establish(stream, config.nodelay)
        {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("Dropping accepted connection from {}: {}", remote, e);
                continue;
            }
        };

        tracing::info!("Accepted connection {} from {}", connection.id(), remote);
        lock(&shared.connections).insert(connection.id(), connection.clone());
        events.on_connected(connection.clone());

        tokio::spawn(serve_connection(
            connection,
            reader,
            writer_task,
            config.packet_size,
            events.clone(),
            shared.clone(),
        ));
    }
}

async fn serve_connection(
    connection: TcpConnection,
    reader: OwnedReadHalf,
    writer_task: JoinHandle<()>,
    buffer_size: usize,
    events: Arc<dyn TcpListenerEvents>,
    shared: Arc<ListenerShared>,
) {
    let id = connection.id();
    let reason = read_loop(reader, &connection.close, buffer_size, |chunk| {
        events.on_message(id, chunk)
    })
    .await;

    writer_task.abort();
    lock(&shared.connections).remove(&id);
    log_disconnect(id, connection.remote_addr(), &reason);
    events.on_disconnected(id);
}

// ============================================================================
// Client
// ============================================================================

/// Events raised by a [`TcpClientChannel`].
pub trait TcpClientEvents: Send + Sync + 'static {
    /// Connection established. The read loop starts once the returned
    /// future completes, so setup done here happens before any
    /// `on_message`.
    fn on_connected(self: Arc<Self>, connection: TcpConnection) -> BoxFuture<'static, ()>;

    /// Connect attempt failed. The channel is back to `Disconnected`.
    fn on_connection_failed(&self, error: TransportError);

    /// Raw bytes arrived.
    fn on_message(&self, chunk: &[u8]);

    /// Established connection is ending. Runs while the channel still
    /// reports `Connected`, so nothing set up here races a reconnect.
    fn on_closing(&self) {}

    /// Established connection ended. The channel is back to `Disconnected`.
    fn on_disconnected(&self);
}

struct ClientSlot {
    state: ChannelState,
    connection: Option<TcpConnection>,
    attempt: u64,
}

/// Client side TCP channel.
pub struct TcpClientChannel {
    slot: Arc<Mutex<ClientSlot>>,
    config: TransportConfig,
}

impl TcpClientChannel {
    /// Create a disconnected channel.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            slot: Arc::new(Mutex::new(ClientSlot {
                state: ChannelState::Disconnected,
                connection: None,
                attempt: 0,
            })),
            config,
        }
    }

    /// Start connecting to `remote`.
    ///
    /// Returns immediately; the outcome arrives as `on_connected` or
    /// `on_connection_failed`. Must be called from within a tokio runtime.
    pub fn connect(&self, remote: SocketAddr, events: Arc<dyn TcpClientEvents>) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| {
            TransportError::Usage("connect must be called from within a tokio runtime".to_string())
        })?;

        let attempt = {
            let mut slot = lock(&self.slot);
            if slot.state != ChannelState::Disconnected {
                return Err(TransportError::Usage(format!(
                    "connect called while {:?}",
                    slot.state
                )));
            }
            slot.state = ChannelState::Connecting;
            slot.attempt += 1;
            slot.attempt
        };

        tracing::info!("Connecting to {}", remote);
        runtime.spawn(run_client(
            remote,
            attempt,
            self.slot.clone(),
            events,
            self.config.clone(),
        ));
        Ok(())
    }

    /// Close the connection, or abandon an attempt in flight.
    pub fn disconnect(&self) {
        let mut slot = lock(&self.slot);
        let state = slot.state;
        match state {
            ChannelState::Connected => {
                if let Some(conn) = &slot.connection {
                    conn.close();
                }
            }
            ChannelState::Connecting => slot.state = ChannelState::Disconnected,
            ChannelState::Disconnected => {}
        }
    }

    /// Queue an encoded frame (fire-and-forget).
    pub fn send(&self, frame: Bytes) -> Result<()> {
        let connection = lock(&self.slot).connection.clone();
        match connection {
            Some(conn) => conn.send(frame),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        lock(&self.slot).state
    }

    /// Established connection, if any.
    pub fn connection(&self) -> Option<TcpConnection> {
        lock(&self.slot).connection.clone()
    }
}

impl Drop for TcpClientChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn connect_stream(remote: SocketAddr, limit: Option<Duration>) -> io::Result<TcpStream> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(remote)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", remote, limit),
            )),
        },
        None => TcpStream::connect(remote).await,
    }
}

async fn run_client(
    remote: SocketAddr,
    attempt: u64,
    slot: Arc<Mutex<ClientSlot>>,
    events: Arc<dyn TcpClientEvents>,
    config: TransportConfig,
) {
    let established = connect_stream(remote, config.connect_timeout)
        .await
        .and_then(|stream| TcpConnection::establish(stream, config.nodelay));

    let (connection, reader, writer_task) = match established {
        Ok(parts) => parts,
        Err(e) => {
            {
                let mut slot = lock(&slot);
                if slot.attempt != attempt {
                    return;
                }
                slot.state = ChannelState::Disconnected;
            }
            tracing::warn!("Connection to {} failed: {}", remote, e);
            events.on_connection_failed(TransportError::ConnectionFailed(e));
            return;
        }
    };

    {
        let mut slot = lock(&slot);
        if slot.attempt != attempt {
            drop(slot);
            writer_task.abort();
            tracing::debug!("Connect to {} superseded by a newer attempt", remote);
            return;
        }
        if slot.state != ChannelState::Connecting {
            drop(slot);
            writer_task.abort();
            tracing::info!("Connect to {} abandoned by disconnect", remote);
            events.on_connection_failed(TransportError::ConnectionFailed(io::Error::new(
                io::ErrorKind::Interrupted,
                "connect abandoned by disconnect",
            )));
            return;
        }
        slot.state = ChannelState::Connected;
        slot.connection = Some(connection.clone());
    }

    tracing::info!(
        "Connected {} to {} as connection {}",
        connection.local_addr(),
        remote,
        connection.id()
    );
    events.clone().on_connected(connection.clone()).await;

    let reason = read_loop(reader, &connection.close, config.packet_size, |chunk| {
        events.on_message(chunk)
    })
    .await;

    writer_task.abort();
    events.on_closing();
    {
        let mut slot = lock(&slot);
        slot.state = ChannelState::Disconnected;
        slot.connection = None;
    }
    log_disconnect(connection.id(), remote, &reason);
    events.on_disconnected();
}
