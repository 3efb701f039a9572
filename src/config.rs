//! Transport configuration.
//!
//! [`TransportConfig`] is shared by the client and server facades. The
//! builders expose a fluent setter for every field, so most callers never
//! construct it directly.

use std::time::Duration;

use crate::protocol::DEFAULT_PACKET_SIZE;

/// Default interval between keepalive pings sent by the server.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pending-connection backlog of the TCP listener.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 100;

/// Configuration for sockets, framing and keepalive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Fixed frame buffer size in bytes, header included. Also the size of
    /// every socket read buffer.
    pub packet_size: usize,
    /// Interval between server keepalive pings. `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// TCP connect timeout. `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Backlog passed to `listen`.
    pub listen_backlog: u32,
    /// Set `TCP_NODELAY` on every TCP connection.
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            nodelay: true,
        }
    }
}
