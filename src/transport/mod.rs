//! Transport module - async TCP and UDP channels.
//!
//! Channels own the socket loops and nothing else: they report raw chunks
//! and lifecycle changes to an event sink trait implemented by the facades.
//! - [`TcpListenerChannel`]: accept loop plus one read loop per connection
//! - [`TcpClientChannel`]: connect plus one read loop
//! - [`UdpChannel`]: client or server mode datagram socket with its own
//!   receive loop

mod tcp;
mod udp;

use std::future::Future;
use std::pin::Pin;

pub use tcp::{
    ChannelState, ConnectionId, DisconnectReason, ListenerState, TcpClientChannel,
    TcpClientEvents, TcpConnection, TcpListenerChannel, TcpListenerEvents,
};
pub use udp::{UdpChannel, UdpEvents, UdpMode};

/// Boxed future returned by async event hooks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which socket carries a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Ordered, reliable stream.
    Tcp,
    /// Unordered datagram, dropped before the rendezvous completes.
    Udp,
}
