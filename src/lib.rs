//! # hybrid-transport
//!
//! Hybrid TCP+UDP transport for latency-sensitive client/server apps.
//!
//! Every message is a length-prefixed frame. A client holds one TCP
//! connection (ordered, reliable) and one UDP socket (fast, lossy) to the
//! server. Right after connecting it announces its UDP endpoint over TCP,
//! and the server binds that endpoint to the peer created at accept.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): `[i32 LE length][u8 kind][payload]`,
//!   rebuilt from arbitrarily chunked reads by a fixed-size accumulator
//! - **Channels** ([`transport`]): tokio accept/read loops and a writer task
//!   per TCP connection, one receive loop per UDP socket
//! - **Facades** ([`Server`], [`Client`]): rendezvous, keepalive, peer
//!   registry and event callbacks
//!
//! ## Example
//!
//! ```ignore
//! use hybrid_transport::{Client, Delivery, Server};
//!
//! #[tokio::main]
//! async fn main() -> hybrid_transport::Result<()> {
//!     let server = Server::builder()
//!         .on_message(|peer, payload, delivery| {
//!             println!("{:?} from {}: {:?}", delivery, peer.id(), payload);
//!         })
//!         .start("127.0.0.1:0".parse().unwrap())
//!         .await?;
//!
//!     let client = Client::builder()
//!         .on_connected(|| println!("connected"))
//!         .build();
//!     client.connect(server.local_addr())?;
//!
//!     // later, once connected
//!     client.send(b"state update", Delivery::Udp)?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod transport;

mod client;
mod keepalive;
mod server;
mod sync;
mod writer;

pub use client::{Client, ClientBuilder};
pub use config::TransportConfig;
pub use dispatch::{Dispatcher, DispatcherId, EventDelivery};
pub use error::{Result, TransportError};
pub use peer::{Peer, PeerId};
pub use protocol::FrameKind;
pub use server::{Server, ServerBuilder};
pub use transport::{ChannelState, Delivery, ListenerState};
