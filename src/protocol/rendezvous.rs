//! `UdpInformation` control payload.
//!
//! After its TCP connection is up, a client announces the local endpoint of
//! its UDP socket over TCP so the server can bind that endpoint to the peer:
//! ```text
//! ┌──────────────────┬──────────────┐
//! │ IPv4 address     │ Port         │
//! │ 4 bytes (octets) │ int32 LE     │
//! └──────────────────┴──────────────┘
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{Result, TransportError};

/// Size of the `UdpInformation` payload.
pub const UDP_INFORMATION_SIZE: usize = 8;

/// Decoded UDP endpoint announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInformation {
    /// The announcing side's UDP endpoint.
    pub endpoint: SocketAddrV4,
}

impl UdpInformation {
    /// Create an announcement for `endpoint`.
    pub fn new(endpoint: SocketAddrV4) -> Self {
        Self { endpoint }
    }

    /// Build an announcement from a bound socket address.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for IPv6 addresses; the payload only carries IPv4.
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self::new(v4)),
            SocketAddr::V6(v6) => Err(TransportError::Usage(format!(
                "UDP endpoint {} is IPv6; rendezvous only announces IPv4",
                v6
            ))),
        }
    }

    /// Encode to the 8-byte wire payload.
    pub fn encode(&self) -> [u8; UDP_INFORMATION_SIZE] {
        let mut buf = [0u8; UDP_INFORMATION_SIZE];
        buf[..4].copy_from_slice(&self.endpoint.ip().octets());
        buf[4..].copy_from_slice(&i32::from(self.endpoint.port()).to_le_bytes());
        buf
    }

    /// Decode from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` for a wrong payload size or a port outside
    /// `0..=65535`.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != UDP_INFORMATION_SIZE {
            return Err(TransportError::ProtocolViolation(format!(
                "UdpInformation payload must be {} bytes, got {}",
                UDP_INFORMATION_SIZE,
                payload.len()
            )));
        }

        let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
        let port = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let port = u16::try_from(port).map_err(|_| {
            TransportError::ProtocolViolation(format!("UdpInformation port {} out of range", port))
        })?;

        Ok(Self::new(SocketAddrV4::new(ip, port)))
    }

    /// Endpoint to register, filling an unspecified address with the IP
    /// observed on the peer's TCP connection.
    pub fn resolve(&self, observed: SocketAddr) -> SocketAddr {
        if self.endpoint.ip().is_unspecified() {
            SocketAddr::new(observed.ip(), self.endpoint.port())
        } else {
            SocketAddr::V4(self.endpoint)
        }
    }
}
