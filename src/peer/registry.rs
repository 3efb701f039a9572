//! Peer lookup by TCP connection and by UDP endpoint.
//!
//! Both maps live behind one mutex so they always change together: a peer
//! is in `by_udp` exactly when it is UDP-ready.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::{Peer, PeerId};
use crate::error::{Result, TransportError};
use crate::sync::lock;

#[derive(Default)]
struct Maps {
    by_connection: HashMap<PeerId, Arc<Peer>>,
    by_udp: HashMap<SocketAddr, Arc<Peer>>,
}

/// Registry of live peers.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    maps: Mutex<Maps>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted peer.
    pub(crate) fn insert(&self, peer: Arc<Peer>) {
        lock(&self.maps).by_connection.insert(peer.id(), peer);
    }

    pub(crate) fn get(&self, id: PeerId) -> Option<Arc<Peer>> {
        lock(&self.maps).by_connection.get(&id).cloned()
    }

    pub(crate) fn get_by_udp(&self, endpoint: SocketAddr) -> Option<Arc<Peer>> {
        lock(&self.maps).by_udp.get(&endpoint).cloned()
    }

    /// Bind `endpoint` to peer `id` and mark it UDP-ready.
    ///
    /// Returns `true` if the peer just became ready, `false` for a
    /// re-announcement. A peer announcing a new endpoint loses the old one.
    ///
    /// # Errors
    ///
    /// `Disconnected` if the peer is gone, `ProtocolViolation` if another
    /// peer already owns `endpoint`.
    pub(crate) fn bind_udp(&self, id: PeerId, endpoint: SocketAddr) -> Result<bool> {
        let mut maps = lock(&self.maps);

        let peer = maps
            .by_connection
            .get(&id)
            .cloned()
            .ok_or(TransportError::Disconnected)?;

        if let Some(owner) = maps.by_udp.get(&endpoint) {
            if owner.id() != id {
                return Err(TransportError::ProtocolViolation(format!(
                    "UDP endpoint {} already bound to peer {}",
                    endpoint,
                    owner.id()
                )));
            }
            return Ok(false);
        }

        if let Some(previous) = peer.udp_remote_addr() {
            maps.by_udp.remove(&previous);
        }

        let newly_ready = !peer.is_udp_ready();
        peer.set_udp_endpoint(endpoint);
        maps.by_udp.insert(endpoint, peer);
        Ok(newly_ready)
    }

    /// Remove a peer from both maps.
    pub(crate) fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        let mut maps = lock(&self.maps);
        let peer = maps.by_connection.remove(&id)?;

        if let Some(endpoint) = peer.udp_remote_addr() {
            if maps.by_udp.get(&endpoint).is_some_and(|owner| owner.id() == id) {
                maps.by_udp.remove(&endpoint);
            }
        }
        peer.clear_udp_endpoint();
        Some(peer)
    }

    /// Snapshot of every registered peer.
    pub(crate) fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.maps).by_connection.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.maps).by_connection.len()
    }

    #[cfg(test)]
    fn udp_len(&self) -> usize {
        lock(&self.maps).by_udp.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConnection;

    fn peer(remote: &str) -> Arc<Peer> {
        let (connection, _far) = TcpConnection::test_pair(remote.parse().unwrap());
        Arc::new(Peer::new(connection, 1024))
    }

    fn endpoint(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_bind_udp_makes_peer_reachable() {
        let registry = PeerRegistry::new();
        let a = peer("10.0.0.1:1000");
        registry.insert(a.clone());

        assert!(registry.get_by_udp(endpoint("10.0.0.1:2000")).is_none());
        assert!(registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")).unwrap());

        let found = registry.get_by_udp(endpoint("10.0.0.1:2000")).unwrap();
        assert_eq!(found.id(), a.id());
        assert!(a.is_udp_ready());
    }

    #[tokio::test]
    async fn test_reannounce_replaces_endpoint() {
        let registry = PeerRegistry::new();
        let a = peer("10.0.0.1:1000");
        registry.insert(a.clone());

        assert!(registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")).unwrap());
        assert!(!registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")).unwrap());
        assert!(!registry.bind_udp(a.id(), endpoint("10.0.0.1:2001")).unwrap());

        assert!(registry.get_by_udp(endpoint("10.0.0.1:2000")).is_none());
        assert!(registry.get_by_udp(endpoint("10.0.0.1:2001")).is_some());
        assert_eq!(registry.udp_len(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_owned_by_other_peer_is_violation() {
        let registry = PeerRegistry::new();
        let a = peer("10.0.0.1:1000");
        let b = peer("10.0.0.2:1000");
        registry.insert(a.clone());
        registry.insert(b.clone());

        registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")).unwrap();
        let err = registry
            .bind_udp(b.id(), endpoint("10.0.0.1:2000"))
            .unwrap_err();

        assert!(matches!(err, TransportError::ProtocolViolation(_)));
        assert!(!b.is_udp_ready());
        assert_eq!(
            registry.get_by_udp(endpoint("10.0.0.1:2000")).unwrap().id(),
            a.id()
        );
    }

    #[tokio::test]
    async fn test_bind_unknown_peer() {
        let registry = PeerRegistry::new();
        let a = peer("10.0.0.1:1000");

        assert!(matches!(
            registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")),
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_remove_clears_both_maps() {
        let registry = PeerRegistry::new();
        let a = peer("10.0.0.1:1000");
        registry.insert(a.clone());
        registry.bind_udp(a.id(), endpoint("10.0.0.1:2000")).unwrap();

        let removed = registry.remove(a.id()).unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get_by_udp(endpoint("10.0.0.1:2000")).is_none());
        assert!(!a.is_udp_ready());
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.udp_len(), 0);

        assert!(registry.remove(a.id()).is_none());
    }

    #[tokio::test]
    async fn test_peers_snapshot() {
        let registry = PeerRegistry::new();
        registry.insert(peer("10.0.0.1:1000"));
        registry.insert(peer("10.0.0.2:1000"));

        assert_eq!(registry.peers().len(), 2);
        assert_eq!(registry.len(), 2);
    }
}
