use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::network::Message;

#[derive(Debug)]
struct RegisteredConnection {
    id: u64,
    outbound_tx: mpsc::UnboundedSender<Bytes>,
}

/// Live inbound connections of a server connector, keyed by peer address.
///
/// An entry only holds the sending end of the connection's outbound queue,
/// the socket itself stays with its handler task.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SocketAddr, RegisteredConnection>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection.
    ///
    /// The entry lives as long as the returned [`Registration`]. A stale entry
    /// for the same address is replaced.
    pub fn register(
        self: &Arc<Self>,
        remote_address: SocketAddr,
        outbound_tx: mpsc::UnboundedSender<Bytes>,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .insert(remote_address, RegisteredConnection { id, outbound_tx });
        debug!("registered connection {} from {}", id, remote_address);
        Registration {
            registry: Arc::clone(self),
            remote_address,
            id,
        }
    }

    /// Queues the message on the connection of its remote address.
    ///
    /// Returns false if no live connection is registered for that address.
    pub fn send(&self, message: Message) -> bool {
        let remote_address = message.remote_address();
        match self.connections.get(&remote_address) {
            Some(connection) => connection.outbound_tx.send(message.into_payload()).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, remote_address: &SocketAddr) -> bool {
        self.connections.contains_key(remote_address)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drops every outbound sender, which makes each handler close its connection.
    pub fn clear(&self) {
        self.connections.clear();
    }

    fn deregister(&self, remote_address: &SocketAddr, id: u64) {
        if self
            .connections
            .remove_if(remote_address, |_, connection| connection.id == id)
            .is_some()
        {
            debug!("deregistered connection {} from {}", id, remote_address);
        }
    }
}

/// Keeps a registry entry alive, removes it on drop whatever ended the connection.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    remote_address: SocketAddr,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(&self.remote_address, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_send_routes_by_address() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _registration = registry.register(address(4000), tx);

        assert!(registry.send(Message::new(vec![1, 2], address(4000))));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(&[1, 2]));

        // unknown peer, dropped and nothing created
        assert!(!registry.send(Message::new(vec![3], address(4001))));
        assert!(!registry.contains(&address(4001)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registration_drop_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let registration = registry.register(address(4000), tx);
        assert!(registry.contains(&address(4000)));
        drop(registration);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_registration_keeps_newer_entry() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = registry.register(address(4000), old_tx);
        let _new = registry.register(address(4000), new_tx);

        drop(old);
        assert!(registry.contains(&address(4000)));
        assert!(registry.send(Message::new(vec![9], address(4000))));
        assert_eq!(new_rx.try_recv().unwrap(), Bytes::from_static(&[9]));
    }

    #[test]
    fn test_send_to_closed_handler() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let _registration = registry.register(address(4000), tx);
        drop(rx);
        assert!(!registry.send(Message::new(vec![1], address(4000))));
    }

    #[test]
    fn test_clear_closes_outbound() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registration = registry.register(address(4000), tx);
        registry.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        drop(registration);
        assert!(registry.is_empty());
    }
}
