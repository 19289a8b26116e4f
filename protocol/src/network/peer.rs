//! Peer bookkeeping: who we talk to, over which connection, and when we
//! last heard from them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::connection::{Connection, ConnectionId};

#[derive(Debug, Clone)]
pub struct Peer {
    /// `host:port` the peer listens on.
    pub address: String,
    /// Known once the peer's handshake or ack arrives.
    pub node_id: Option<String>,
    pub connection: Arc<Connection>,
    pub last_seen: Instant,
    /// Set by the liveness sweep, cleared by any liveness message.
    pub ping_sent_at: Option<Instant>,
}

impl Peer {
    pub fn new(address: impl Into<String>, connection: Arc<Connection>) -> Self {
        Self {
            address: address.into(),
            node_id: None,
            connection,
            last_seen: Instant::now(),
            ping_sent_at: None,
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Outcome of one liveness sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Stale peers that should be pinged now.
    pub to_ping: Vec<Arc<Connection>>,
    /// Peers whose previous ping went unanswered.
    pub removed: Vec<Peer>,
}

/// Peers keyed by address; at most one entry per address and per connection.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `peer`, replacing any entry for the same address or the same
    /// connection. Returns the replaced entries.
    pub fn insert(&mut self, peer: Peer) -> Vec<Peer> {
        let conn_id = peer.connection.id();
        let mut replaced = self.remove_connection(conn_id);
        if let Some(old) = self.peers.insert(peer.address.clone(), peer) {
            replaced.push(old);
        }
        replaced
    }

    pub fn remove(&mut self, address: &str) -> Option<Peer> {
        self.peers.remove(address)
    }

    /// Drops every entry that uses connection `id`.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Vec<Peer> {
        let addresses: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.connection.id() == id)
            .map(|p| p.address.clone())
            .collect();
        addresses
            .into_iter()
            .filter_map(|addr| self.peers.remove(&addr))
            .collect()
    }

    /// Refreshes liveness of the peer on connection `id` and clears its
    /// outstanding ping. Returns `false` if no peer uses that connection.
    pub fn touch_connection(&mut self, id: ConnectionId, node_id: Option<&str>) -> bool {
        let now = Instant::now();
        let mut found = false;
        for peer in self.peers.values_mut().filter(|p| p.connection.id() == id) {
            peer.last_seen = now;
            peer.ping_sent_at = None;
            if let Some(node_id) = node_id {
                peer.node_id = Some(node_id.to_string());
            }
            found = true;
        }
        found
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Pings peers silent for longer than `stale_after`; removes peers whose
    /// ping from an earlier sweep is still unanswered.
    pub fn sweep(&mut self, stale_after: Duration) -> Sweep {
        let now = Instant::now();
        let mut sweep = Sweep::default();
        let mut dead = Vec::new();

        for peer in self.peers.values_mut() {
            if peer.ping_sent_at.is_some() {
                dead.push(peer.address.clone());
            } else if now.duration_since(peer.last_seen) > stale_after {
                peer.ping_sent_at = Some(now);
                sweep.to_ping.push(peer.connection.clone());
            }
        }
        sweep.removed = dead
            .into_iter()
            .filter_map(|addr| self.peers.remove(&addr))
            .collect();
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: ConnectionId) -> Arc<Connection> {
        let (conn, _rx) = Connection::new(id, "test");
        Arc::new(conn)
    }

    #[tokio::test(start_paused = true)]
    async fn one_entry_per_address_and_connection() {
        let mut table = PeerTable::new();
        let c1 = conn(1);
        table.insert(Peer::new("10.0.0.1:6001", c1.clone()));
        let replaced = table.insert(Peer::new("10.0.0.1:6001", conn(2)));
        assert_eq!(replaced.len(), 1);
        assert_eq!(table.len(), 1);

        // A handshake re-keys the dialled entry under the advertised address.
        table.insert(Peer::new("dialled:1", c1.clone()));
        table.insert(Peer::new("advertised:1", c1).with_node_id("n1"));
        assert!(!table.contains("dialled:1"));
        assert_eq!(table.get("advertised:1").and_then(|p| p.node_id.as_deref()), Some("n1"));
        assert_eq!(table.addresses(), vec!["10.0.0.1:6001", "advertised:1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_pings_then_removes() {
        let mut table = PeerTable::new();
        table.insert(Peer::new("a:1", conn(1)));
        let stale = Duration::from_secs(120);

        let sweep = table.sweep(stale);
        assert!(sweep.to_ping.is_empty() && sweep.removed.is_empty());

        tokio::time::advance(Duration::from_secs(121)).await;
        let sweep = table.sweep(stale);
        assert_eq!(sweep.to_ping.len(), 1);
        assert!(sweep.removed.is_empty());

        tokio::time::advance(Duration::from_secs(30)).await;
        let sweep = table.sweep(stale);
        assert_eq!(sweep.removed.len(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_ping_keeps_peer() {
        let mut table = PeerTable::new();
        table.insert(Peer::new("a:1", conn(7)));
        let stale = Duration::from_secs(120);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(table.sweep(stale).to_ping.len(), 1);
        assert!(table.touch_connection(7, None));

        tokio::time::advance(Duration::from_secs(30)).await;
        let sweep = table.sweep(stale);
        assert!(sweep.removed.is_empty() && sweep.to_ping.is_empty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_connection_drops_entries() {
        let mut table = PeerTable::new();
        table.insert(Peer::new("a:1", conn(1)));
        table.insert(Peer::new("b:1", conn(2)));
        assert_eq!(table.remove_connection(1).len(), 1);
        assert!(!table.touch_connection(1, None));
        assert_eq!(table.addresses(), vec!["b:1"]);
    }
}
