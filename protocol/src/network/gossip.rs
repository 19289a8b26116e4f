//! # Gossip Network
//!
//! Keeps a mesh of persistent duplex connections and routes typed messages.
//! Every node dials its configured peers, accepts inbound connections, and
//! learns further addresses through `GET_PEERS` / `PEERS_LIST`.
//!
//! ## Connection lifecycle
//!
//! ```text
//! attach ──▶ QUERY_LATEST ──(handshake delay)──▶ HANDSHAKE ──▶ HANDSHAKE_ACK
//!    │
//!    └──▶ read loop ──EOF / error / close / shutdown──▶ deregister
//! ```
//!
//! ## Liveness
//!
//! The health sweep pings every peer silent for longer than the stale
//! threshold. A ping still unanswered at the next sweep removes the peer
//! and closes its connection. `PING`, `PONG`, and `HANDSHAKE_ACK` refresh
//! liveness for the connection they arrive on.
//!
//! ## Deduplication
//!
//! `NEW_TRANSACTION` and `NEW_BLOCK` carry no hop counter, so each envelope
//! is identified by the BLAKE3 hash of its encoding. An envelope whose hash
//! is already in the bounded seen cache is dropped before dispatch.
//!
//! Delivery is best effort and at most once per attempt. Nothing is
//! retried at this layer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::connection::{read_envelope, write_envelopes, Connection, ConnectionId};
use super::message::{DecodeError, Handshake, HandshakeAck, Message, Pong};
use super::peer::{Peer, PeerTable};
use crate::config;
use crate::crypto::blake3_hash;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Port we listen on and advertise. `0` picks a free port at bind time.
    pub port: u16,
    /// Host advertised in our handshake.
    pub advertised_host: String,
    pub handshake_delay: Duration,
    pub health_check_interval: Duration,
    /// Silence after which a peer is pinged.
    pub stale_threshold: Duration,
    pub discovery_interval: Duration,
    pub connect_timeout: Duration,
    /// Extra dial attempts after the first failure.
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    /// Inbound connections beyond this are refused.
    pub max_peers: usize,
    pub seen_cache_size: usize,
    pub max_envelope_bytes: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            port: config::DEFAULT_P2P_PORT,
            advertised_host: config::DEFAULT_ADVERTISED_HOST.to_string(),
            handshake_delay: config::HANDSHAKE_DELAY,
            health_check_interval: config::HEALTH_CHECK_INTERVAL,
            stale_threshold: config::PEER_STALE_THRESHOLD,
            discovery_interval: config::DISCOVERY_INTERVAL,
            connect_timeout: config::PEER_CONNECTION_TIMEOUT,
            connect_retries: config::CONNECT_RETRIES,
            connect_backoff: config::CONNECT_BACKOFF,
            max_peers: config::MAX_PEERS,
            seen_cache_size: config::SEEN_CACHE_SIZE,
            max_envelope_bytes: config::MAX_ENVELOPE_BYTES,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Receives every message the network does not consume itself.
///
/// Called on the connection's reader task; implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, conn: &Arc<Connection>, message: Message);
}

// ---------------------------------------------------------------------------
// Gossip Network
// ---------------------------------------------------------------------------

pub struct GossipNetwork {
    node_id: String,
    config: GossipConfig,
    /// Bound port, once known.
    port: AtomicU16,
    peers: RwLock<PeerTable>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_connection_id: AtomicU64,
    dialing: DashSet<String>,
    /// Envelope hash → insertion sequence number.
    seen: DashMap<[u8; 32], u64>,
    seen_seq: AtomicU64,
    handler: RwLock<Option<Weak<dyn MessageHandler>>>,
    shutdown: watch::Sender<bool>,
}

impl GossipNetwork {
    pub fn new(node_id: impl Into<String>, config: GossipConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            port: AtomicU16::new(config.port),
            config,
            peers: RwLock::new(PeerTable::new()),
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            dialing: DashSet::new(),
            seen: DashMap::new(),
            seen_seq: AtomicU64::new(0),
            handler: RwLock::new(None),
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// `host:port` other nodes reach us at.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.config.advertised_host, self.port())
    }

    pub fn set_handler(&self, handler: Weak<dyn MessageHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// A receiver that flips to `true` when [`shutdown`](Self::shutdown) runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // -- Peers --------------------------------------------------------------

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        self.peers.read().addresses()
    }

    pub fn knows_peer(&self, address: &str) -> bool {
        self.peers.read().contains(address)
    }

    /// Open connections, handshaken or not.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // -- Transport ----------------------------------------------------------

    /// Binds the peer listener on `host` and starts accepting connections.
    pub async fn listen(self: &Arc<Self>, host: &str) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind((host, self.config.port)).await?;
        let local = listener.local_addr()?;
        self.port.store(local.port(), Ordering::Relaxed);
        info!(addr = %local, "listening for peers");

        let net = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            if net.connections.len() >= net.config.max_peers {
                                warn!(remote = %remote, max = net.config.max_peers, "peer limit reached, refusing connection");
                            } else {
                                let _ = stream.set_nodelay(true);
                                debug!(remote = %remote, "accepted peer connection");
                                net.attach(stream, remote.to_string(), None);
                            }
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("peer listener stopped");
        });
        Ok(local)
    }

    /// Dials `address` once.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<Arc<Connection>, NetworkError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::Timeout(address.to_string()))?
            .map_err(|source| NetworkError::Connect {
                address: address.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        info!(peer = %address, "connected to peer");
        Ok(self.attach(stream, address, Some(address.to_string())))
    }

    /// Dials `address` with the configured retry budget and fixed backoff.
    pub async fn connect_with_retry(
        self: &Arc<Self>,
        address: &str,
    ) -> Result<Arc<Connection>, NetworkError> {
        let mut attempt = 0;
        loop {
            match self.connect(address).await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < self.config.connect_retries => {
                    attempt += 1;
                    debug!(peer = %address, attempt, error = %e, "dial failed, retrying");
                    tokio::time::sleep(self.config.connect_backoff).await;
                }
                Err(e) => {
                    self.peers.write().remove(address);
                    warn!(peer = %address, error = %e, "giving up on peer");
                    return Err(e);
                }
            }
        }
    }

    /// Wires an established stream into the network. `dialed` is the
    /// address we dialled, if the connection is outbound.
    pub fn attach<S>(
        self: &Arc<Self>,
        stream: S,
        remote: impl Into<String>,
        dialed: Option<String>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound) = Connection::new(id, remote);
        let conn = Arc::new(conn);
        self.connections.insert(id, conn.clone());
        if let Some(address) = dialed {
            self.peers.write().insert(Peer::new(address, conn.clone()));
        }

        let (reader, writer) = tokio::io::split(stream);

        let writer_conn = conn.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = write_envelopes(writer, outbound) => {}
                _ = writer_conn.closed() => {}
            }
        });

        let net = Arc::clone(self);
        let reader_conn = conn.clone();
        tokio::spawn(async move { net.read_loop(reader_conn, reader).await });

        conn.send(&Message::QueryLatest);
        let net = Arc::clone(self);
        let greet_conn = conn.clone();
        tokio::spawn(async move { net.greet(greet_conn).await });

        conn
    }

    async fn greet(self: Arc<Self>, conn: Arc<Connection>) {
        tokio::time::sleep(self.config.handshake_delay).await;
        if !conn.is_open() {
            return;
        }
        conn.send(&Message::Handshake(Handshake {
            node_id: self.node_id.clone(),
            port: self.port(),
            address: self.config.advertised_host.clone(),
        }));
    }

    async fn read_loop<R>(self: Arc<Self>, conn: Arc<Connection>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut shutdown = self.shutdown.subscribe();
        let max_bytes = self.config.max_envelope_bytes;
        while !*shutdown.borrow() {
            let next = tokio::select! {
                next = read_envelope(&mut reader, max_bytes) => next,
                _ = conn.closed() => break,
                _ = shutdown.changed() => break,
            };
            match next {
                Ok(Some(line)) => self.on_envelope(&conn, &line),
                Ok(None) => {
                    debug!(conn = conn.id(), remote = %conn.remote(), "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn = conn.id(), remote = %conn.remote(), error = %e, "peer connection failed");
                    break;
                }
            }
        }
        self.deregister(&conn);
    }

    /// Drops `conn` from the connection and peer tables and closes it.
    fn deregister(&self, conn: &Arc<Connection>) {
        conn.close();
        self.connections.remove(&conn.id());
        for peer in self.peers.write().remove_connection(conn.id()) {
            info!(peer = %peer.address, "peer disconnected");
        }
    }

    // -- Inbound ------------------------------------------------------------

    fn on_envelope(self: &Arc<Self>, conn: &Arc<Connection>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let message = match Message::decode(line) {
            Ok(message) => message,
            Err(DecodeError::UnknownType(kind)) => {
                warn!(conn = conn.id(), kind = %kind, "ignoring unknown message type");
                return;
            }
            Err(e) => {
                warn!(conn = conn.id(), error = %e, "dropping malformed envelope");
                return;
            }
        };

        if message.is_relayed() && !self.mark_seen(&message) {
            trace!(conn = conn.id(), kind = message.kind(), "dropping duplicate envelope");
            return;
        }
        trace!(conn = conn.id(), kind = message.kind(), "received message");
        self.dispatch(conn, message);
    }

    /// Handles network-level messages and hands everything else to the
    /// registered [`MessageHandler`].
    pub fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, message: Message) {
        match message {
            Message::Handshake(hs) => self.on_handshake(conn, hs),
            Message::HandshakeAck(ack) => {
                debug!(conn = conn.id(), node = %ack.node_id, "handshake acknowledged");
                self.peers.write().touch_connection(conn.id(), Some(&ack.node_id));
            }
            Message::GetPeers => {
                conn.send(&Message::PeersList(self.peer_addresses()));
            }
            Message::PeersList(addresses) => self.on_peers_list(addresses),
            Message::Ping => {
                conn.send(&Message::Pong(Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                }));
                self.peers.write().touch_connection(conn.id(), None);
            }
            Message::Pong(_) => {
                self.peers.write().touch_connection(conn.id(), None);
            }
            other => self.deliver(conn, other),
        }
    }

    fn deliver(&self, conn: &Arc<Connection>, message: Message) {
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.handle_message(conn, message),
            None => debug!(kind = message.kind(), "no handler registered, dropping message"),
        }
    }

    fn on_handshake(&self, conn: &Arc<Connection>, hs: Handshake) {
        let address = hs.peer_address();
        info!(conn = conn.id(), node = %hs.node_id, peer = %address, "handshake received");
        self.peers
            .write()
            .insert(Peer::new(address, conn.clone()).with_node_id(hs.node_id));
        conn.send(&Message::HandshakeAck(HandshakeAck {
            node_id: self.node_id.clone(),
            port: self.port(),
        }));
    }

    fn on_peers_list(self: &Arc<Self>, addresses: Vec<String>) {
        let own = self.advertised_address();
        for address in addresses {
            if address == own || self.knows_peer(&address) || !self.dialing.insert(address.clone()) {
                continue;
            }
            debug!(peer = %address, "dialling discovered peer");
            let net = Arc::clone(self);
            tokio::spawn(async move {
                let _ = net.connect_with_retry(&address).await;
                net.dialing.remove(&address);
            });
        }
    }

    // -- Outbound -----------------------------------------------------------

    /// Sends `message` to every open connection. Returns how many accepted it.
    /// A failing connection never affects the others.
    pub fn broadcast(&self, message: &Message) -> usize {
        let line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "cannot encode broadcast");
                return 0;
            }
        };
        if message.is_relayed() {
            self.remember(blake3_hash(line.as_bytes()));
        }

        let targets: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        let sent = targets
            .iter()
            .filter(|conn| conn.send_line(line.clone()))
            .count();
        trace!(kind = message.kind(), sent, "broadcast");
        sent
    }

    pub fn send_to(&self, conn: &Connection, message: &Message) -> bool {
        conn.send(message)
    }

    // -- Deduplication ------------------------------------------------------

    /// Records `message` in the seen cache. Returns `false` if it was already there.
    fn mark_seen(&self, message: &Message) -> bool {
        match message.encode() {
            Ok(line) => self.remember(blake3_hash(line.as_bytes())),
            Err(_) => true,
        }
    }

    fn remember(&self, hash: [u8; 32]) -> bool {
        let seq = self.seen_seq.fetch_add(1, Ordering::Relaxed);
        let fresh = match self.seen.entry(hash) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(seq);
                true
            }
        };
        if fresh {
            self.maybe_evict_seen_cache();
        }
        fresh
    }

    /// Trims the seen cache to 75% of capacity, oldest first.
    fn maybe_evict_seen_cache(&self) {
        if self.seen.len() <= self.config.seen_cache_size {
            return;
        }
        let target = self.config.seen_cache_size * 3 / 4;
        let mut entries: Vec<([u8; 32], u64)> =
            self.seen.iter().map(|e| (*e.key(), *e.value())).collect();
        entries.sort_by_key(|(_, seq)| *seq);

        let to_remove = entries.len().saturating_sub(target);
        for (hash, _) in entries.iter().take(to_remove) {
            self.seen.remove(hash);
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    // -- Maintenance --------------------------------------------------------

    /// One liveness pass. Returns `(pinged, removed)`.
    pub fn sweep_liveness(&self) -> (usize, usize) {
        let sweep = self.peers.write().sweep(self.config.stale_threshold);
        for conn in &sweep.to_ping {
            conn.send(&Message::Ping);
        }
        for peer in &sweep.removed {
            info!(peer = %peer.address, "removing unresponsive peer");
            peer.connection.close();
            self.connections.remove(&peer.connection.id());
        }
        (sweep.to_ping.len(), sweep.removed.len())
    }

    /// Asks every peer for its peer list.
    pub fn discover(&self) -> usize {
        self.broadcast(&Message::GetPeers)
    }

    /// Spawns the health and discovery loops. Both stop on shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_periodic("health", self.config.health_check_interval, |net| {
                let (pinged, removed) = net.sweep_liveness();
                debug!(pinged, removed, peers = net.peer_count(), "health sweep");
            }),
            self.spawn_periodic("discovery", self.config.discovery_interval, |net| {
                net.discover();
            }),
        ]
    }

    fn spawn_periodic<F>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&Arc<Self>) + Send + 'static,
    {
        let net = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick(&net),
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "maintenance loop stopped");
        })
    }

    /// Signals every loop to stop and closes all connections.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let open: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for conn in open {
            conn.close();
        }
        self.connections.clear();
        *self.peers.write() = PeerTable::new();
        info!(node = %self.node_id, "gossip network shut down");
    }
}

impl std::fmt::Debug for GossipNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipNetwork")
            .field("node_id", &self.node_id)
            .field("port", &self.port())
            .field("connections", &self.connections.len())
            .field("peers", &self.peer_count())
            .finish()
    }
}
