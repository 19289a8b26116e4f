//! # Barter Node
//!
//! The runtime that owns every subsystem of one node and wires them
//! together. The gossip network reports inbound traffic to the node through
//! [`MessageHandler`]; the node routes each message to the subsystem that
//! owns it.
//!
//! ```text
//!                    ┌──────────────┐
//!   peers ◀────────▶ │GossipNetwork │
//!                    └──────┬───────┘
//!                           │ MessageHandler
//!                    ┌──────▼───────┐
//!                    │  BarterNode  │
//!                    └──┬──┬──┬──┬──┘
//!        ┌──────────────┘  │  │  └──────────────┐
//!   ┌────▼─────┐  ┌────────▼┐ ┌▼───────────┐ ┌──▼────────────┐
//!   │Blockchain│  │DataRouter│ │ShardRouter │ │BarterContract │
//!   └──────────┘  └─────────┘ └────────────┘ └───────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `new()` builds the subsystems and queues the node's configured stake as
//! a `STAKE` transaction. `start()` binds the listener, dials the
//! configured peers, and spawns the health, discovery, producer, and
//! pruning loops. `shutdown()` flips the network's watch channel, which
//! every loop observes.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::barter::BarterContract;
use crate::config;
use crate::crypto::random_hex;
use crate::ledger::{
    Block, Blockchain, ChainStatus, ChainUpdate, LedgerConfig, LedgerError, Transaction,
};
use crate::network::{
    Connection, GossipConfig, GossipNetwork, Message, MessageHandler, NetworkError,
};
use crate::producer::{persist_block, BlockProducer, ProducerConfig};
use crate::routing::{DataRouter, RouterConfig};
use crate::shard::{ShardConfig, ShardRouter};
use crate::storage::Store;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Interface the peer listener binds to.
    pub bind_host: String,
    /// `host:port` addresses dialled at start.
    pub peers: Vec<String>,
    /// Stake this node credits itself with, carried to peers by a `STAKE`
    /// transaction in its first block.
    pub stake: u64,
    /// Finished offers older than this are pruned.
    pub offer_retention: Duration,
    pub prune_interval: Duration,
    pub gossip: GossipConfig,
    pub ledger: LedgerConfig,
    pub shard: ShardConfig,
    pub router: RouterConfig,
    pub producer: ProducerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_host: config::DEFAULT_BIND_HOST.to_string(),
            peers: Vec::new(),
            stake: config::DEFAULT_VALIDATOR_STAKE,
            offer_retention: config::OFFER_RETENTION,
            prune_interval: config::OFFER_PRUNE_INTERVAL,
            gossip: GossipConfig::default(),
            ledger: LedgerConfig::default(),
            shard: ShardConfig::default(),
            router: RouterConfig::default(),
            producer: ProducerConfig::default(),
        }
    }
}

/// Point-in-time summary of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: String,
    pub port: u16,
    pub peers: Vec<String>,
    pub connections: usize,
    pub chain: ChainStatus,
    pub offers: usize,
    pub open_offers: usize,
    pub blocks_produced: u64,
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Adds `tx` to the pending pool and announces it with `NEW_TRANSACTION`.
///
/// The announced copy is the one passed in, before the ledger stamps its
/// shard; receivers stamp it themselves. Returns `Ok(false)` if an
/// identical transaction was already pending, in which case nothing is sent.
pub(crate) fn publish_transaction(
    ledger: &RwLock<Blockchain>,
    network: &GossipNetwork,
    tx: Transaction,
) -> Result<bool, LedgerError> {
    let added = ledger.write().add_transaction(tx.clone())?;
    if added {
        network.broadcast(&Message::NewTransaction(tx));
    }
    Ok(added)
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct BarterNode {
    id: String,
    config: NodeConfig,
    network: Arc<GossipNetwork>,
    ledger: Arc<RwLock<Blockchain>>,
    store: Arc<dyn Store>,
    router: Arc<DataRouter>,
    shards: Arc<ShardRouter>,
    contract: Arc<BarterContract>,
    producer: Arc<BlockProducer>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BarterNode {
    /// Builds a node with a fresh random id on top of `store`.
    pub fn new(config: NodeConfig, store: Arc<dyn Store>) -> Arc<Self> {
        Self::with_id(random_hex(config::NODE_ID_BYTES), config, store)
    }

    /// Builds a node with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, config: NodeConfig, store: Arc<dyn Store>) -> Arc<Self> {
        let id = id.into();
        let network = GossipNetwork::new(id.clone(), config.gossip.clone());

        let mut chain = Blockchain::new(config.ledger.clone());
        if config.stake > 0 {
            // Queued as a STAKE transaction so peers credit it once mined.
            if let Err(e) = chain.stake(&id, config.stake) {
                warn!(node = %id, error = %e, "cannot register configured stake");
            }
        }
        let ledger = Arc::new(RwLock::new(chain));

        let router = Arc::new(DataRouter::new(network.clone(), config.router.clone()));
        let shards = Arc::new(ShardRouter::new(
            store.clone(),
            network.clone(),
            ledger.clone(),
            config.shard.clone(),
        ));
        let contract = Arc::new(BarterContract::new(
            store.clone(),
            network.clone(),
            ledger.clone(),
            router.clone(),
        ));
        if let Err(e) = contract.load_from_store() {
            warn!(error = %e, "cannot load offers from store");
        }
        let producer = Arc::new(BlockProducer::new(
            ledger.clone(),
            network.clone(),
            store.clone(),
            config.producer.clone(),
        ));

        let node = Arc::new(Self {
            id,
            config,
            network,
            ledger,
            store,
            router,
            shards,
            contract,
            producer,
            tasks: Mutex::new(Vec::new()),
        });
        let handler: Weak<BarterNode> = Arc::downgrade(&node);
        node.network.set_handler(handler);
        info!(node = %node.id, "node created");
        node
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<GossipNetwork> {
        &self.network
    }

    pub fn ledger(&self) -> &Arc<RwLock<Blockchain>> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn data_router(&self) -> &Arc<DataRouter> {
        &self.router
    }

    pub fn shard_router(&self) -> &Arc<ShardRouter> {
        &self.shards
    }

    pub fn contract(&self) -> &Arc<BarterContract> {
        &self.contract
    }

    pub fn producer(&self) -> &Arc<BlockProducer> {
        &self.producer
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Binds the peer listener, dials the configured peers, and spawns the
    /// background loops. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, NetworkError> {
        let addr = self.network.listen(&self.config.bind_host).await?;

        for peer in &self.config.peers {
            let network = self.network.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = network.connect_with_retry(&peer).await {
                    warn!(peer = %peer, error = %e, "initial peer unreachable");
                }
            });
        }

        let mut tasks = self.network.spawn_maintenance();

        let producer = self.producer.clone();
        let shutdown = self.network.shutdown_signal();
        tasks.push(tokio::spawn(async move { producer.run(shutdown).await }));

        tasks.push(self.spawn_pruning());

        self.tasks.lock().extend(tasks);
        info!(node = %self.id, addr = %addr, peers = self.config.peers.len(), "node started");
        Ok(addr)
    }

    fn spawn_pruning(&self) -> JoinHandle<()> {
        let contract = self.contract.clone();
        let retention = self.config.offer_retention;
        let period = self.config.prune_interval;
        let mut shutdown = self.network.shutdown_signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        contract.prune_old_data(retention);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stops every loop, closes all connections, and waits for the loops to exit.
    pub async fn shutdown(&self) {
        self.network.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(node = %self.id, "node stopped");
    }

    // -- Operations ---------------------------------------------------------

    /// Validates `tx`, adds it to the pending pool, and announces it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<bool, LedgerError> {
        publish_transaction(&self.ledger, &self.network, tx)
    }

    /// Raises this node's stake and announces the `STAKE` transaction.
    pub fn stake(&self, amount: u64) -> Result<Transaction, LedgerError> {
        let tx = self.ledger.write().stake(&self.id, amount)?;
        self.network.broadcast(&Message::NewTransaction(tx.clone()));
        Ok(tx)
    }

    /// Seals the pending pool into a block now, regardless of the validator draw.
    pub fn produce_block(&self) -> Result<Block, LedgerError> {
        self.producer.seal()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id.clone(),
            port: self.network.port(),
            peers: self.network.peer_addresses(),
            connections: self.network.connection_count(),
            chain: self.ledger.read().status(),
            offers: self.contract.offer_count(),
            open_offers: self.contract.open_offer_count(),
            blocks_produced: self.producer.blocks_produced(),
        }
    }

    // -- Ledger traffic -----------------------------------------------------

    fn on_blocks(&self, conn: &Arc<Connection>, blocks: Vec<Block>) {
        let update = self.ledger.write().reconcile(blocks);
        match update {
            ChainUpdate::Unchanged => trace!(conn = conn.id(), "remote tip matches ours"),
            ChainUpdate::Appended(block) => {
                persist_block(self.store.as_ref(), &block);
                self.network
                    .broadcast(&Message::ResponseBlockchain(vec![block]));
            }
            ChainUpdate::Replaced { length, adopted } => {
                info!(conn = conn.id(), length, adopted = adopted.len(), "adopted remote chain");
                for block in &adopted {
                    persist_block(self.store.as_ref(), block);
                }
                let latest = self.ledger.read().latest_block().clone();
                self.network
                    .broadcast(&Message::ResponseBlockchain(vec![latest]));
            }
            ChainUpdate::NeedFullChain => {
                conn.send(&Message::QueryAll);
            }
            ChainUpdate::Rejected(reason) => {
                debug!(conn = conn.id(), reason = %reason, "remote blocks rejected");
            }
        }
    }

    fn on_transaction(&self, tx: Transaction) {
        match self.ledger.write().add_transaction(tx.clone()) {
            Ok(true) => {}
            Ok(false) => {
                trace!(kind = %tx.kind, "transaction already pending");
                return;
            }
            Err(e) => {
                warn!(kind = %tx.kind, error = %e, "rejecting remote transaction");
                return;
            }
        }
        self.network.broadcast(&Message::NewTransaction(tx));
    }

    fn on_new_block(&self, block: Block) {
        if let Err(e) = self.ledger.write().append_block(block.clone()) {
            debug!(hash = %block.hash, error = %e, "ignoring announced block");
            return;
        }
        persist_block(self.store.as_ref(), &block);
        self.network.broadcast(&Message::NewBlock(block));
    }
}

impl MessageHandler for BarterNode {
    fn handle_message(&self, conn: &Arc<Connection>, message: Message) {
        match message {
            Message::QueryLatest => {
                let latest = self.ledger.read().latest_block().clone();
                conn.send(&Message::ResponseBlockchain(vec![latest]));
            }
            Message::QueryAll => {
                let chain = self.ledger.read().chain().to_vec();
                conn.send(&Message::ResponseBlockchain(chain));
            }
            Message::ResponseBlockchain(blocks) => self.on_blocks(conn, blocks),
            Message::NewTransaction(tx) => self.on_transaction(tx),
            Message::NewBlock(block) => self.on_new_block(block),

            Message::DataRequest(request) => self.router.handle_request(conn, request),
            Message::DataResponse(response) => {
                self.router.handle_response(response);
            }
            Message::ShardDataRequest(request) => {
                self.shards.handle_shard_data_request(conn, request)
            }
            Message::ShardDataResponse(response) => {
                self.shards.handle_shard_data_response(response);
            }
            Message::ItemAdded(msg) => {
                self.shards.handle_item_added(msg);
            }
            Message::ItemStatusUpdated(msg) => {
                self.shards.handle_item_status_updated(msg);
            }

            Message::ContractOffer(offer) => {
                self.contract.sync_offer(offer);
            }
            Message::ContractResponse(msg) => {
                self.contract.sync_offer_response(msg);
            }
            Message::ContractConfirm(msg) => {
                self.contract.sync_offer_confirmation(msg);
            }
            Message::ReputationUpdate(msg) => self.contract.sync_reputation(msg),

            msg @ (Message::Handshake(_)
            | Message::HandshakeAck(_)
            | Message::GetPeers
            | Message::PeersList(_)
            | Message::Ping
            | Message::Pong(_)) => {
                debug!(kind = msg.kind(), "network message reached the node handler");
            }
        }
    }
}

impl std::fmt::Debug for BarterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarterNode")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("contract", &self.contract)
            .finish()
    }
}
