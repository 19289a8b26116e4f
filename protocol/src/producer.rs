//! # Block Production Loop
//!
//! Each round, the loop draws a validator from the local stake registry.
//! If the draw names this node and the pool holds anything besides the
//! previous reward, the node seals a block and announces it with
//! `RESPONSE_BLOCKCHAIN [block]`.
//!
//! The draw uses local randomness, so two nodes may both decide they are
//! the producer for the same round. Their blocks then conflict, and fork
//! choice settles it when the nodes exchange tips.
//!
//! ## Shutdown
//!
//! The loop watches the network's shutdown channel and exits at the next
//! round boundary, or during the sleep between rounds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config;
use crate::ledger::{Block, Blockchain, LedgerError, TransactionKind};
use crate::network::{GossipNetwork, Message};
use crate::storage::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Time between two production rounds.
    pub block_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_interval: config::BLOCK_INTERVAL,
        }
    }
}

pub struct BlockProducer {
    node_id: String,
    ledger: Arc<RwLock<Blockchain>>,
    network: Arc<GossipNetwork>,
    store: Arc<dyn Store>,
    produced: AtomicU64,
    config: ProducerConfig,
}

impl BlockProducer {
    pub fn new(
        ledger: Arc<RwLock<Blockchain>>,
        network: Arc<GossipNetwork>,
        store: Arc<dyn Store>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            node_id: network.node_id().to_string(),
            ledger,
            network,
            store,
            produced: AtomicU64::new(0),
            config,
        }
    }

    /// Blocks sealed by this node since start.
    pub fn blocks_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Runs production rounds until `shutdown` flips to `true` or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node_id, interval = ?self.config.block_interval, "block producer starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_single_round() {
                Ok(Some(block)) => debug!(hash = %block.hash, "round produced a block"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "production round failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.block_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(node = %self.node_id, "block producer stopped");
    }

    /// One round. Returns the sealed block, or `None` when another
    /// validator was drawn or there was nothing to seal.
    pub fn run_single_round(&self) -> Result<Option<Block>, LedgerError> {
        let ledger = self.ledger.read();
        let Some(selected) = ledger.select_validator() else {
            debug!("validator registry is empty, skipping round");
            return Ok(None);
        };
        if selected != self.node_id {
            debug!(selected = %selected, "another validator drawn");
            return Ok(None);
        }
        let has_work = ledger
            .pending_transactions()
            .iter()
            .any(|tx| tx.kind != TransactionKind::Reward);
        drop(ledger);
        if !has_work {
            debug!("pending pool has no new transactions");
            return Ok(None);
        }
        self.seal().map(Some)
    }

    /// Mines the pending pool under this node's name, announces the block,
    /// and persists its transactions.
    pub fn seal(&self) -> Result<Block, LedgerError> {
        let block = self.ledger.write().mine_block(&self.node_id)?;
        self.produced.fetch_add(1, Ordering::Relaxed);

        let sent = self
            .network
            .broadcast(&Message::ResponseBlockchain(vec![block.clone()]));
        debug!(hash = %block.hash, peers = sent, "block announced");

        persist_block(self.store.as_ref(), &block);
        Ok(block)
    }
}

/// Writes every transaction of `block` to `store`. Failures are logged.
pub(crate) fn persist_block(store: &dyn Store, block: &Block) {
    let txs = match block.decompressed_transactions() {
        Ok(txs) => txs,
        Err(e) => {
            warn!(hash = %block.hash, error = %e, "cannot read block transactions");
            return;
        }
    };
    for tx in &txs {
        if let Err(e) = store.save_transaction(tx) {
            warn!(hash = %block.hash, kind = %tx.kind, error = %e, "cannot persist transaction");
        }
    }
}

impl std::fmt::Debug for BlockProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockProducer")
            .field("node_id", &self.node_id)
            .field("produced", &self.blocks_produced())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Transaction;
    use crate::network::GossipConfig;
    use crate::storage::{MemoryStore, TransactionFilter};
    use serde_json::json;

    fn producer(node: &str) -> (BlockProducer, Arc<RwLock<Blockchain>>, Arc<MemoryStore>) {
        let network = GossipNetwork::new(node, GossipConfig::default());
        let ledger = Arc::new(RwLock::new(Blockchain::default()));
        let store = Arc::new(MemoryStore::new());
        let producer = BlockProducer::new(
            ledger.clone(),
            network,
            store.clone(),
            ProducerConfig {
                block_interval: Duration::from_millis(50),
            },
        );
        (producer, ledger, store)
    }

    fn add_item_tx(user: &str) -> Transaction {
        Transaction::new(TransactionKind::AddItem, user, None, json!({ "name": "lamp" }))
    }

    #[test]
    fn empty_registry_skips() {
        let (producer, ledger, _) = producer("n1");
        ledger.write().add_transaction(add_item_tx("alice")).unwrap();
        assert!(producer.run_single_round().unwrap().is_none());
        assert_eq!(ledger.read().len(), 1);
    }

    #[test]
    fn other_validator_skips() {
        let (producer, ledger, _) = producer("n1");
        ledger.write().add_validator("n2", 50);
        ledger.write().add_transaction(add_item_tx("alice")).unwrap();
        assert!(producer.run_single_round().unwrap().is_none());
        assert_eq!(producer.blocks_produced(), 0);
    }

    #[test]
    fn sole_validator_seals_and_persists() {
        let (producer, ledger, store) = producer("n1");
        ledger.write().add_validator("n1", 10);
        ledger.write().add_transaction(add_item_tx("alice")).unwrap();
        ledger.write().add_transaction(add_item_tx("bob")).unwrap();

        let block = producer.run_single_round().unwrap().expect("block");
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(ledger.read().len(), 2);
        assert_eq!(producer.blocks_produced(), 1);
        assert_eq!(
            store.get_transactions(&TransactionFilter::default()).unwrap().len(),
            2
        );

        // Only the reward is left; nothing to seal.
        assert!(producer.run_single_round().unwrap().is_none());
    }

    #[test]
    fn seal_requires_stake() {
        let (producer, _, _) = producer("n1");
        assert!(matches!(
            producer.seal(),
            Err(LedgerError::InsufficientStake(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (producer, ledger, _) = producer("n1");
        ledger.write().add_validator("n1", 10);
        ledger.write().add_transaction(add_item_tx("alice")).unwrap();

        let (tx, rx) = watch::channel(false);
        let producer = Arc::new(producer);
        let task = tokio::spawn({
            let producer = producer.clone();
            async move { producer.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send_replace(true);
        task.await.unwrap();

        assert_eq!(producer.blocks_produced(), 1);
        assert_eq!(ledger.read().len(), 2);
    }
}
