//! # Blockchain
//!
//! The node's replicated ledger: the block list, the pending pool, and the
//! validator registry, plus the rules that decide what may enter each.
//!
//! ## Remote blocks
//!
//! ```text
//! received blocks ──sort by timestamp──▶ latest
//!   latest.hash == tip.hash           → Unchanged
//!   latest.previousHash == tip.hash   → validate, append   → Appended
//!   only one block received           → ask for full chain → NeedFullChain
//!   full chain valid ∧ fork choice    → replace            → Replaced
//!   anything else                     → Rejected
//! ```
//!
//! Rejections are normal in a gossip network and are reported as values,
//! not errors.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::block::Block;
use super::fork_choice::{self, ForkChoice};
use super::transaction::{Transaction, TransactionKind};
use super::validators::ValidatorRegistry;
use super::verifier::{AcceptAll, SignatureVerifier};
use super::LedgerError;
use crate::shard::shard_of;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Units paid to the producer of each block.
    pub mining_reward: u64,
    /// Most recent blocks kept uncompressed.
    pub retention_window: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mining_reward: crate::config::MINING_REWARD,
            retention_window: crate::config::RETENTION_WINDOW,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What [`Blockchain::reconcile`] did with a batch of remote blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainUpdate {
    /// The remote tip is our tip.
    Unchanged,
    /// The remote tip extended ours and was appended. Worth relaying.
    Appended(Block),
    /// The remote chain won fork choice and replaced ours. `adopted` holds
    /// the blocks past the fork point, which we did not have before.
    Replaced { length: usize, adopted: Vec<Block> },
    /// The remote tip does not link to ours; the sender's full chain is needed.
    NeedFullChain,
    /// Invalid or losing chain.
    Rejected(String),
}

/// Point-in-time summary of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_length: usize,
    pub is_valid: bool,
    pub pending_transactions: usize,
    pub validators: Vec<(String, u64)>,
}

// ---------------------------------------------------------------------------
// Blockchain
// ---------------------------------------------------------------------------

pub struct Blockchain {
    config: LedgerConfig,
    chain: Vec<Block>,
    pending: Vec<Transaction>,
    validators: ValidatorRegistry,
    verifier: Arc<dyn SignatureVerifier>,
    /// Digests of `STAKE` transactions already credited to the registry.
    applied_stakes: HashSet<String>,
}

impl Blockchain {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_verifier(config, Arc::new(AcceptAll))
    }

    pub fn with_verifier(config: LedgerConfig, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            config,
            chain: vec![Block::genesis()],
            pending: Vec::new(),
            validators: ValidatorRegistry::new(),
            verifier,
            applied_stakes: HashSet::new(),
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn chain(&self) -> &[Block] {
        &self.chain
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Never true: the genesis block is always present.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn latest_block(&self) -> &Block {
        // The chain is created with genesis and never shrinks below it.
        &self.chain[self.chain.len() - 1]
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn validators(&self) -> &ValidatorRegistry {
        &self.validators
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            chain_length: self.chain.len(),
            is_valid: self.is_valid(),
            pending_transactions: self.pending.len(),
            validators: self
                .validators
                .iter()
                .map(|(v, s)| (v.to_string(), s))
                .collect(),
        }
    }

    // -- Transactions -------------------------------------------------------

    /// Validates `tx`, stamps its shard, and appends it to the pending pool.
    ///
    /// Returns `Ok(false)` when an identical transaction is already pending.
    pub fn add_transaction(&mut self, mut tx: Transaction) -> Result<bool, LedgerError> {
        let shard = match tx.from.as_deref() {
            Some(from) if !from.is_empty() => shard_of(from),
            _ => return Err(LedgerError::MissingField("from")),
        };
        if tx.kind == TransactionKind::Reward {
            return Err(LedgerError::InvalidTransaction(
                "reward transactions are created by block production only".into(),
            ));
        }
        if tx.kind.requires_counterparty() && tx.to.as_deref().map_or(true, str::is_empty) {
            return Err(LedgerError::MissingField("to"));
        }
        if !self.verifier.verify(&tx) {
            return Err(LedgerError::InvalidSignature);
        }

        tx.shard_id = Some(shard);
        let digest = tx.digest();
        if self.pending.iter().any(|p| p.digest() == digest) {
            return Ok(false);
        }
        debug!(kind = %tx.kind, shard = ?tx.shard_id, "transaction added to pending pool");
        self.pending.push(tx);
        Ok(true)
    }

    // -- Validators ---------------------------------------------------------

    /// Raises a validator's stake in the local registry only.
    pub fn add_validator(&mut self, validator: &str, stake: u64) -> u64 {
        self.validators.add_stake(validator, stake)
    }

    /// Raises `validator`'s stake and queues a `STAKE` transaction so that
    /// peers learn it once the transaction is mined.
    pub fn stake(&mut self, validator: &str, amount: u64) -> Result<Transaction, LedgerError> {
        let mut queued = Transaction::stake(validator, amount);
        // Stamp the shard up front so the digest matches the pooled copy.
        queued.shard_id = Some(shard_of(validator));
        self.add_transaction(queued.clone())?;
        self.applied_stakes.insert(queued.digest());
        self.validators.add_stake(validator, amount);
        info!(validator, amount, total = self.validators.stake_of(validator), "stake increased");
        Ok(queued)
    }

    /// Draws the next producer from the registry with the thread RNG.
    pub fn select_validator(&self) -> Option<String> {
        self.select_validator_with(&mut rand::thread_rng())
    }

    pub fn select_validator_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        self.validators.select(rng).map(str::to_string)
    }

    // -- Block production ---------------------------------------------------

    /// Seals every pending transaction into a block produced by `producer`.
    ///
    /// The pool is then reset to the producer's reward transaction and old
    /// blocks are compressed.
    pub fn mine_block(&mut self, producer: &str) -> Result<Block, LedgerError> {
        if self.validators.stake_of(producer) == 0 {
            return Err(LedgerError::InsufficientStake(producer.to_string()));
        }

        let block = Block::new(
            self.latest_block(),
            self.pending.clone(),
            Some(producer.to_string()),
        )?;
        self.chain.push(block.clone());
        self.pending = vec![Transaction::reward(
            producer,
            self.config.mining_reward,
            block.timestamp,
        )];

        info!(
            height = self.chain.len() - 1,
            txs = block.transactions.len(),
            producer,
            "block mined"
        );
        self.compress_old_blocks();
        Ok(block)
    }

    // -- Validation ---------------------------------------------------------

    /// `block` has a correct hash and links to `previous`.
    pub fn is_valid_new_block(block: &Block, previous: &Block) -> bool {
        if block.previous_hash != previous.hash {
            debug!(expected = %previous.hash, got = %block.previous_hash, "block does not link");
            return false;
        }
        if !block.has_valid_hash() {
            debug!(hash = %block.hash, "block hash mismatch");
            return false;
        }
        true
    }

    /// `chain` starts at our genesis and every block validates against its predecessor.
    pub fn is_chain_valid(chain: &[Block]) -> bool {
        let Some(first) = chain.first() else {
            return false;
        };
        let genesis = Block::genesis();
        if first.hash != genesis.hash || !first.has_valid_hash() {
            return false;
        }
        chain
            .windows(2)
            .all(|pair| Self::is_valid_new_block(&pair[1], &pair[0]))
    }

    pub fn is_valid(&self) -> bool {
        Self::is_chain_valid(&self.chain)
    }

    // -- Remote blocks ------------------------------------------------------

    /// Appends a single block announced by a peer if it extends our tip.
    pub fn append_block(&mut self, block: Block) -> Result<(), LedgerError> {
        if !Self::is_valid_new_block(&block, self.latest_block()) {
            return Err(LedgerError::InvalidBlock(format!(
                "block {} does not extend tip {}",
                block.hash,
                self.latest_block().hash
            )));
        }
        self.absorb(std::slice::from_ref(&block));
        self.chain.push(block);
        self.compress_old_blocks();
        Ok(())
    }

    /// Applies a batch of blocks received from a peer.
    pub fn reconcile(&mut self, mut received: Vec<Block>) -> ChainUpdate {
        received.sort_by_key(|b| b.timestamp);
        let Some(latest) = received.last() else {
            return ChainUpdate::Rejected("empty block list".into());
        };

        let tip = self.latest_block();
        if latest.hash == tip.hash {
            return ChainUpdate::Unchanged;
        }

        if latest.previous_hash == tip.hash {
            let block = latest.clone();
            return match self.append_block(block.clone()) {
                Ok(()) => {
                    info!(height = self.chain.len() - 1, hash = %block.hash, "appended remote block");
                    ChainUpdate::Appended(block)
                }
                Err(e) => ChainUpdate::Rejected(e.to_string()),
            };
        }

        if received.len() == 1 {
            debug!(remote_tip = %latest.hash, "remote tip does not link, full chain needed");
            return ChainUpdate::NeedFullChain;
        }

        self.replace_chain(received)
    }

    /// Replaces the local chain with `candidate` if it is valid and wins fork choice.
    pub fn replace_chain(&mut self, candidate: Vec<Block>) -> ChainUpdate {
        if !Self::is_chain_valid(&candidate) {
            warn!(length = candidate.len(), "received invalid chain");
            return ChainUpdate::Rejected("invalid chain".into());
        }
        if fork_choice::choose(&self.chain, &candidate) == ForkChoice::KeepCurrent {
            debug!(length = candidate.len(), "received chain loses fork choice");
            return ChainUpdate::Rejected("chain loses fork choice".into());
        }

        let included: HashSet<String> = candidate
            .iter()
            .flat_map(|b| b.decompressed_transactions().unwrap_or_default())
            .map(|tx| tx.digest())
            .collect();

        // Transactions only our discarded blocks carried go back to the pool.
        let fork_point = self
            .chain
            .iter()
            .zip(&candidate)
            .take_while(|(ours, theirs)| ours.hash == theirs.hash)
            .count();
        let discarded = &self.chain[fork_point..];
        let orphaned: Vec<Transaction> = discarded
            .iter()
            .flat_map(|b| b.decompressed_transactions().unwrap_or_default())
            .filter(|tx| tx.kind != TransactionKind::Reward && !included.contains(&tx.digest()))
            .collect();
        let void_rewards: HashSet<(Option<String>, i64)> = discarded
            .iter()
            .map(|b| (b.validator.clone(), b.timestamp))
            .collect();

        self.absorb(&candidate);
        let adopted = candidate[fork_point..].to_vec();
        self.chain = candidate;
        self.pending.retain(|tx| {
            let void = tx.kind == TransactionKind::Reward
                && void_rewards.contains(&(tx.to.clone(), tx.timestamp));
            !void && !included.contains(&tx.digest())
        });
        let requeued = orphaned.len();
        for tx in orphaned {
            let digest = tx.digest();
            if !self.pending.iter().any(|p| p.digest() == digest) {
                self.pending.push(tx);
            }
        }
        self.compress_old_blocks();

        info!(length = self.chain.len(), requeued, "replaced chain");
        ChainUpdate::Replaced {
            length: self.chain.len(),
            adopted,
        }
    }

    /// Credits unseen `STAKE` transactions in `blocks` and drops their
    /// transactions from the pending pool.
    fn absorb(&mut self, blocks: &[Block]) {
        for block in blocks {
            let txs = match block.decompressed_transactions() {
                Ok(txs) => txs,
                Err(e) => {
                    warn!(hash = %block.hash, error = %e, "cannot read block transactions");
                    continue;
                }
            };
            for tx in txs {
                let digest = tx.digest();
                self.pending.retain(|p| p.digest() != digest);
                if tx.kind != TransactionKind::Stake {
                    continue;
                }
                let (Some(validator), Some(amount)) = (tx.from.as_deref(), tx.amount()) else {
                    continue;
                };
                if self.applied_stakes.insert(digest) {
                    self.validators.add_stake(validator, amount);
                }
            }
        }
    }

    // -- Compression --------------------------------------------------------

    /// Compresses every non-genesis block older than the retention window.
    /// Returns how many blocks were compressed by this call.
    pub fn compress_old_blocks(&mut self) -> usize {
        let cutoff = self.chain.len().saturating_sub(self.config.retention_window);
        let mut compressed = 0;
        for block in self.chain.iter_mut().take(cutoff).skip(1) {
            match block.compress() {
                Ok(true) => compressed += 1,
                Ok(false) => {}
                Err(e) => warn!(hash = %block.hash, error = %e, "block compression failed"),
            }
        }
        if compressed > 0 {
            debug!(compressed, "compressed old blocks");
        }
        compressed
    }

    /// Inflates the block at `index` in place. Returns `false` if it was not compressed.
    pub fn decompress_block(&mut self, index: usize) -> Result<bool, LedgerError> {
        match self.chain.get_mut(index) {
            Some(block) => block.decompress(),
            None => Err(LedgerError::InvalidBlock(format!("no block at index {index}"))),
        }
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("length", &self.chain.len())
            .field("pending", &self.pending.len())
            .field("validators", &self.validators.len())
            .finish()
    }
}
