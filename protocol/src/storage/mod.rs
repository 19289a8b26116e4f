//! # Storage Module
//!
//! The persistence adapter the core writes through. The node only needs
//! equality filters and store-assigned identifiers, so any key/document
//! store fits behind [`Store`]. Two backends ship with the crate:
//!
//! ```text
//! memory.rs: MemoryStore, process-local maps (tests, --in-memory)
//! db.rs    : SledStore, sled trees with JSON values
//! ```
//!
//! Items are partitioned by shard. Offers and transactions are global.

pub mod db;
pub mod memory;

use serde::{Deserialize, Serialize};

use crate::barter::{BarterOffer, OfferStatus};
use crate::ledger::{Transaction, TransactionKind};
use crate::shard::{Item, ItemPatch, ItemStatus, ShardId};

pub use db::SledStore;
pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Equality filter over items. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFilter {
    pub user_id: Option<String>,
    pub status: Option<ItemStatus>,
}

impl ItemFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn status(status: ItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.user_id.as_ref().map_or(true, |u| &item.user_id == u)
            && self.status.map_or(true, |s| item.status == s)
    }
}

/// Equality filter over offers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferFilter {
    pub creator: Option<String>,
    pub status: Option<OfferStatus>,
    pub shard_id: Option<ShardId>,
}

impl OfferFilter {
    pub fn matches(&self, offer: &BarterOffer) -> bool {
        self.creator.as_ref().map_or(true, |c| &offer.creator == c)
            && self.status.map_or(true, |s| offer.status == s)
            && self.shard_id.map_or(true, |s| offer.shard_id == s)
    }
}

/// Equality filter over transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub kind: Option<TransactionKind>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.from.as_ref().map_or(true, |f| tx.from.as_ref() == Some(f))
            && self.to.as_ref().map_or(true, |t| tx.to.as_ref() == Some(t))
            && self.kind.map_or(true, |k| tx.kind == k)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable record store consumed by the shard router, the barter contract,
/// and the node runtime.
pub trait Store: Send + Sync {
    /// Persists `item` under `shard`, assigning a fresh id. Returns the stored record.
    fn save_item(&self, shard: ShardId, item: Item) -> StoreResult<Item>;

    fn get_items_in_shard(&self, shard: ShardId, filter: &ItemFilter) -> StoreResult<Vec<Item>>;

    /// Applies `patch` to the item `id` in `shard`. Fails with `NotFound` if absent.
    fn update_item(&self, shard: ShardId, id: &str, patch: &ItemPatch) -> StoreResult<Item>;

    /// Inserts or replaces an offer.
    fn save_offer(&self, offer: &BarterOffer) -> StoreResult<()>;

    fn get_offer(&self, id: &str) -> StoreResult<Option<BarterOffer>>;

    fn get_all_offers(&self, filter: &OfferFilter) -> StoreResult<Vec<BarterOffer>>;

    fn save_transaction(&self, tx: &Transaction) -> StoreResult<()>;

    /// Transactions matching `filter`, in insertion order.
    fn get_transactions(&self, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>>;
}

/// Identifier for a newly stored item.
pub(crate) fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
