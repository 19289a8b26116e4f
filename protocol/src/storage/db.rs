//! # SledStore: Persistent Storage Engine
//!
//! [`Store`] implementation on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                          | Value                 |
//! |----------------|------------------------------|-----------------------|
//! | `items`        | `shard` (1B) ‖ `id` (UTF-8)  | `json(Item)`          |
//! | `offers`       | `id` (UTF-8)                 | `json(BarterOffer)`   |
//! | `transactions` | sequence (8B BE)             | `json(Transaction)`   |
//!
//! The shard byte leads the item key, so a prefix scan returns one shard.
//! Transaction keys come from sled's monotonic id generator, stored big
//! endian so that lexicographic order equals insertion order.
//!
//! Values are JSON rather than bincode because transaction payloads are
//! free-form `serde_json::Value`s, which bincode cannot decode.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

use super::{
    new_record_id, ItemFilter, OfferFilter, Store, StoreError, StoreResult, TransactionFilter,
};
use crate::barter::BarterOffer;
use crate::ledger::Transaction;
use crate::shard::{Item, ItemPatch, ShardId};

/// Persistent [`Store`] on sled.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    items: Tree,
    offers: Tree,
    transactions: Tree,
}

impl SledStore {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// A database that is deleted when the handle drops. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            items: db.open_tree("items")?,
            offers: db.open_tree("offers")?,
            transactions: db.open_tree("transactions")?,
            db,
        })
    }

    /// Flushes dirty pages to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn item_key(shard: ShardId, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + id.len());
        key.push(shard.index());
        key.extend_from_slice(id.as_bytes());
        key
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

impl Store for SledStore {
    fn save_item(&self, shard: ShardId, mut item: Item) -> StoreResult<Item> {
        item.id = new_record_id();
        item.shard_id = shard;
        self.items
            .insert(Self::item_key(shard, &item.id), encode(&item)?)?;
        Ok(item)
    }

    fn get_items_in_shard(&self, shard: ShardId, filter: &ItemFilter) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        for entry in self.items.scan_prefix([shard.index()]) {
            let (_, value) = entry?;
            let item: Item = decode(&value)?;
            if filter.matches(&item) {
                items.push(item);
            }
        }
        Ok(items)
    }

    fn update_item(&self, shard: ShardId, id: &str, patch: &ItemPatch) -> StoreResult<Item> {
        let key = Self::item_key(shard, id);
        let bytes = self
            .items
            .get(&key)?
            .ok_or_else(|| StoreError::NotFound(format!("item {id} in shard {shard}")))?;
        let mut item: Item = decode(&bytes)?;
        patch.apply(&mut item);
        self.items.insert(key, encode(&item)?)?;
        Ok(item)
    }

    fn save_offer(&self, offer: &BarterOffer) -> StoreResult<()> {
        self.offers.insert(offer.id.as_bytes(), encode(offer)?)?;
        Ok(())
    }

    fn get_offer(&self, id: &str) -> StoreResult<Option<BarterOffer>> {
        self.offers
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn get_all_offers(&self, filter: &OfferFilter) -> StoreResult<Vec<BarterOffer>> {
        let mut offers = Vec::new();
        for entry in self.offers.iter() {
            let (_, value) = entry?;
            let offer: BarterOffer = decode(&value)?;
            if filter.matches(&offer) {
                offers.push(offer);
            }
        }
        Ok(offers)
    }

    fn save_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        let seq = self.db.generate_id()?;
        self.transactions.insert(seq.to_be_bytes(), encode(tx)?)?;
        Ok(())
    }

    fn get_transactions(&self, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>> {
        let mut txs = Vec::new();
        for entry in self.transactions.iter() {
            let (_, value) = entry?;
            let tx: Transaction = decode(&value)?;
            if filter.matches(&tx) {
                txs.push(tx);
            }
        }
        Ok(txs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barter::{BarterOffer, OfferStatus};
    use crate::ledger::TransactionKind;
    use crate::shard::ItemStatus;

    fn item(user: &str) -> Item {
        Item {
            id: String::new(),
            user_id: user.into(),
            name: "bike".into(),
            description: "road bike".into(),
            images: vec!["bike.jpg".into()],
            status: ItemStatus::Available,
            shard_id: ShardId::new(0),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn open_persistent_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = ShardId::new(9);
        let saved = {
            let store = SledStore::open(dir.path()).expect("open");
            let saved = store.save_item(shard, item("alice")).unwrap();
            store.flush().unwrap();
            saved
        };

        let reopened = SledStore::open(dir.path()).expect("reopen");
        let items = reopened
            .get_items_in_shard(shard, &ItemFilter::default())
            .unwrap();
        assert_eq!(items, vec![saved]);
    }

    #[test]
    fn items_are_partitioned_by_shard() {
        let store = SledStore::open_temporary().unwrap();
        store.save_item(ShardId::new(1), item("alice")).unwrap();
        store.save_item(ShardId::new(2), item("alice")).unwrap();
        store.save_item(ShardId::new(2), item("bob")).unwrap();

        let shard2 = store
            .get_items_in_shard(ShardId::new(2), &ItemFilter::default())
            .unwrap();
        assert_eq!(shard2.len(), 2);
        let bob = store
            .get_items_in_shard(ShardId::new(2), &ItemFilter::user("bob"))
            .unwrap();
        assert_eq!(bob.len(), 1);
    }

    #[test]
    fn update_item_status() {
        let store = SledStore::open_temporary().unwrap();
        let shard = ShardId::new(4);
        let saved = store.save_item(shard, item("alice")).unwrap();
        let updated = store
            .update_item(shard, &saved.id, &ItemPatch::status(ItemStatus::Pending))
            .unwrap();
        assert_eq!(updated.status, ItemStatus::Pending);
        assert!(matches!(
            store.update_item(ShardId::new(5), &saved.id, &ItemPatch::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn offers_round_trip_and_filter() {
        let store = SledStore::open_temporary().unwrap();
        let mut offer = BarterOffer::sample("o1", "alice");
        store.save_offer(&offer).unwrap();
        offer.status = OfferStatus::Cancelled;
        store.save_offer(&offer).unwrap();

        assert_eq!(store.get_offer("o1").unwrap().unwrap().status, OfferStatus::Cancelled);
        assert!(store.get_offer("o2").unwrap().is_none());
        let open = OfferFilter {
            status: Some(OfferStatus::Open),
            ..OfferFilter::default()
        };
        assert!(store.get_all_offers(&open).unwrap().is_empty());
    }

    #[test]
    fn transactions_keep_insertion_order() {
        let store = SledStore::open_temporary().unwrap();
        for amount in 1..=3 {
            store
                .save_transaction(&Transaction::reward("v", amount, amount as i64))
                .unwrap();
        }
        let filter = TransactionFilter {
            kind: Some(TransactionKind::Reward),
            ..TransactionFilter::default()
        };
        let txs = store.get_transactions(&filter).unwrap();
        let stamps: Vec<i64> = txs.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }
}
