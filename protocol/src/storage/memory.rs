//! In-process store backed by plain maps behind `parking_lot` locks.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{
    new_record_id, ItemFilter, OfferFilter, Store, StoreError, StoreResult, TransactionFilter,
};
use crate::barter::BarterOffer;
use crate::ledger::Transaction;
use crate::shard::{Item, ItemPatch, ShardId};

/// Volatile [`Store`]. Everything is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: RwLock<HashMap<ShardId, Vec<Item>>>,
    offers: RwLock<BTreeMap<String, BarterOffer>>,
    transactions: RwLock<Vec<Transaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn save_item(&self, shard: ShardId, mut item: Item) -> StoreResult<Item> {
        item.id = new_record_id();
        item.shard_id = shard;
        self.items
            .write()
            .entry(shard)
            .or_default()
            .push(item.clone());
        Ok(item)
    }

    fn get_items_in_shard(&self, shard: ShardId, filter: &ItemFilter) -> StoreResult<Vec<Item>> {
        Ok(self
            .items
            .read()
            .get(&shard)
            .map(|items| items.iter().filter(|i| filter.matches(i)).cloned().collect())
            .unwrap_or_default())
    }

    fn update_item(&self, shard: ShardId, id: &str, patch: &ItemPatch) -> StoreResult<Item> {
        let mut items = self.items.write();
        let item = items
            .get_mut(&shard)
            .and_then(|items| items.iter_mut().find(|i| i.id == id))
            .ok_or_else(|| StoreError::NotFound(format!("item {id} in shard {shard}")))?;
        patch.apply(item);
        Ok(item.clone())
    }

    fn save_offer(&self, offer: &BarterOffer) -> StoreResult<()> {
        self.offers.write().insert(offer.id.clone(), offer.clone());
        Ok(())
    }

    fn get_offer(&self, id: &str) -> StoreResult<Option<BarterOffer>> {
        Ok(self.offers.read().get(id).cloned())
    }

    fn get_all_offers(&self, filter: &OfferFilter) -> StoreResult<Vec<BarterOffer>> {
        Ok(self
            .offers
            .read()
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect())
    }

    fn save_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        self.transactions.write().push(tx.clone());
        Ok(())
    }

    fn get_transactions(&self, filter: &TransactionFilter) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransactionKind;
    use crate::shard::{ItemStatus, NewItem};

    fn item(user: &str) -> Item {
        let new = NewItem::new("lamp", "desk lamp");
        Item {
            id: String::new(),
            user_id: user.into(),
            name: new.name,
            description: new.description,
            images: new.images,
            status: ItemStatus::Available,
            shard_id: ShardId::new(0),
            created_at: 0,
        }
    }

    #[test]
    fn save_assigns_distinct_ids() {
        let store = MemoryStore::new();
        let a = store.save_item(ShardId::new(3), item("alice")).unwrap();
        let b = store.save_item(ShardId::new(3), item("alice")).unwrap();
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.shard_id, ShardId::new(3));
    }

    #[test]
    fn filter_by_user_and_status() {
        let store = MemoryStore::new();
        let shard = ShardId::new(7);
        let a = store.save_item(shard, item("alice")).unwrap();
        store.save_item(shard, item("bob")).unwrap();
        store
            .update_item(shard, &a.id, &ItemPatch::status(ItemStatus::Exchanged))
            .unwrap();

        assert_eq!(store.get_items_in_shard(shard, &ItemFilter::user("alice")).unwrap().len(), 1);
        let available = store
            .get_items_in_shard(shard, &ItemFilter::status(ItemStatus::Available))
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].user_id, "bob");
    }

    #[test]
    fn update_missing_item_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_item(ShardId::new(1), "nope", &ItemPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn transactions_filter_by_kind() {
        let store = MemoryStore::new();
        store
            .save_transaction(&Transaction::reward("alice", 10, 1))
            .unwrap();
        let filter = TransactionFilter {
            kind: Some(TransactionKind::Reward),
            ..TransactionFilter::default()
        };
        assert_eq!(store.get_transactions(&filter).unwrap().len(), 1);
        let filter = TransactionFilter {
            from: Some("alice".into()),
            ..TransactionFilter::default()
        };
        assert!(store.get_transactions(&filter).unwrap().is_empty());
    }
}
