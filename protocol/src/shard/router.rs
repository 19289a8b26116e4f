//! Local-vs-remote arbitration for item data.
//!
//! Every mutation is written through the store. Mutations on a shard this
//! node owns also update the in-memory shard view; mutations on any other
//! shard are announced with `ITEM_ADDED` / `ITEM_STATUS_UPDATED` so the
//! owners can update theirs.
//!
//! Reads of a remote shard ask its owners with `SHARD_DATA_REQUEST` and
//! take the first `SHARD_DATA_RESPONSE` carrying the same request id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, trace, warn};

use super::{local_shards, shard_of, Item, ItemPatch, ItemStatus, NewItem, ShardId};
use crate::config;
use crate::ledger::{Blockchain, LedgerError, Transaction, TransactionKind};
use crate::network::{
    Connection, GossipNetwork, ItemAdded, ItemStatusUpdated, Message, ShardDataRequest,
    ShardDataResponse,
};
use crate::node::publish_transaction;
use crate::pending::PendingRequests;
use crate::storage::{ItemFilter, Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Timeout of a single `SHARD_DATA_REQUEST`.
    pub request_timeout: Duration,
    /// Per-shard timeout while listing the whole market.
    pub scan_timeout: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            request_timeout: config::SHARD_REQUEST_TIMEOUT,
            scan_timeout: config::SHARD_SCAN_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("no owner of shard {shard} answered in time")]
    RemoteTimeout { shard: ShardId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct ShardRouter {
    local_shards: [ShardId; 2],
    store: Arc<dyn Store>,
    network: Arc<GossipNetwork>,
    ledger: Arc<RwLock<Blockchain>>,
    /// Items of the local shards, keyed by item id.
    view: DashMap<ShardId, BTreeMap<String, Item>>,
    pending: PendingRequests<Vec<Item>>,
    config: ShardConfig,
}

impl ShardRouter {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<GossipNetwork>,
        ledger: Arc<RwLock<Blockchain>>,
        config: ShardConfig,
    ) -> Self {
        let local_shards = local_shards(network.node_id());
        info!(shards = ?local_shards.map(|s| s.to_string()), "local shards assigned");
        Self {
            local_shards,
            store,
            network,
            ledger,
            view: DashMap::new(),
            pending: PendingRequests::new(),
            config,
        }
    }

    pub fn local_shards(&self) -> [ShardId; 2] {
        self.local_shards
    }

    pub fn is_local(&self, shard: ShardId) -> bool {
        self.local_shards.contains(&shard)
    }

    // -- Mutations ----------------------------------------------------------

    /// Stores a new item for `user_id` in the user's shard and records an
    /// `ADD_ITEM` transaction.
    pub fn add_item(&self, user_id: &str, new_item: NewItem) -> Result<Item, ShardError> {
        let shard = shard_of(user_id);
        let item = self.store.save_item(
            shard,
            Item {
                id: String::new(),
                user_id: user_id.to_string(),
                name: new_item.name,
                description: new_item.description,
                images: new_item.images,
                status: ItemStatus::Available,
                shard_id: shard,
                created_at: chrono::Utc::now().timestamp_millis(),
            },
        )?;

        if self.is_local(shard) {
            self.upsert_view(item.clone());
        } else {
            self.network.broadcast(&Message::ItemAdded(ItemAdded {
                shard_id: shard,
                item: item.clone(),
            }));
        }

        publish_transaction(
            &self.ledger,
            &self.network,
            Transaction::new(
                TransactionKind::AddItem,
                user_id,
                None,
                json!({ "itemId": item.id, "name": item.name, "shardId": shard }),
            ),
        )?;
        info!(item = %item.id, user = user_id, shard = %shard, "item added");
        Ok(item)
    }

    /// Sets the status of `item_id`, owned by `user_id`.
    ///
    /// On a remote shard the item may be unknown to our store; the update is
    /// still announced to the owners.
    pub fn update_item_status(
        &self,
        user_id: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), ShardError> {
        let shard = shard_of(user_id);
        let stored = match self.store.update_item(shard, item_id, &ItemPatch::status(status)) {
            Ok(item) => Some(item),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if self.is_local(shard) {
            let in_view = self.set_view_status(shard, item_id, status);
            match stored {
                Some(item) => self.upsert_view(item),
                None if !in_view => return Err(StoreError::NotFound(item_id.to_string()).into()),
                None => {}
            }
        } else {
            self.network.broadcast(&Message::ItemStatusUpdated(ItemStatusUpdated {
                shard_id: shard,
                item_id: item_id.to_string(),
                status,
            }));
        }
        debug!(item = item_id, status = %status, shard = %shard, "item status updated");
        Ok(())
    }

    // -- Reads --------------------------------------------------------------

    /// Items owned by `user_id`. For a remote shard with nothing in our
    /// store, the shard owners are asked; a timeout yields an empty list.
    pub async fn get_user_items(&self, user_id: &str) -> Result<Vec<Item>, ShardError> {
        let shard = shard_of(user_id);
        let filter = ItemFilter::user(user_id);
        if self.is_local(shard) {
            return self.local_items(shard, &filter);
        }

        let stored = self.store.get_items_in_shard(shard, &filter)?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        match self.request_shard_data(shard).await {
            Ok(items) => Ok(items.into_iter().filter(|i| filter.matches(i)).collect()),
            Err(ShardError::RemoteTimeout { .. }) => {
                debug!(user = user_id, shard = %shard, "shard owners did not answer");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Asks the owners of `shard` for its items.
    pub async fn request_shard_data(&self, shard: ShardId) -> Result<Vec<Item>, ShardError> {
        self.request_shard_data_within(shard, self.config.request_timeout)
            .await
    }

    async fn request_shard_data_within(
        &self,
        shard: ShardId,
        timeout: Duration,
    ) -> Result<Vec<Item>, ShardError> {
        let (request_id, rx) = self.pending.register();
        self.network
            .broadcast(&Message::ShardDataRequest(ShardDataRequest {
                shard_id: shard,
                request_id: request_id.clone(),
            }));
        self.pending
            .wait(&request_id, rx, timeout)
            .await
            .map_err(|_| ShardError::RemoteTimeout { shard })
    }

    /// Every available item on the market: local shards plus a concurrent,
    /// best-effort scan of all remote shards. Shards that fail to answer are
    /// left out.
    pub async fn get_all_available_items(&self) -> Vec<Item> {
        let available = ItemFilter::status(ItemStatus::Available);
        let mut items: BTreeMap<String, Item> = BTreeMap::new();

        for shard in self.local_shards {
            match self.local_items(shard, &available) {
                Ok(local) => items.extend(local.into_iter().map(|i| (i.id.clone(), i))),
                Err(e) => warn!(shard = %shard, error = %e, "cannot read local shard"),
            }
        }

        if self.network.connection_count() > 0 {
            let remote: Vec<ShardId> = ShardId::all().filter(|s| !self.is_local(*s)).collect();
            let timeout = self.config.scan_timeout;
            let results = join_all(
                remote
                    .iter()
                    .map(|shard| self.request_shard_data_within(*shard, timeout)),
            )
            .await;

            let mut answered = 0;
            for result in results {
                if let Ok(found) = result {
                    answered += 1;
                    items.extend(
                        found
                            .into_iter()
                            .filter(|i| available.matches(i))
                            .map(|i| (i.id.clone(), i)),
                    );
                }
            }
            debug!(answered, asked = remote.len(), "market scan finished");
        }

        items.into_values().collect()
    }

    /// Store contents of a local shard overlaid with the in-memory view.
    fn local_items(&self, shard: ShardId, filter: &ItemFilter) -> Result<Vec<Item>, ShardError> {
        let mut merged: BTreeMap<String, Item> = self
            .store
            .get_items_in_shard(shard, &ItemFilter::default())?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        if let Some(view) = self.view.get(&shard) {
            merged.extend(view.iter().map(|(id, i)| (id.clone(), i.clone())));
        }
        Ok(merged.into_values().filter(|i| filter.matches(i)).collect())
    }

    fn upsert_view(&self, item: Item) {
        self.view
            .entry(item.shard_id)
            .or_default()
            .insert(item.id.clone(), item);
    }

    fn set_view_status(&self, shard: ShardId, item_id: &str, status: ItemStatus) -> bool {
        match self.view.get_mut(&shard) {
            Some(mut items) => match items.get_mut(item_id) {
                Some(item) => {
                    item.status = status;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    // -- Handlers -----------------------------------------------------------

    /// Applies a peer's `ITEM_ADDED` if we own the shard.
    pub fn handle_item_added(&self, msg: ItemAdded) -> bool {
        if !self.is_local(msg.shard_id) {
            trace!(shard = %msg.shard_id, "ignoring item for foreign shard");
            return false;
        }
        debug!(item = %msg.item.id, shard = %msg.shard_id, "item added by peer");
        self.upsert_view(msg.item);
        true
    }

    /// Applies a peer's `ITEM_STATUS_UPDATED` if we own the shard.
    pub fn handle_item_status_updated(&self, msg: ItemStatusUpdated) -> bool {
        if !self.is_local(msg.shard_id) {
            trace!(shard = %msg.shard_id, "ignoring status update for foreign shard");
            return false;
        }
        if self.set_view_status(msg.shard_id, &msg.item_id, msg.status) {
            return true;
        }
        match self
            .store
            .update_item(msg.shard_id, &msg.item_id, &ItemPatch::status(msg.status))
        {
            Ok(item) => {
                self.upsert_view(item);
                true
            }
            Err(e) => {
                debug!(item = %msg.item_id, error = %e, "status update for unknown item");
                false
            }
        }
    }

    /// Answers `SHARD_DATA_REQUEST` for shards we own; stays silent otherwise.
    pub fn handle_shard_data_request(&self, conn: &Connection, request: ShardDataRequest) {
        if !self.is_local(request.shard_id) {
            return;
        }
        let items = match self.local_items(request.shard_id, &ItemFilter::default()) {
            Ok(items) => items,
            Err(e) => {
                warn!(shard = %request.shard_id, error = %e, "cannot serve shard data");
                return;
            }
        };
        debug!(shard = %request.shard_id, items = items.len(), "serving shard data");
        conn.send(&Message::ShardDataResponse(ShardDataResponse {
            request_id: request.request_id,
            data: items,
            found: true,
        }));
    }

    /// Resolves the matching pending request; late or duplicate responses
    /// are dropped.
    pub fn handle_shard_data_response(&self, response: ShardDataResponse) -> bool {
        if !response.found {
            return false;
        }
        self.pending.resolve(&response.request_id, response.data)
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("local_shards", &self.local_shards)
            .field("pending", &self.pending.len())
            .finish()
    }
}
