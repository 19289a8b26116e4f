//! Fetch-by-key across the network.
//!
//! Lookup order is local authoritative store, then the bounded cache, then
//! the network. Values fetched from peers are cached but never become
//! locally authoritative, so this node will not serve them onward.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::cache::TtlCache;
use crate::barter::BarterOffer;
use crate::config;
use crate::network::{Connection, DataRequest, DataResponse, GossipNetwork, Message};
use crate::pending::PendingRequests;
use crate::shard::Item;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Timeout of one network attempt.
    pub request_timeout: Duration,
    /// Attempts after the first.
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cache_capacity: config::CACHE_CAPACITY,
            cache_ttl: config::CACHE_TTL,
            request_timeout: config::DATA_REQUEST_TIMEOUT,
            retries: config::DATA_REQUEST_RETRIES,
            retry_delay: config::DATA_REQUEST_RETRY_DELAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("data {0} not found")]
    NotFound(String),

    #[error("data {key} has unexpected shape: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn offer_key(offer_id: &str) -> String {
    format!("offer:{offer_id}")
}

pub fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn item_key(item_id: &str) -> String {
    format!("item:{item_id}")
}

pub struct DataRouter {
    network: Arc<GossipNetwork>,
    local: DashMap<String, Value>,
    cache: Mutex<TtlCache<String, Value>>,
    pending: PendingRequests<Value>,
    config: RouterConfig,
}

impl DataRouter {
    pub fn new(network: Arc<GossipNetwork>, config: RouterConfig) -> Self {
        Self {
            network,
            local: DashMap::new(),
            cache: Mutex::new(TtlCache::new(config.cache_capacity, config.cache_ttl)),
            pending: PendingRequests::new(),
            config,
        }
    }

    // -- Local authority ----------------------------------------------------

    /// Makes `value` the locally authoritative copy of `key`.
    pub fn store_local(&self, key: impl Into<String>, value: Value) {
        self.local.insert(key.into(), value);
    }

    pub fn get_local(&self, key: &str) -> Option<Value> {
        self.local.get(key).map(|v| v.value().clone())
    }

    pub fn remove_local(&self, key: &str) -> Option<Value> {
        self.local.remove(key).map(|(_, v)| v)
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    // -- Fetch --------------------------------------------------------------

    /// Resolves `key` locally, from cache, or from the first peer that has it.
    ///
    /// Each network attempt waits the full request timeout unless a positive
    /// response arrives; after `1 + retries` failed attempts the key is
    /// reported [`RouterError::NotFound`].
    pub async fn request(&self, key: &str) -> Result<Value, RouterError> {
        if let Some(value) = self.get_local(key) {
            return Ok(value);
        }
        if let Some(value) = self.cache.lock().get(&key.to_string()) {
            trace!(key, "cache hit");
            return Ok(value);
        }

        let attempts = self.config.retries + 1;
        for attempt in 1..=attempts {
            if let Some(value) = self.fetch_once(key).await {
                self.cache.lock().insert(key.to_string(), value.clone());
                return Ok(value);
            }
            debug!(key, attempt, attempts, "data request timed out");
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        warn!(key, attempts, "data not found on any peer");
        Err(RouterError::NotFound(key.to_string()))
    }

    async fn fetch_once(&self, key: &str) -> Option<Value> {
        let (request_id, rx) = self.pending.register();
        let sent = self.network.broadcast(&Message::DataRequest(DataRequest {
            data_id: key.to_string(),
            requester_id: self.network.node_id().to_string(),
            request_id: request_id.clone(),
        }));
        trace!(key, request_id = %request_id, sent, "data request sent");
        self.pending
            .wait(&request_id, rx, self.config.request_timeout)
            .await
            .ok()
    }

    /// Fetches `key` and decodes it as `T`.
    pub async fn request_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, RouterError> {
        let value = self.request(key).await?;
        serde_json::from_value(value).map_err(|source| RouterError::Malformed {
            key: key.to_string(),
            source,
        })
    }

    pub async fn request_offer(&self, offer_id: &str) -> Result<BarterOffer, RouterError> {
        self.request_as(&offer_key(offer_id)).await
    }

    /// User records are opaque to the node.
    pub async fn request_user(&self, user_id: &str) -> Result<Value, RouterError> {
        self.request(&user_key(user_id)).await
    }

    pub async fn request_item(&self, item_id: &str) -> Result<Item, RouterError> {
        self.request_as(&item_key(item_id)).await
    }

    // -- Handlers -----------------------------------------------------------

    /// Answers a peer's `DATA_REQUEST` from the local store only.
    pub fn handle_request(&self, conn: &Connection, request: DataRequest) {
        let data = self.get_local(&request.data_id);
        debug!(
            key = %request.data_id,
            requester = %request.requester_id,
            found = data.is_some(),
            "answering data request"
        );
        conn.send(&Message::DataResponse(DataResponse {
            data_id: request.data_id,
            request_id: request.request_id,
            found: data.is_some(),
            data,
        }));
    }

    /// Resolves the matching pending request. Negative responses are ignored
    /// since another peer may still hold the key. Returns whether a waiter
    /// was resolved.
    pub fn handle_response(&self, response: DataResponse) -> bool {
        match (response.found, response.data) {
            (true, Some(data)) => self.pending.resolve(&response.request_id, data),
            _ => {
                trace!(key = %response.data_id, "ignoring negative data response");
                false
            }
        }
    }
}

impl std::fmt::Debug for DataRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataRouter")
            .field("local", &self.local.len())
            .field("pending", &self.pending.len())
            .field("config", &self.config)
            .finish()
    }
}
