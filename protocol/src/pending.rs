//! # Request Correlation
//!
//! Outbound requests that expect an answer over gossip (shard data, keyed
//! data) park a oneshot sender here under a random request id. The matching
//! response resolves it; a timeout removes it.
//!
//! ```text
//! register() ─▶ id, rx ── broadcast request{id} ──▶ peers
//!                                                    │
//! resolve(id, value) ◀── response{id} ───────────────┘
//! wait(id, rx, timeout) ─▶ Ok(value) | Err(timed out, entry removed)
//! ```
//!
//! The entry leaves the table before anything is delivered, both on
//! resolve and on timeout. A response that arrives after its deadline, or a
//! second response for the same id, finds nothing and is dropped.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::config::REQUEST_ID_BYTES;
use crate::crypto::random_hex;

/// The request was not answered in time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request {0} timed out")]
pub struct RequestTimedOut(pub String);

/// Table of in-flight requests awaiting a `T`.
#[derive(Debug)]
pub struct PendingRequests<T> {
    waiting: DashMap<String, oneshot::Sender<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            waiting: DashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a request under a fresh random id.
    pub fn register(&self) -> (String, oneshot::Receiver<T>) {
        let id = random_hex(REQUEST_ID_BYTES);
        let rx = self.register_with_id(id.clone());
        (id, rx)
    }

    /// Opens a request under a caller-chosen id, replacing any request
    /// already waiting under it.
    pub fn register_with_id(&self, id: String) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        rx
    }

    /// Delivers `value` to the request `id`. Returns `false` when no such
    /// request is waiting (unknown, already answered, or timed out).
    pub fn resolve(&self, id: &str, value: T) -> bool {
        match self.waiting.remove(id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Waits for the answer to `id` for at most `timeout`.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, RequestTimedOut> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Deadline hit, or the sender was replaced and dropped.
            Ok(Err(_)) | Err(_) => {
                self.waiting.remove(id);
                Err(RequestTimedOut(id.to_string()))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
