//! # Data Routing
//!
//! Generic fetch-by-opaque-key with local authority, a bounded LRU+TTL
//! cache, and bounded retry over the gossip network. Independent of the
//! shard layout; the barter contract uses it as a fallback data plane for
//! `offer:<id>` lookups.

pub mod cache;
pub mod router;

pub use cache::TtlCache;
pub use router::{item_key, offer_key, user_key, DataRouter, RouterConfig, RouterError};
