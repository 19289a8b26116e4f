//! # Sharding
//!
//! The key space is split 256 ways by the first byte of `MD5(key)`, i.e.
//! the first two hex digits of the digest. Every node owns two shards for
//! its whole lifetime, picked from the MD5 of its own node id:
//!
//! ```text
//! MD5(node_id) = 3f a9 ...
//!                ^^ ^^
//!                |  └── second local shard "a9"
//!                └───── first local shard  "3f"
//! ```
//!
//! ## Architecture
//!
//! ```text
//! mod.rs   : ShardId, shard_of(), local_shards()
//! item.rs  : Item records and their status
//! router.rs: local-vs-remote arbitration and SHARD_DATA request correlation
//! ```

pub mod item;
pub mod router;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::md5_digest;

pub use item::{Item, ItemPatch, ItemStatus, NewItem};
pub use router::{ShardConfig, ShardError, ShardRouter};

// ---------------------------------------------------------------------------
// ShardId
// ---------------------------------------------------------------------------

/// One of the 256 shards. Rendered as two lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardId(u8);

impl ShardId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub fn index(self) -> u8 {
        self.0
    }

    /// The following shard, wrapping from `ff` to `00`.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// All 256 shard ids in ascending order.
    pub fn all() -> impl Iterator<Item = ShardId> {
        (0..=u8::MAX).map(ShardId)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// A shard id that is not exactly two hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid shard id: {0:?}")]
pub struct InvalidShardId(pub String);

impl FromStr for ShardId {
    type Err = InvalidShardId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidShardId(s.to_string()));
        }
        u8::from_str_radix(s, 16)
            .map(ShardId)
            .map_err(|_| InvalidShardId(s.to_string()))
    }
}

impl TryFrom<String> for ShardId {
    type Error = InvalidShardId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShardId> for String {
    fn from(id: ShardId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// The shard responsible for `key`. Pure: same key, same shard, on every node.
pub fn shard_of(key: &str) -> ShardId {
    ShardId(md5_digest(key.as_bytes())[0])
}

/// The two shards owned by the node with id `node_id`.
///
/// Taken from the first two bytes of `MD5(node_id)`. When both bytes are
/// equal the second shard becomes the following shard id, so the set always
/// has two members.
pub fn local_shards(node_id: &str) -> [ShardId; 2] {
    let digest = md5_digest(node_id.as_bytes());
    let first = ShardId(digest[0]);
    let mut second = ShardId(digest[1]);
    if second == first {
        second = first.next();
    }
    [first, second]
}
