// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Barter Protocol: Core Library
//!
//! A peer-to-peer ledger for bartering goods. Nodes gossip JSON envelopes
//! over persistent connections, keep a stake-weighted append-only chain of
//! barter transactions, partition item data into 256 shards, and drive
//! every offer through a small, guarded lifecycle.
//!
//! ## Architecture
//!
//! - **network**: newline-delimited JSON gossip: handshake, liveness,
//!   discovery, relay deduplication.
//! - **ledger**: blocks, transactions, validator registry, fork choice,
//!   compression of old blocks.
//! - **producer**: periodic stake-weighted block production.
//! - **shard**: `MD5(key)` sharding, local shard ownership, item routing.
//! - **routing**: keyed remote lookups behind a TTL/LRU cache.
//! - **barter**: offers, reputation, and the contract that guards them.
//! - **storage**: the persistence adapter, in memory or on sled.
//! - **node**: the runtime that owns all of the above.
//! - **config**: protocol constants.
//!
//! ## Design Philosophy
//!
//! 1. One owner per table. The node holds every subsystem; subsystems hold
//!    each other through `Arc`, never through globals.
//! 2. Locks are short. Nothing awaits while holding one.
//! 3. Gossip is best effort. Fork choice reconciles the ledger; offers are
//!    last writer wins.

pub mod barter;
pub mod config;
pub mod crypto;
pub mod ledger;
pub mod network;
pub mod node;
pub mod pending;
pub mod producer;
pub mod routing;
pub mod shard;
pub mod storage;

pub use node::{BarterNode, NodeConfig, NodeStatus};
