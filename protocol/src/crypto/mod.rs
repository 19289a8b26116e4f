//! # Hashing & Identifiers
//!
//! Thin wrappers around the hash functions the node relies on. Nothing here
//! is security critical in the signing sense (signatures are delegated to a
//! pluggable verifier, see [`crate::ledger::verifier`]); these functions
//! exist so that every subsystem hashes the same bytes the same way.
//!
//! - **SHA-256** for block hashes.
//! - **MD5** for shard assignment, where only the distribution matters.
//! - **BLAKE3** for the relay deduplication cache.

pub mod hash;

pub use hash::{blake3_hash, md5_digest, md5_hex, random_hex, sha256_hex};
