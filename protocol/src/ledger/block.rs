//! # Block Structure
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  timestamp: i64        (ms since epoch)       │
//! │  previousHash: String  (hex SHA-256)          │
//! │  hash: String          (hex SHA-256)          │
//! │  nonce: u64                                   │
//! │  validator: Option<String>  (producer id)     │
//! ├───────────────────────────────────────────────┤
//! │  transactions: Vec<Transaction>               │
//! │  compressed: bool                             │
//! │  summary: Option<CompressedSummary>           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! `hash = SHA-256(previousHash ‖ timestamp ‖ JSON(transactions) ‖ nonce)`.
//! The producer id is not covered.
//!
//! ## Compression
//!
//! Blocks that fall out of the retention window have their transaction list
//! replaced by a [`CompressedSummary`]: a count, a per-kind histogram, and
//! `base64(zlib(JSON(transactions)))`. The JSON inflated from the payload is
//! byte-identical to the JSON the hash was computed over, so compressing a
//! block never changes its hash and a compressed chain still validates.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::transaction::{Transaction, TransactionKind};
use super::LedgerError;
use crate::config::{GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP};
use crate::crypto::sha256_hex;

/// What is left of a block's transactions after compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSummary {
    pub count: usize,
    pub types: BTreeMap<TransactionKind, usize>,
    /// `base64(zlib(JSON(transactions)))`.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub hash: String,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<CompressedSummary>,
}

impl Block {
    /// The shared chain root: fixed timestamp, no transactions, no producer.
    pub fn genesis() -> Self {
        let hash = calculate_hash(GENESIS_PREVIOUS_HASH, GENESIS_TIMESTAMP, "[]", 0);
        Self {
            timestamp: GENESIS_TIMESTAMP,
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash,
            nonce: 0,
            validator: None,
            compressed: false,
            summary: None,
        }
    }

    /// Builds a block on top of `previous`.
    ///
    /// The timestamp is the wall clock, bumped past `previous.timestamp` when
    /// needed so that sorting blocks by timestamp preserves chain order.
    pub fn new(
        previous: &Block,
        transactions: Vec<Transaction>,
        validator: Option<String>,
    ) -> Result<Self, LedgerError> {
        let timestamp = chrono::Utc::now()
            .timestamp_millis()
            .max(previous.timestamp + 1);
        let tx_json = serde_json::to_string(&transactions)?;
        let hash = calculate_hash(&previous.hash, timestamp, &tx_json, 0);
        Ok(Self {
            timestamp,
            transactions,
            previous_hash: previous.hash.clone(),
            hash,
            nonce: 0,
            validator,
            compressed: false,
            summary: None,
        })
    }

    /// JSON of the block's transactions, inflated from the payload when compressed.
    pub fn transactions_json(&self) -> Result<String, LedgerError> {
        match (&self.summary, self.compressed) {
            (Some(summary), true) => inflate(&summary.payload),
            (None, true) => Err(LedgerError::InvalidBlock(format!(
                "block {} is marked compressed but has no summary",
                self.hash
            ))),
            _ => Ok(serde_json::to_string(&self.transactions)?),
        }
    }

    /// Recomputes the hash from the block's contents.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let tx_json = self.transactions_json()?;
        Ok(calculate_hash(
            &self.previous_hash,
            self.timestamp,
            &tx_json,
            self.nonce,
        ))
    }

    /// `true` when the stored hash matches the recomputed one.
    pub fn has_valid_hash(&self) -> bool {
        matches!(self.compute_hash(), Ok(hash) if hash == self.hash)
    }

    /// Number of transactions, whether or not the block is compressed.
    pub fn tx_count(&self) -> usize {
        match &self.summary {
            Some(summary) if self.compressed => summary.count,
            _ => self.transactions.len(),
        }
    }

    /// The block's transactions, inflating them when the block is compressed.
    pub fn decompressed_transactions(&self) -> Result<Vec<Transaction>, LedgerError> {
        if !self.compressed {
            return Ok(self.transactions.clone());
        }
        let json = self.transactions_json()?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Replaces the transaction list with a summary. Returns `false` when the
    /// block was already compressed.
    pub fn compress(&mut self) -> Result<bool, LedgerError> {
        if self.compressed {
            return Ok(false);
        }
        let json = serde_json::to_string(&self.transactions)?;
        let mut types = BTreeMap::new();
        for tx in &self.transactions {
            *types.entry(tx.kind).or_insert(0) += 1;
        }
        self.summary = Some(CompressedSummary {
            count: self.transactions.len(),
            types,
            payload: deflate(&json)?,
        });
        self.transactions = Vec::new();
        self.compressed = true;
        Ok(true)
    }

    /// Restores the transaction list. Returns `false` when the block was
    /// not compressed.
    pub fn decompress(&mut self) -> Result<bool, LedgerError> {
        if !self.compressed {
            return Ok(false);
        }
        self.transactions = self.decompressed_transactions()?;
        self.summary = None;
        self.compressed = false;
        Ok(true)
    }
}

/// `SHA-256(previous_hash ‖ timestamp ‖ tx_json ‖ nonce)`, hex encoded.
pub fn calculate_hash(previous_hash: &str, timestamp: i64, tx_json: &str, nonce: u64) -> String {
    let preimage = format!("{previous_hash}{timestamp}{tx_json}{nonce}");
    sha256_hex(preimage.as_bytes())
}

fn deflate(json: &str) -> Result<String, LedgerError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json.as_bytes())
        .map_err(|e| LedgerError::Codec(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| LedgerError::Codec(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

fn inflate(payload: &str) -> Result<String, LedgerError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| LedgerError::Codec(e.to_string()))?;
    let mut json = String::new();
    ZlibDecoder::new(bytes.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| LedgerError::Codec(e.to_string()))?;
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(kind: TransactionKind, from: &str) -> Transaction {
        Transaction::new(kind, from, Some("bob".into()), json!({ "offerId": "o1" }))
    }

    #[test]
    fn genesis_is_deterministic() {
        let a = Block::genesis();
        let b = Block::genesis();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.previous_hash, "0");
        assert_eq!(a.timestamp, 0);
        assert!(a.has_valid_hash());
    }

    #[test]
    fn hash_covers_documented_fields() {
        let g = Block::genesis();
        let block = Block::new(&g, vec![tx(TransactionKind::RespondOffer, "alice")], None).unwrap();
        let expected = calculate_hash(
            &g.hash,
            block.timestamp,
            &serde_json::to_string(&block.transactions).unwrap(),
            0,
        );
        assert_eq!(block.hash, expected);
        assert_eq!(block.previous_hash, g.hash);
    }

    #[test]
    fn new_block_timestamp_is_after_parent() {
        let mut parent = Block::genesis();
        parent.timestamp = i64::MAX / 2;
        let child = Block::new(&parent, vec![], None).unwrap();
        assert!(child.timestamp > parent.timestamp);
    }

    #[test]
    fn tampering_breaks_hash() {
        let g = Block::genesis();
        let mut block = Block::new(&g, vec![tx(TransactionKind::CreateOffer, "a")], None).unwrap();
        assert!(block.has_valid_hash());
        block.transactions[0].from = Some("mallory".into());
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn compression_preserves_hash_and_content() {
        let g = Block::genesis();
        let txs = vec![
            tx(TransactionKind::CreateOffer, "a"),
            tx(TransactionKind::RespondOffer, "b"),
            tx(TransactionKind::RespondOffer, "c"),
        ];
        let mut block = Block::new(&g, txs.clone(), Some("v".into())).unwrap();
        let hash = block.hash.clone();

        assert!(block.compress().unwrap());
        assert!(block.transactions.is_empty());
        assert_eq!(block.tx_count(), 3);
        let summary = block.summary.as_ref().unwrap();
        assert_eq!(summary.types[&TransactionKind::RespondOffer], 2);
        assert_eq!(summary.types[&TransactionKind::CreateOffer], 1);
        assert!(block.has_valid_hash());
        assert_eq!(block.hash, hash);
        assert_eq!(block.decompressed_transactions().unwrap(), txs);
    }

    #[test]
    fn compress_and_decompress_are_idempotent() {
        let g = Block::genesis();
        let mut block = Block::new(&g, vec![tx(TransactionKind::AddItem, "a")], None).unwrap();
        assert!(block.compress().unwrap());
        let once = block.clone();
        assert!(!block.compress().unwrap());
        assert_eq!(block, once);

        assert!(block.decompress().unwrap());
        assert!(!block.decompress().unwrap());
        assert_eq!(block.transactions.len(), 1);
        assert!(block.summary.is_none());
    }

    #[test]
    fn corrupt_payload_is_a_codec_error() {
        let g = Block::genesis();
        let mut block = Block::new(&g, vec![tx(TransactionKind::AddItem, "a")], None).unwrap();
        block.compress().unwrap();
        block.summary.as_mut().unwrap().payload = "not base64!".into();
        assert!(matches!(block.compute_hash(), Err(LedgerError::Codec(_))));
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(Block::genesis()).unwrap();
        assert_eq!(json["previousHash"], "0");
        assert!(json.get("summary").is_none());
    }
}
