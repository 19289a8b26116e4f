//! Ledger transactions.
//!
//! Transactions are emitted by the barter state machine and the shard
//! router, pooled by the ledger, and consumed exactly once into a block.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::sha256_hex;
use crate::shard::ShardId;

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// What a transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Block producer reward. Never submitted, only created by `mine_block`.
    Reward,
    /// Validator stake increase.
    Stake,
    AddItem,
    CreateOffer,
    RespondOffer,
    ConfirmBarter,
    CancelBarter,
    RateBarter,
}

impl TransactionKind {
    /// Whether a transaction of this kind must name a recipient.
    pub fn requires_counterparty(self) -> bool {
        !matches!(
            self,
            Self::Reward | Self::Stake | Self::AddItem | Self::CreateOffer
        )
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reward => "REWARD",
            Self::Stake => "STAKE",
            Self::AddItem => "ADD_ITEM",
            Self::CreateOffer => "CREATE_OFFER",
            Self::RespondOffer => "RESPOND_OFFER",
            Self::ConfirmBarter => "CONFIRM_BARTER",
            Self::CancelBarter => "CANCEL_BARTER",
            Self::RateBarter => "RATE_BARTER",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Shard of `from`, stamped by the ledger on submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<ShardId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Transaction {
    /// A transaction stamped with the current time.
    pub fn new(
        kind: TransactionKind,
        from: impl Into<String>,
        to: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to,
            kind,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            shard_id: None,
            signature: None,
        }
    }

    /// The reward paid to `producer` after it mined a block.
    pub fn reward(producer: impl Into<String>, amount: u64, timestamp: i64) -> Self {
        Self {
            from: None,
            to: Some(producer.into()),
            kind: TransactionKind::Reward,
            payload: json!({ "amount": amount }),
            timestamp,
            shard_id: None,
            signature: None,
        }
    }

    /// A stake increase of `amount` for `validator`.
    pub fn stake(validator: impl Into<String>, amount: u64) -> Self {
        Self::new(
            TransactionKind::Stake,
            validator,
            None,
            json!({ "amount": amount }),
        )
    }

    /// The `amount` field of the payload, if it is an unsigned integer.
    pub fn amount(&self) -> Option<u64> {
        self.payload.get("amount").and_then(|a| a.as_u64())
    }

    /// SHA-256 over the canonical JSON form. Identifies a transaction
    /// across the pending pool, relayed envelopes, and blocks.
    pub fn digest(&self) -> String {
        sha256_hex(&serde_json::to_vec(self).unwrap_or_default())
    }
}
