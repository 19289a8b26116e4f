//! Wire messages.
//!
//! Every message travels as a JSON envelope `{"type": ..., "data": ...}`,
//! one envelope per line. [`Message`] is the closed set of envelopes a node
//! understands; anything else is reported as [`DecodeError::UnknownType`]
//! and ignored by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::barter::{BarterOffer, OfferConfirmation, OfferResponse, Reputation};
use crate::ledger::{Block, Transaction};
use crate::shard::{Item, ItemStatus, ShardId};

/// Every `type` tag a node understands.
pub const KNOWN_TYPES: [&str; 21] = [
    "HANDSHAKE",
    "HANDSHAKE_ACK",
    "QUERY_LATEST",
    "QUERY_ALL",
    "RESPONSE_BLOCKCHAIN",
    "NEW_TRANSACTION",
    "NEW_BLOCK",
    "GET_PEERS",
    "PEERS_LIST",
    "PING",
    "PONG",
    "DATA_REQUEST",
    "DATA_RESPONSE",
    "SHARD_DATA_REQUEST",
    "SHARD_DATA_RESPONSE",
    "ITEM_ADDED",
    "ITEM_STATUS_UPDATED",
    "CONTRACT_OFFER",
    "CONTRACT_RESPONSE",
    "CONTRACT_CONFIRM",
    "REPUTATION_UPDATE",
];

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    QueryLatest,
    QueryAll,
    ResponseBlockchain(Vec<Block>),
    NewTransaction(Transaction),
    NewBlock(Block),
    GetPeers,
    PeersList(Vec<String>),
    Ping,
    Pong(Pong),
    DataRequest(DataRequest),
    DataResponse(DataResponse),
    ShardDataRequest(ShardDataRequest),
    ShardDataResponse(ShardDataResponse),
    ItemAdded(ItemAdded),
    ItemStatusUpdated(ItemStatusUpdated),
    ContractOffer(BarterOffer),
    ContractResponse(ContractResponse),
    ContractConfirm(ContractConfirm),
    ReputationUpdate(ReputationUpdate),
}

impl Message {
    /// The envelope's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "HANDSHAKE",
            Self::HandshakeAck(_) => "HANDSHAKE_ACK",
            Self::QueryLatest => "QUERY_LATEST",
            Self::QueryAll => "QUERY_ALL",
            Self::ResponseBlockchain(_) => "RESPONSE_BLOCKCHAIN",
            Self::NewTransaction(_) => "NEW_TRANSACTION",
            Self::NewBlock(_) => "NEW_BLOCK",
            Self::GetPeers => "GET_PEERS",
            Self::PeersList(_) => "PEERS_LIST",
            Self::Ping => "PING",
            Self::Pong(_) => "PONG",
            Self::DataRequest(_) => "DATA_REQUEST",
            Self::DataResponse(_) => "DATA_RESPONSE",
            Self::ShardDataRequest(_) => "SHARD_DATA_REQUEST",
            Self::ShardDataResponse(_) => "SHARD_DATA_RESPONSE",
            Self::ItemAdded(_) => "ITEM_ADDED",
            Self::ItemStatusUpdated(_) => "ITEM_STATUS_UPDATED",
            Self::ContractOffer(_) => "CONTRACT_OFFER",
            Self::ContractResponse(_) => "CONTRACT_RESPONSE",
            Self::ContractConfirm(_) => "CONTRACT_CONFIRM",
            Self::ReputationUpdate(_) => "REPUTATION_UPDATE",
        }
    }

    /// Envelopes a node forwards to its own peers after accepting them.
    /// These pass through the relay deduplication cache.
    pub fn is_relayed(&self) -> bool {
        matches!(self, Self::NewTransaction(_) | Self::NewBlock(_))
    }

    /// One envelope, without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        match serde_json::from_str::<Self>(line) {
            Ok(message) => Ok(message),
            Err(err) => {
                // Tell an unknown tag apart from a known tag with a bad payload.
                let raw: RawEnvelope =
                    serde_json::from_str(line).map_err(|_| DecodeError::Malformed(err.to_string()))?;
                if KNOWN_TYPES.contains(&raw.kind.as_str()) {
                    Err(DecodeError::Malformed(err.to_string()))
                } else {
                    Err(DecodeError::UnknownType(raw.kind))
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown message type {0}")]
    UnknownType(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub node_id: String,
    pub port: u16,
    pub address: String,
}

impl Handshake {
    /// `address:port`, the key under which the sender is tracked.
    pub fn peer_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub node_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub data_id: String,
    pub requester_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    pub data_id: String,
    pub request_id: String,
    #[serde(default)]
    pub data: Option<Value>,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardDataRequest {
    pub shard_id: ShardId,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardDataResponse {
    pub request_id: String,
    #[serde(default)]
    pub data: Vec<Item>,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAdded {
    pub shard_id: ShardId,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatusUpdated {
    pub shard_id: ShardId,
    pub item_id: String,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractResponse {
    pub offer_id: String,
    pub response: OfferResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractConfirm {
    pub offer_id: String,
    pub confirmation: OfferConfirmation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationUpdate {
    pub user_id: String,
    pub reputation: Reputation,
}
