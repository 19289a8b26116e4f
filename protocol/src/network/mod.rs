//! # Network Module
//!
//! Peer-to-peer transport for the barter node: newline-delimited JSON
//! envelopes over persistent duplex connections.
//!
//! ## Architecture
//!
//! ```text
//! message.rs   : Message envelope and payload types
//! connection.rs: one duplex connection, line framing
//! peer.rs      : PeerTable, liveness bookkeeping
//! gossip.rs    : GossipNetwork: dial/accept, dispatch, broadcast, discovery
//! ```
//!
//! ## Design Decisions
//!
//! - The transport is generic over `AsyncRead + AsyncWrite`, so tests link
//!   nodes with in-memory duplex pipes instead of sockets.
//! - Network-level messages (handshake, ping, peer exchange) are consumed
//!   by [`GossipNetwork`]; all others go to a single [`MessageHandler`]
//!   held through a `Weak` reference, so the network never keeps its owner
//!   alive.
//! - Tables are guarded by `parking_lot::RwLock` and `DashMap`; no lock is
//!   held while a handler runs.

pub mod connection;
pub mod gossip;
pub mod message;
pub mod peer;

pub use connection::{Connection, ConnectionId};
pub use gossip::{GossipConfig, GossipNetwork, MessageHandler, NetworkError};
pub use message::{
    ContractConfirm, ContractResponse, DataRequest, DataResponse, DecodeError, Handshake,
    HandshakeAck, ItemAdded, ItemStatusUpdated, Message, Pong, ReputationUpdate,
    ShardDataRequest, ShardDataResponse, KNOWN_TYPES,
};
pub use peer::{Peer, PeerTable, Sweep};
