//! # Protocol Configuration & Constants
//!
//! Every timing, sizing, and retry constant of the barter node lives here.
//! Subsystem `*Config` structs take their defaults from this module, so a
//! test that needs a faster clock shrinks the config struct, never the
//! constant.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Ports & Addresses
// ---------------------------------------------------------------------------

/// Default TCP port for peer-to-peer traffic.
pub const DEFAULT_P2P_PORT: u16 = 6001;

/// Default port for the Prometheus `/metrics` endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9742;

/// Host advertised in our handshake when none is configured.
pub const DEFAULT_ADVERTISED_HOST: &str = "127.0.0.1";

/// Interface the peer listener binds to.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Random bytes in a node id (hex encoded). Regenerated on every start.
pub const NODE_ID_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Gossip Network
// ---------------------------------------------------------------------------

/// Delay between opening a connection and sending our handshake. Gives the
/// remote end time to finish wiring its reader before the first envelope.
pub const HANDSHAKE_DELAY: Duration = Duration::from_millis(500);

/// Interval of the liveness sweep.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// A peer silent for longer than this gets pinged by the next sweep.
pub const PEER_STALE_THRESHOLD: Duration = Duration::from_secs(120);

/// Interval between `GET_PEERS` rounds.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// How long a dial may take before it counts as a failed attempt.
pub const PEER_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial retries for addresses learned through discovery.
pub const CONNECT_RETRIES: u32 = 3;

/// Fixed backoff between dial retries.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on simultaneously tracked peers.
pub const MAX_PEERS: usize = 50;

/// Capacity of the relay deduplication cache (BLAKE3 digests).
pub const SEEN_CACHE_SIZE: usize = 10_000;

/// Longest accepted envelope line. Anything bigger is a broken or hostile peer.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Units paid to a block producer through the follow-up `REWARD` transaction.
pub const MINING_REWARD: u64 = 10;

/// Number of most recent blocks kept verbatim. Older blocks are compressed.
pub const RETENTION_WINDOW: usize = 100;

/// Timestamp of the shared genesis block. Fixed so that independently
/// started nodes agree on the chain root.
pub const GENESIS_TIMESTAMP: i64 = 0;

/// `previousHash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Stake a freshly started node registers for itself.
pub const DEFAULT_VALIDATOR_STAKE: u64 = 10;

/// Interval of the block producer loop.
pub const BLOCK_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Sharding
// ---------------------------------------------------------------------------

/// Size of the shard key space: one shard per two-hex-digit prefix.
pub const SHARD_COUNT: usize = 256;

/// Shards owned by each node.
pub const LOCAL_SHARD_COUNT: usize = 2;

/// Timeout of a single `SHARD_DATA_REQUEST`.
pub const SHARD_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-shard timeout while assembling the market-wide item listing. Every
/// remote shard is asked concurrently, so this bounds the whole listing.
pub const SHARD_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Data Routing
// ---------------------------------------------------------------------------

/// Entry ceiling of the remote-data cache.
pub const CACHE_CAPACITY: usize = 1000;

/// Time-to-live of a cached remote value.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Timeout of a single `DATA_REQUEST` attempt.
pub const DATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries after the first failed `DATA_REQUEST` attempt.
pub const DATA_REQUEST_RETRIES: u32 = 3;

/// Pause between two `DATA_REQUEST` attempts.
pub const DATA_REQUEST_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Random bytes in a correlation id (hex encoded on the wire).
pub const REQUEST_ID_BYTES: usize = 8;

// ---------------------------------------------------------------------------
// Barter
// ---------------------------------------------------------------------------

/// Random bytes in an offer id (hex encoded).
pub const OFFER_ID_BYTES: usize = 16;

/// Lowest and highest accepted rating.
pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Age after which finished offers are pruned.
pub const OFFER_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Interval of the offer pruning sweep.
pub const OFFER_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
