//! # Ledger & Consensus
//!
//! Append-only transaction log with stake-weighted block production and a
//! deterministic fork-choice rule.
//!
//! ## Architecture
//!
//! ```text
//! transaction.rs: Transaction, TransactionKind
//! block.rs      : Block, hashing, compression
//! validators.rs : ValidatorRegistry, weighted producer draw
//! fork_choice.rs: stake → length → timestamp chain selection
//! verifier.rs   : pluggable signature check
//! chain.rs      : Blockchain: pending pool, mining, reconciliation
//! ```
//!
//! Producer selection is local and random; it never yields agreement on
//! its own. Agreement comes after the fact, when peers exchange tips and
//! run [`fork_choice::choose`].

pub mod block;
pub mod chain;
pub mod fork_choice;
pub mod transaction;
pub mod validators;
pub mod verifier;

pub use block::{Block, CompressedSummary};
pub use chain::{Blockchain, ChainStatus, ChainUpdate, LedgerConfig};
pub use fork_choice::ForkChoice;
pub use transaction::{Transaction, TransactionKind};
pub use validators::ValidatorRegistry;
pub use verifier::{AcceptAll, SignatureVerifier};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("transaction signature rejected")]
    InvalidSignature,

    #[error("validator {0} has no stake")]
    InsufficientStake(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("block payload codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Malformed input. The caller's fault, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingField(_) | Self::InvalidTransaction(_) | Self::InvalidSignature
        )
    }

    /// Invalid producer or chain. Block production is aborted.
    pub fn is_consensus(&self) -> bool {
        matches!(self, Self::InsufficientStake(_) | Self::InvalidBlock(_))
    }
}
