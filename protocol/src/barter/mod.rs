//! # Barter
//!
//! Offers, their lifecycle, and the reputation earned by trading.
//!
//! ```text
//! offer.rs     : BarterOffer, OfferStatus, wire deltas
//! reputation.rs: additive per-user score
//! contract.rs  : BarterContract: guarded transitions, peer sync
//! ```

pub mod contract;
pub mod offer;
pub mod reputation;

pub use contract::{BarterContract, BarterError};
pub use offer::{
    BarterOffer, OfferConfirmation, OfferResponse, OfferStatus, OfferedItem, WantedItem,
};
pub use reputation::Reputation;
