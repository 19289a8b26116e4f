//! Barter offers and their lifecycle graph.
//!
//! ```text
//!   OPEN ──respond──▶ PENDING_APPROVAL ──confirm──▶ CONFIRMED ──both rated──▶ COMPLETED
//!     │                     │
//!     └──────cancel─────────┴──▶ CANCELLED
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shard::ShardId;

// ---------------------------------------------------------------------------
// OfferStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferStatus {
    Open,
    PendingApproval,
    Confirmed,
    Completed,
    Cancelled,
}

impl OfferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: OfferStatus) -> bool {
        use OfferStatus::*;
        matches!(
            (self, next),
            (Open, PendingApproval)
                | (Open, Cancelled)
                | (PendingApproval, Confirmed)
                | (PendingApproval, Cancelled)
                | (Confirmed, Completed)
        )
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "OPEN",
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Confirmed => "CONFIRMED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// An item put on the table by either party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferedItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Set by item verification, which runs outside the node.
    #[serde(default)]
    pub verified: bool,
}

impl OfferedItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            verified: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// What the creator would like in exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantedItem {
    pub description: String,
}

// ---------------------------------------------------------------------------
// BarterOffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarterOffer {
    pub id: String,
    pub creator: String,
    pub item_offered: OfferedItem,
    pub item_wanted: WantedItem,
    #[serde(default)]
    pub description: Option<String>,
    pub status: OfferStatus,
    /// Shard of the creator.
    pub shard_id: ShardId,
    pub created_at: i64,

    #[serde(default)]
    pub responder: Option<String>,
    #[serde(default)]
    pub responder_item: Option<OfferedItem>,
    #[serde(default)]
    pub responder_shard_id: Option<ShardId>,

    #[serde(default)]
    pub confirmed_at: Option<i64>,
    #[serde(default)]
    pub cancelled_at: Option<i64>,
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub completed_at: Option<i64>,

    /// Rated user → rating received.
    #[serde(default)]
    pub ratings: BTreeMap<String, u8>,
    /// Rated user → review received.
    #[serde(default)]
    pub reviews: BTreeMap<String, String>,
}

impl BarterOffer {
    /// `user` is the creator or the responder.
    pub fn is_participant(&self, user: &str) -> bool {
        self.creator == user || self.responder.as_deref() == Some(user)
    }

    /// The other party of a trade `user` takes part in.
    pub fn counterparty_of(&self, user: &str) -> Option<&str> {
        if self.creator == user {
            self.responder.as_deref()
        } else if self.responder.as_deref() == Some(user) {
            Some(self.creator.as_str())
        } else {
            None
        }
    }

    /// Both parties have rated each other.
    pub fn is_fully_rated(&self) -> bool {
        self.ratings.contains_key(&self.creator)
            && self
                .responder
                .as_ref()
                .is_some_and(|r| self.ratings.contains_key(r))
    }

    /// Timestamp of the last lifecycle event.
    pub fn last_activity(&self) -> i64 {
        [self.completed_at, self.cancelled_at, self.confirmed_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }

    #[cfg(test)]
    pub(crate) fn sample(id: &str, creator: &str) -> Self {
        Self {
            id: id.into(),
            creator: creator.into(),
            item_offered: OfferedItem::new("item-1", "book"),
            item_wanted: WantedItem {
                description: "phone".into(),
            },
            description: None,
            status: OfferStatus::Open,
            shard_id: crate::shard::shard_of(creator),
            created_at: 1_000,
            responder: None,
            responder_item: None,
            responder_shard_id: None,
            confirmed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            completed_at: None,
            ratings: BTreeMap::new(),
            reviews: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Deltas
// ---------------------------------------------------------------------------

/// The responder half of an offer, as carried by `CONTRACT_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferResponse {
    pub responder: String,
    pub responder_item: OfferedItem,
    pub responder_shard_id: ShardId,
}

impl OfferResponse {
    /// Overwrites the responder fields and moves the offer to `PENDING_APPROVAL`.
    pub fn apply(&self, offer: &mut BarterOffer) {
        offer.responder = Some(self.responder.clone());
        offer.responder_item = Some(self.responder_item.clone());
        offer.responder_shard_id = Some(self.responder_shard_id);
        offer.status = OfferStatus::PendingApproval;
    }
}

/// A status change carried by `CONTRACT_CONFIRM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferConfirmation {
    pub status: OfferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Ratings recorded so far, keyed by rated user.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ratings: BTreeMap<String, u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reviews: BTreeMap<String, String>,
}

impl OfferConfirmation {
    /// The confirmation describing `offer`'s current status and ratings.
    pub fn of(offer: &BarterOffer) -> Self {
        Self {
            status: offer.status,
            confirmed_at: offer.confirmed_at,
            cancelled_at: offer.cancelled_at,
            cancelled_by: offer.cancelled_by.clone(),
            completed_at: offer.completed_at,
            ratings: offer.ratings.clone(),
            reviews: offer.reviews.clone(),
        }
    }

    /// Overwrites the status, plus whichever timestamps are set, and merges
    /// the carried ratings into ours. A confirmed offer whose merged ratings
    /// cover both parties is completed here.
    pub fn apply(&self, offer: &mut BarterOffer) {
        for (user, rating) in &self.ratings {
            offer.ratings.insert(user.clone(), *rating);
        }
        for (user, review) in &self.reviews {
            offer.reviews.insert(user.clone(), review.clone());
        }
        offer.status = self.status;
        if self.confirmed_at.is_some() {
            offer.confirmed_at = self.confirmed_at;
        }
        if self.cancelled_at.is_some() {
            offer.cancelled_at = self.cancelled_at;
            offer.cancelled_by = self.cancelled_by.clone();
        }
        if self.completed_at.is_some() {
            offer.completed_at = self.completed_at;
        }
        if offer.status == OfferStatus::Confirmed && offer.is_fully_rated() {
            offer.status = OfferStatus::Completed;
            offer
                .completed_at
                .get_or_insert_with(|| chrono::Utc::now().timestamp_millis());
        }
    }
}
