//! # Barter Contract
//!
//! Owns the offer table and drives every offer through its lifecycle.
//!
//! A local operation runs, in order: guard check, mutation of the offer
//! table, shard index update, ledger transaction, gossip broadcast. Guard
//! check and mutation happen under one write lock, so two concurrent
//! operations on the same offer can never both pass a guard.
//!
//! Deltas from peers (`CONTRACT_OFFER`, `CONTRACT_RESPONSE`,
//! `CONTRACT_CONFIRM`, `REPUTATION_UPDATE`) are applied as overwrites:
//! last writer wins, with no version check. An offer that already exists
//! locally is never re-created.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use super::offer::{
    BarterOffer, OfferConfirmation, OfferResponse, OfferStatus, OfferedItem, WantedItem,
};
use super::reputation::Reputation;
use crate::config::{MAX_RATING, MIN_RATING, OFFER_ID_BYTES};
use crate::crypto::random_hex;
use crate::ledger::{Blockchain, LedgerError, Transaction, TransactionKind};
use crate::network::{ContractConfirm, ContractResponse, GossipNetwork, Message, ReputationUpdate};
use crate::node::publish_transaction;
use crate::routing::{offer_key, DataRouter, RouterError};
use crate::shard::{shard_of, ShardId};
use crate::storage::{OfferFilter, Store, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BarterError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{actor} may not {action} offer {offer}")]
    Unauthorized {
        actor: String,
        action: &'static str,
        offer: String,
    },

    #[error("cannot {action} offer {offer} while it is {status}")]
    IllegalTransition {
        offer: String,
        status: OfferStatus,
        action: &'static str,
    },

    #[error("offer {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Offer book
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct OfferBook {
    offers: HashMap<String, BarterOffer>,
    /// Creator shard → offer ids.
    by_shard: HashMap<ShardId, BTreeSet<String>>,
    reputations: HashMap<String, Reputation>,
    /// Ids of confirmed offers, oldest first.
    completed: Vec<String>,
}

impl OfferBook {
    fn insert(&mut self, offer: BarterOffer) {
        self.by_shard
            .entry(offer.shard_id)
            .or_default()
            .insert(offer.id.clone());
        self.offers.insert(offer.id.clone(), offer);
    }

    fn remove(&mut self, id: &str) -> Option<BarterOffer> {
        let offer = self.offers.remove(id)?;
        if let Some(ids) = self.by_shard.get_mut(&offer.shard_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_shard.remove(&offer.shard_id);
            }
        }
        self.completed.retain(|c| c != id);
        Some(offer)
    }

    fn mark_completed(&mut self, id: &str) {
        if !self.completed.iter().any(|c| c == id) {
            self.completed.push(id.to_string());
        }
    }

    fn entry<'a>(&'a mut self, id: &str) -> Result<&'a mut BarterOffer, BarterError> {
        self.offers
            .get_mut(id)
            .ok_or_else(|| BarterError::NotFound(id.to_string()))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn unauthorized(actor: &str, action: &'static str, offer: &str) -> BarterError {
    BarterError::Unauthorized {
        actor: actor.to_string(),
        action,
        offer: offer.to_string(),
    }
}

fn illegal(offer: &BarterOffer, action: &'static str) -> BarterError {
    BarterError::IllegalTransition {
        offer: offer.id.clone(),
        status: offer.status,
        action,
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

pub struct BarterContract {
    book: RwLock<OfferBook>,
    store: Arc<dyn Store>,
    network: Arc<GossipNetwork>,
    ledger: Arc<RwLock<Blockchain>>,
    router: Arc<DataRouter>,
}

impl BarterContract {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<GossipNetwork>,
        ledger: Arc<RwLock<Blockchain>>,
        router: Arc<DataRouter>,
    ) -> Self {
        Self {
            book: RwLock::new(OfferBook::default()),
            store,
            network,
            ledger,
            router,
        }
    }

    /// Loads persisted offers into the offer table. Returns how many were loaded.
    pub fn load_from_store(&self) -> Result<usize, StoreError> {
        let offers = self.store.get_all_offers(&OfferFilter::default())?;
        let mut book = self.book.write();
        let mut loaded = 0;
        for offer in offers {
            if matches!(offer.status, OfferStatus::Confirmed | OfferStatus::Completed) {
                book.mark_completed(&offer.id);
            }
            book.insert(offer);
            loaded += 1;
        }
        info!(loaded, "offers loaded from store");
        Ok(loaded)
    }

    // -- Local operations ---------------------------------------------------

    /// Opens a new offer of `item_offered` in exchange for `item_wanted`.
    pub fn create_offer(
        &self,
        creator: &str,
        item_offered: OfferedItem,
        item_wanted: WantedItem,
        description: Option<String>,
    ) -> Result<BarterOffer, BarterError> {
        if creator.is_empty() {
            return Err(BarterError::Validation("creator is required".into()));
        }
        if item_offered.name.trim().is_empty() {
            return Err(BarterError::Validation("offered item needs a name".into()));
        }
        if item_wanted.description.trim().is_empty() {
            return Err(BarterError::Validation("wanted item needs a description".into()));
        }

        let offer = BarterOffer {
            id: random_hex(OFFER_ID_BYTES),
            creator: creator.to_string(),
            item_offered,
            item_wanted,
            description,
            status: OfferStatus::Open,
            shard_id: shard_of(creator),
            created_at: now_ms(),
            responder: None,
            responder_item: None,
            responder_shard_id: None,
            confirmed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            completed_at: None,
            ratings: Default::default(),
            reviews: Default::default(),
        };
        self.book.write().insert(offer.clone());
        self.publish_local(&offer);

        self.submit(Transaction::new(
            TransactionKind::CreateOffer,
            creator,
            None,
            json!({
                "offerId": offer.id,
                "itemOffered": offer.item_offered,
                "itemWanted": offer.item_wanted,
            }),
        ))?;
        self.network.broadcast(&Message::ContractOffer(offer.clone()));

        info!(offer = %offer.id, creator, shard = %offer.shard_id, "offer created");
        Ok(offer)
    }

    /// Attaches `responder`'s item to an open offer.
    pub async fn respond_to_offer(
        &self,
        offer_id: &str,
        responder: &str,
        responder_item: OfferedItem,
    ) -> Result<BarterOffer, BarterError> {
        if responder.is_empty() {
            return Err(BarterError::Validation("responder is required".into()));
        }
        self.ensure_local(offer_id).await?;

        let response = OfferResponse {
            responder: responder.to_string(),
            responder_item,
            responder_shard_id: shard_of(responder),
        };
        let offer = {
            let mut book = self.book.write();
            let offer = book.entry(offer_id)?;
            if offer.creator == responder {
                return Err(unauthorized(responder, "respond to", offer_id));
            }
            if offer.status != OfferStatus::Open {
                return Err(illegal(offer, "respond to"));
            }
            response.apply(offer);
            let snapshot = offer.clone();
            book.insert(snapshot.clone());
            snapshot
        };
        self.publish_local(&offer);

        self.submit(Transaction::new(
            TransactionKind::RespondOffer,
            responder,
            Some(offer.creator.clone()),
            json!({ "offerId": offer.id, "responderItem": response.responder_item }),
        ))?;
        self.network.broadcast(&Message::ContractResponse(ContractResponse {
            offer_id: offer.id.clone(),
            response,
        }));

        info!(offer = %offer.id, responder, "offer answered");
        Ok(offer)
    }

    /// The creator accepts the pending response. Both parties gain one
    /// reputation point.
    pub fn confirm_barter(&self, offer_id: &str, actor: &str) -> Result<BarterOffer, BarterError> {
        let offer = {
            let mut guard = self.book.write();
            let book = &mut *guard;
            let offer = book.entry(offer_id)?;
            if offer.creator != actor {
                return Err(unauthorized(actor, "confirm", offer_id));
            }
            if offer.status != OfferStatus::PendingApproval {
                return Err(illegal(offer, "confirm"));
            }
            offer.status = OfferStatus::Confirmed;
            offer.confirmed_at = Some(now_ms());
            let snapshot = offer.clone();

            for party in [Some(&snapshot.creator), snapshot.responder.as_ref()]
                .into_iter()
                .flatten()
            {
                book.reputations.entry(party.clone()).or_default().record(1);
            }
            book.mark_completed(offer_id);
            book.insert(snapshot.clone());
            snapshot
        };
        self.publish_local(&offer);

        self.submit(Transaction::new(
            TransactionKind::ConfirmBarter,
            actor,
            offer.responder.clone(),
            json!({ "offerId": offer.id }),
        ))?;
        self.broadcast_confirmation(&offer);

        info!(offer = %offer.id, "barter confirmed");
        Ok(offer)
    }

    /// Either party withdraws before the barter is confirmed.
    pub fn cancel_barter(&self, offer_id: &str, actor: &str) -> Result<BarterOffer, BarterError> {
        let offer = {
            let mut book = self.book.write();
            let offer = book.entry(offer_id)?;
            if !offer.is_participant(actor) {
                return Err(unauthorized(actor, "cancel", offer_id));
            }
            if !offer.status.can_transition_to(OfferStatus::Cancelled) {
                return Err(illegal(offer, "cancel"));
            }
            offer.status = OfferStatus::Cancelled;
            offer.cancelled_at = Some(now_ms());
            offer.cancelled_by = Some(actor.to_string());
            let snapshot = offer.clone();
            book.insert(snapshot.clone());
            snapshot
        };
        self.publish_local(&offer);

        let counterparty = offer
            .counterparty_of(actor)
            .unwrap_or(offer.creator.as_str())
            .to_string();
        self.submit(Transaction::new(
            TransactionKind::CancelBarter,
            actor,
            Some(counterparty),
            json!({ "offerId": offer.id }),
        ))?;
        self.broadcast_confirmation(&offer);

        info!(offer = %offer.id, actor, "barter cancelled");
        Ok(offer)
    }

    /// `actor` rates the other party of a confirmed barter. Once both
    /// parties have rated, the offer is completed.
    pub fn rate_barter(
        &self,
        offer_id: &str,
        actor: &str,
        rating: u8,
        review: Option<String>,
    ) -> Result<BarterOffer, BarterError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(BarterError::Validation(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}, got {rating}"
            )));
        }

        let (offer, rated, reputation, completed) = {
            let mut guard = self.book.write();
            let book = &mut *guard;
            let offer = book.entry(offer_id)?;
            if !offer.is_participant(actor) {
                return Err(unauthorized(actor, "rate", offer_id));
            }
            if offer.status != OfferStatus::Confirmed {
                return Err(illegal(offer, "rate"));
            }
            let Some(rated) = offer.counterparty_of(actor).map(str::to_string) else {
                return Err(illegal(offer, "rate"));
            };

            let previous = offer.ratings.insert(rated.clone(), rating);
            if let Some(review) = review {
                offer.reviews.insert(rated.clone(), review);
            }
            let both_rated = offer.is_fully_rated();
            if both_rated {
                offer.status = OfferStatus::Completed;
                offer.completed_at = Some(now_ms());
            }
            let snapshot = offer.clone();

            let reputation = book.reputations.entry(rated.clone()).or_default();
            match previous {
                Some(old) => reputation.revise(u64::from(old), u64::from(rating)),
                None => reputation.record(u64::from(rating)),
            }
            let reputation = reputation.clone();
            book.insert(snapshot.clone());
            (snapshot, rated, reputation, both_rated)
        };
        self.publish_local(&offer);

        self.submit(Transaction::new(
            TransactionKind::RateBarter,
            actor,
            Some(rated.clone()),
            json!({
                "offerId": offer.id,
                "rating": rating,
                "review": offer.reviews.get(&rated),
            }),
        ))?;
        self.network.broadcast(&Message::ReputationUpdate(ReputationUpdate {
            user_id: rated.clone(),
            reputation,
        }));
        // Carries the rating itself, so the peer holding the other half can complete.
        self.broadcast_confirmation(&offer);
        if completed {
            info!(offer = %offer.id, "barter completed");
        } else {
            debug!(offer = %offer.id, actor, rated = %rated, rating, "barter rated");
        }
        Ok(offer)
    }

    // -- Remote deltas ------------------------------------------------------

    /// Records an offer announced by a peer. No-op if it already exists.
    pub fn sync_offer(&self, offer: BarterOffer) -> bool {
        {
            let mut book = self.book.write();
            if book.offers.contains_key(&offer.id) {
                return false;
            }
            if matches!(offer.status, OfferStatus::Confirmed | OfferStatus::Completed) {
                book.mark_completed(&offer.id);
            }
            book.insert(offer.clone());
        }
        self.persist(&offer);
        debug!(offer = %offer.id, creator = %offer.creator, "offer synced from peer");
        true
    }

    /// Overwrites the responder fields of a known offer.
    pub fn sync_offer_response(&self, msg: ContractResponse) -> bool {
        let offer = {
            let mut book = self.book.write();
            let Some(offer) = book.offers.get_mut(&msg.offer_id) else {
                debug!(offer = %msg.offer_id, "response for unknown offer");
                return false;
            };
            msg.response.apply(offer);
            let snapshot = offer.clone();
            book.insert(snapshot.clone());
            snapshot
        };
        self.persist(&offer);
        true
    }

    /// Overwrites the status fields of a known offer and merges its ratings.
    pub fn sync_offer_confirmation(&self, msg: ContractConfirm) -> bool {
        let offer = {
            let mut book = self.book.write();
            let Some(offer) = book.offers.get_mut(&msg.offer_id) else {
                debug!(offer = %msg.offer_id, "confirmation for unknown offer");
                return false;
            };
            let before = offer.status;
            msg.confirmation.apply(offer);
            let snapshot = offer.clone();
            if matches!(snapshot.status, OfferStatus::Confirmed | OfferStatus::Completed) {
                book.mark_completed(&snapshot.id);
            }
            if before != OfferStatus::Completed && snapshot.status == OfferStatus::Completed {
                info!(offer = %snapshot.id, "barter completed by peer");
            }
            book.insert(snapshot.clone());
            snapshot
        };
        self.persist(&offer);
        true
    }

    /// Replaces our copy of a user's reputation.
    pub fn sync_reputation(&self, msg: ReputationUpdate) {
        self.book
            .write()
            .reputations
            .insert(msg.user_id, msg.reputation);
    }

    // -- Queries ------------------------------------------------------------

    /// Local table, then store, then peers via `offer:<id>`.
    pub async fn get_offer(&self, offer_id: &str) -> Result<BarterOffer, BarterError> {
        if let Some(offer) = self.book.read().offers.get(offer_id) {
            return Ok(offer.clone());
        }
        match self.store.get_offer(offer_id) {
            Ok(Some(offer)) => return Ok(offer),
            Ok(None) => {}
            Err(e) => warn!(offer = offer_id, error = %e, "store lookup failed"),
        }
        match self.router.request_offer(offer_id).await {
            Ok(offer) => Ok(offer),
            Err(RouterError::NotFound(_)) => Err(BarterError::NotFound(offer_id.to_string())),
            Err(e) => {
                warn!(offer = offer_id, error = %e, "peer returned unusable offer");
                Err(BarterError::NotFound(offer_id.to_string()))
            }
        }
    }

    /// Pulls a missing offer into the table before a local operation.
    async fn ensure_local(&self, offer_id: &str) -> Result<(), BarterError> {
        if self.book.read().offers.contains_key(offer_id) {
            return Ok(());
        }
        let offer = self.get_offer(offer_id).await?;
        let mut book = self.book.write();
        if !book.offers.contains_key(offer_id) {
            book.insert(offer);
        }
        Ok(())
    }

    pub fn open_offers(&self) -> Vec<BarterOffer> {
        self.collect(|o| o.status == OfferStatus::Open)
    }

    pub fn open_offers_in_shard(&self, shard: ShardId) -> Vec<BarterOffer> {
        let book = self.book.read();
        let mut offers: Vec<BarterOffer> = book
            .by_shard
            .get(&shard)
            .into_iter()
            .flatten()
            .filter_map(|id| book.offers.get(id))
            .filter(|o| o.status == OfferStatus::Open)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.created_at);
        offers
    }

    /// Every offer `user` created or answered.
    pub fn user_history(&self, user: &str) -> Vec<BarterOffer> {
        self.collect(|o| o.is_participant(user))
    }

    pub fn reputation_of(&self, user: &str) -> Reputation {
        self.book
            .read()
            .reputations
            .get(user)
            .cloned()
            .unwrap_or_default()
    }

    /// Confirmed and completed barters, in confirmation order.
    pub fn completed_barters(&self) -> Vec<BarterOffer> {
        let book = self.book.read();
        book.completed
            .iter()
            .filter_map(|id| book.offers.get(id))
            .cloned()
            .collect()
    }

    pub fn offer_count(&self) -> usize {
        self.book.read().offers.len()
    }

    pub fn open_offer_count(&self) -> usize {
        self.book
            .read()
            .offers
            .values()
            .filter(|o| o.status == OfferStatus::Open)
            .count()
    }

    /// Drops completed and cancelled offers whose last activity is older
    /// than `max_age`. Returns how many were dropped.
    pub fn prune_old_data(&self, max_age: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX));
        let mut book = self.book.write();
        let stale: Vec<String> = book
            .offers
            .values()
            .filter(|o| o.status.is_terminal() && o.last_activity() < cutoff)
            .map(|o| o.id.clone())
            .collect();
        for id in &stale {
            book.remove(id);
        }
        if !stale.is_empty() {
            info!(pruned = stale.len(), "pruned finished offers");
        }
        stale.len()
    }

    fn collect(&self, keep: impl Fn(&BarterOffer) -> bool) -> Vec<BarterOffer> {
        let mut offers: Vec<BarterOffer> = self
            .book
            .read()
            .offers
            .values()
            .filter(|o| keep(o))
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.created_at);
        offers
    }

    // -- Plumbing -----------------------------------------------------------

    fn persist(&self, offer: &BarterOffer) {
        if let Err(e) = self.store.save_offer(offer) {
            warn!(offer = %offer.id, error = %e, "cannot persist offer");
        }
    }

    /// Persists and serves `offer` to peers under `offer:<id>`.
    fn publish_local(&self, offer: &BarterOffer) {
        self.persist(offer);
        match serde_json::to_value(offer) {
            Ok(value) => self.router.store_local(offer_key(&offer.id), value),
            Err(e) => warn!(offer = %offer.id, error = %e, "cannot publish offer"),
        }
    }

    fn submit(&self, tx: Transaction) -> Result<(), BarterError> {
        publish_transaction(&self.ledger, &self.network, tx)?;
        Ok(())
    }

    fn broadcast_confirmation(&self, offer: &BarterOffer) {
        self.network.broadcast(&Message::ContractConfirm(ContractConfirm {
            offer_id: offer.id.clone(),
            confirmation: OfferConfirmation::of(offer),
        }));
    }
}

impl std::fmt::Debug for BarterContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarterContract")
            .field("offers", &self.offer_count())
            .finish()
    }
}
