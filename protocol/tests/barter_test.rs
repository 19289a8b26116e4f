//! Barter lifecycle across nodes.

use std::sync::Arc;
use std::time::Duration;

use barter_protocol::barter::{BarterError, BarterOffer, OfferStatus, OfferedItem, WantedItem};
use barter_protocol::ledger::TransactionKind;
use barter_protocol::storage::{MemoryStore, SledStore, Store};
use barter_protocol::{BarterNode, NodeConfig};

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.gossip.handshake_delay = Duration::from_millis(10);
    config.router.request_timeout = Duration::from_millis(300);
    config.router.retries = 1;
    config.router.retry_delay = Duration::from_millis(10);
    config
}

fn node(id: &str) -> Arc<BarterNode> {
    BarterNode::with_id(id, fast_config(), Arc::new(MemoryStore::new()))
}

fn link(a: &Arc<BarterNode>, b: &Arc<BarterNode>) {
    let (left, right) = tokio::io::duplex(1 << 20);
    a.network().attach(left, b.id(), None);
    b.network().attach(right, a.id(), None);
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn book() -> OfferedItem {
    OfferedItem::new("item-book", "book")
}

fn phone() -> OfferedItem {
    OfferedItem::new("item-phone", "phone")
}

fn wants_phone() -> WantedItem {
    WantedItem {
        description: "phone".into(),
    }
}

#[tokio::test]
async fn offer_lifecycle_across_two_nodes() {
    let a = node("node-a");
    let b = node("node-b");
    link(&a, &b);
    eventually("link", || {
        a.network().connection_count() == 1 && b.network().connection_count() == 1
    })
    .await;

    let offer = a
        .contract()
        .create_offer("alice", book(), wants_phone(), Some("swap?".into()))
        .unwrap();
    assert_eq!(offer.status, OfferStatus::Open);
    eventually("B to learn the offer", || b.contract().offer_count() == 1).await;

    // The responder acts on the second node.
    let answered = b
        .contract()
        .respond_to_offer(&offer.id, "bob", phone())
        .await
        .unwrap();
    assert_eq!(answered.status, OfferStatus::PendingApproval);
    eventually("A to see the response", || {
        a.contract()
            .user_history("bob")
            .first()
            .is_some_and(|o| o.status == OfferStatus::PendingApproval)
    })
    .await;

    let confirmed = a.contract().confirm_barter(&offer.id, "alice").unwrap();
    assert_eq!(confirmed.status, OfferStatus::Confirmed);
    assert_eq!(confirmed.responder.as_deref(), Some("bob"));
    assert_eq!(a.contract().reputation_of("alice").count, 1);
    assert_eq!(a.contract().reputation_of("bob").count, 1);
    eventually("B to see the confirmation", || {
        b.contract()
            .completed_barters()
            .iter()
            .any(|o| o.id == offer.id)
    })
    .await;

    a.contract().rate_barter(&offer.id, "alice", 5, None).unwrap();
    let done = a.contract().rate_barter(&offer.id, "bob", 4, None).unwrap();
    assert_eq!(done.status, OfferStatus::Completed);
    assert_eq!(done.ratings.len(), 2);

    eventually("B to see completion and reputation", || {
        b.contract().reputation_of("bob").total == 6
            && b.contract()
                .user_history("alice")
                .iter()
                .any(|o| o.status == OfferStatus::Completed)
    })
    .await;

    let kinds: Vec<TransactionKind> = a
        .ledger()
        .read()
        .pending_transactions()
        .iter()
        .map(|tx| tx.kind)
        .collect();
    for kind in [
        TransactionKind::CreateOffer,
        TransactionKind::RespondOffer,
        TransactionKind::ConfirmBarter,
        TransactionKind::RateBarter,
    ] {
        assert!(kinds.contains(&kind), "missing {kind}");
    }
}

/// The offer as `node` currently sees it.
fn seen_by(node: &BarterNode, offer_id: &str) -> Option<BarterOffer> {
    node.contract()
        .user_history("alice")
        .into_iter()
        .find(|o| o.id == offer_id)
}

/// Alice offers on `a`, Bob answers on `b`, Alice confirms, and both nodes
/// see the confirmation.
async fn confirmed_across(a: &Arc<BarterNode>, b: &Arc<BarterNode>) -> BarterOffer {
    let offer = a
        .contract()
        .create_offer("alice", book(), wants_phone(), None)
        .unwrap();
    eventually("B to learn the offer", || seen_by(b, &offer.id).is_some()).await;
    b.contract()
        .respond_to_offer(&offer.id, "bob", phone())
        .await
        .unwrap();
    eventually("A to see the response", || {
        seen_by(a, &offer.id).is_some_and(|o| o.status == OfferStatus::PendingApproval)
    })
    .await;
    let confirmed = a.contract().confirm_barter(&offer.id, "alice").unwrap();
    eventually("B to see the confirmation", || {
        seen_by(b, &offer.id).is_some_and(|o| o.status == OfferStatus::Confirmed)
    })
    .await;
    confirmed
}

fn linked_pair() -> (Arc<BarterNode>, Arc<BarterNode>) {
    let a = node("node-a");
    let b = node("node-b");
    link(&a, &b);
    (a, b)
}

#[tokio::test]
async fn each_party_rates_on_their_own_node() {
    let (a, b) = linked_pair();
    let offer = confirmed_across(&a, &b).await;

    let after_alice = a.contract().rate_barter(&offer.id, "alice", 5, None).unwrap();
    assert_eq!(after_alice.status, OfferStatus::Confirmed);
    eventually("B to receive Alice's rating", || {
        seen_by(&b, &offer.id).is_some_and(|o| o.ratings.get("bob") == Some(&5))
    })
    .await;

    let after_bob = b
        .contract()
        .rate_barter(&offer.id, "bob", 4, Some("as described".into()))
        .unwrap();
    assert_eq!(after_bob.status, OfferStatus::Completed);
    assert_eq!(after_bob.ratings.len(), 2);

    eventually("A to complete the barter", || {
        seen_by(&a, &offer.id).is_some_and(|o| o.status == OfferStatus::Completed)
    })
    .await;
    let on_a = seen_by(&a, &offer.id).unwrap();
    assert_eq!(on_a.ratings.get("alice"), Some(&4));
    assert_eq!(on_a.reviews.get("alice").map(String::as_str), Some("as described"));
    for node in [&a, &b] {
        assert!(node
            .contract()
            .completed_barters()
            .iter()
            .any(|o| o.id == offer.id && o.status == OfferStatus::Completed));
    }
}

#[tokio::test]
async fn simultaneous_ratings_complete_on_both_nodes() {
    let (a, b) = linked_pair();
    let offer = confirmed_across(&a, &b).await;

    a.contract().rate_barter(&offer.id, "alice", 3, None).unwrap();
    b.contract().rate_barter(&offer.id, "bob", 5, None).unwrap();

    eventually("both nodes to complete", || {
        [&a, &b].iter().all(|n| {
            seen_by(n, &offer.id)
                .is_some_and(|o| o.status == OfferStatus::Completed && o.ratings.len() == 2)
        })
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_responses_admit_exactly_one() {
    let a = node("node-a");
    let offer = a
        .contract()
        .create_offer("alice", book(), wants_phone(), None)
        .unwrap();

    let tasks: Vec<_> = ["bob", "carol", "dave", "erin"]
        .into_iter()
        .map(|responder| {
            let node = a.clone();
            let id = offer.id.clone();
            tokio::spawn(async move {
                node.contract()
                    .respond_to_offer(&id, responder, phone())
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(offer) => {
                assert_eq!(offer.status, OfferStatus::PendingApproval);
                accepted += 1;
            }
            Err(BarterError::IllegalTransition { status, .. }) => {
                assert_eq!(status, OfferStatus::PendingApproval);
                refused += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((accepted, refused), (1, 3));
}

#[tokio::test]
async fn cancel_after_confirm_leaves_offer_confirmed() {
    let a = node("node-a");
    let contract = a.contract();
    let offer = contract
        .create_offer("alice", book(), wants_phone(), None)
        .unwrap();
    contract.respond_to_offer(&offer.id, "bob", phone()).await.unwrap();
    contract.confirm_barter(&offer.id, "alice").unwrap();

    for actor in ["alice", "bob"] {
        let err = contract.cancel_barter(&offer.id, actor).unwrap_err();
        assert!(matches!(err, BarterError::IllegalTransition { .. }));
    }
    assert_eq!(
        contract.get_offer(&offer.id).await.unwrap().status,
        OfferStatus::Confirmed
    );
}

#[tokio::test]
async fn offers_survive_restart_on_sled() {
    let dir = tempfile::tempdir().unwrap();
    let offer_id = {
        let store: Arc<dyn Store> = Arc::new(SledStore::open(dir.path()).unwrap());
        let node = BarterNode::with_id("node-a", fast_config(), store);
        let offer = node
            .contract()
            .create_offer("alice", book(), wants_phone(), None)
            .unwrap();
        offer.id
    };

    let store: Arc<dyn Store> = Arc::new(SledStore::open(dir.path()).unwrap());
    let node = BarterNode::with_id("node-a", fast_config(), store);
    let open = node.contract().open_offers();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, offer_id);
}
