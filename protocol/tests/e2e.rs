//! End-to-end tests: several nodes in one process, linked by in-memory
//! duplex pipes instead of sockets.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use barter_protocol::barter::{OfferedItem, WantedItem};
use barter_protocol::ledger::{Block, Blockchain, Transaction, TransactionKind};
use barter_protocol::routing::RouterError;
use barter_protocol::shard::{shard_of, NewItem};
use barter_protocol::storage::MemoryStore;
use barter_protocol::{BarterNode, NodeConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.gossip.handshake_delay = Duration::from_millis(10);
    config.router.request_timeout = Duration::from_millis(300);
    config.router.retries = 1;
    config.router.retry_delay = Duration::from_millis(10);
    config.shard.request_timeout = Duration::from_millis(300);
    config.shard.scan_timeout = Duration::from_millis(100);
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

fn add_item_tx(user: &str, n: u32) -> Transaction {
    Transaction::new(TransactionKind::AddItem, user, None, json!({ "n": n }))
}

fn tip(node: &BarterNode) -> Block {
    node.ledger().read().latest_block().clone()
}

/// Pending `ADD_ITEM` transactions. Every node also pools its own `STAKE`.
fn pooled_items(node: &BarterNode) -> usize {
    node.ledger()
        .read()
        .pending_transactions()
        .iter()
        .filter(|tx| tx.kind == TransactionKind::AddItem)
        .count()
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn latest_block_is_appended_without_full_chain() {
    let a = node("node-a");
    for n in 0..3 {
        assert!(a.submit_transaction(add_item_tx("alice", n)).unwrap());
    }
    let block = a.produce_block().unwrap();
    let kinds: Vec<TransactionKind> = block.transactions.iter().map(|tx| tx.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == TransactionKind::AddItem).count(),
        3
    );
    assert!(kinds.contains(&TransactionKind::Stake));

    let b = node("node-b");
    assert_eq!(tip(&b).hash, block.previous_hash);

    // Linking makes each side send QUERY_LATEST; A answers with its tip.
    link(&a, &b);
    eventually("B to append A's block", || b.ledger().read().len() == 2).await;

    assert_eq!(tip(&b), block);
    assert!(b.ledger().read().is_valid());
}

#[tokio::test]
async fn transactions_and_blocks_propagate() {
    let a = node("node-a");
    let b = node("node-b");
    link(&a, &b);
    eventually("handshake", || {
        a.network().peer_count() == 1 && b.network().peer_count() == 1
    })
    .await;

    a.submit_transaction(add_item_tx("alice", 1)).unwrap();
    eventually("B to pool the transaction", || pooled_items(&b) == 1).await;

    a.produce_block().unwrap();
    eventually("B to adopt the block", || tip(&b) == tip(&a)).await;
    assert_eq!(pooled_items(&b), 0);
    // A's configured stake reached B inside the block.
    assert_eq!(b.ledger().read().validators().stake_of(a.id()), 10);
}

#[tokio::test]
async fn relayed_transaction_crosses_a_line_once() {
    let a = node("node-a");
    let b = node("node-b");
    let c = node("node-c");
    link(&a, &b);
    link(&b, &c);

    a.submit_transaction(add_item_tx("alice", 7)).unwrap();
    eventually("C to pool the relayed transaction", || pooled_items(&c) == 1).await;

    // Echoes from B and C are dropped by the seen cache.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pooled_items(&a), 1);
    assert_eq!(pooled_items(&b), 1);
}

#[tokio::test]
async fn heavier_chain_wins_after_partition() {
    // Both nodes know only their own configured stake.
    let a = node("node-a");
    let b = node("node-b");
    assert_eq!(b.ledger().read().validators().stake_of(a.id()), 0);

    for n in 0..5 {
        a.submit_transaction(add_item_tx("alice", n)).unwrap();
        a.produce_block().unwrap();
    }
    b.submit_transaction(add_item_tx("bob", 9)).unwrap();
    b.produce_block().unwrap();
    assert_ne!(tip(&a).hash, tip(&b).hash);

    link(&a, &b);
    eventually("B to switch to A's chain", || tip(&b) == tip(&a)).await;
    // Give A time to hear B's old tip and refuse it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let chain = b.ledger().read().chain().to_vec();
    assert_eq!(chain.len(), 6);
    assert_eq!(a.ledger().read().len(), 6);
    assert_eq!(tip(&a), tip(&b));
    assert!(Blockchain::is_chain_valid(&chain));
    for pair in chain.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].hash);
    }

    // B's own block was discarded; its transactions wait for the next one.
    let requeued: Vec<TransactionKind> = b
        .ledger()
        .read()
        .pending_transactions()
        .iter()
        .map(|tx| tx.kind)
        .collect();
    assert!(requeued.contains(&TransactionKind::AddItem));
    assert!(requeued.contains(&TransactionKind::Stake));
    assert!(!requeued.contains(&TransactionKind::Reward));
}

#[tokio::test]
async fn forked_nodes_converge_whichever_side_is_longer() {
    let a = node("node-a");
    let b = node("node-b");
    a.submit_transaction(add_item_tx("alice", 1)).unwrap();
    a.produce_block().unwrap();
    for n in 0..3 {
        b.submit_transaction(add_item_tx("bob", n)).unwrap();
        b.produce_block().unwrap();
    }

    link(&a, &b);
    eventually("A to switch to B's chain", || tip(&a) == tip(&b)).await;
    assert_eq!(a.ledger().read().len(), 4);
    assert_eq!(a.ledger().read().validators().stake_of(b.id()), 10);

    // Re-mining the discarded work extends the shared chain for both.
    a.produce_block().unwrap();
    eventually("B to append A's next block", || tip(&b) == tip(&a)).await;
    assert_eq!(b.ledger().read().len(), 5);
    assert_eq!(b.ledger().read().validators().stake_of(a.id()), 10);
}

#[tokio::test]
async fn mined_chains_stay_valid() {
    let a = node("node-a");
    for n in 0..25 {
        a.submit_transaction(add_item_tx("alice", n)).unwrap();
        a.produce_block().unwrap();
    }
    let ledger = a.ledger().read();
    assert_eq!(ledger.len(), 26);
    assert!(ledger.is_valid());
    assert!(ledger
        .chain()
        .windows(2)
        .all(|pair| pair[1].previous_hash == pair[0].hash));
}

// ---------------------------------------------------------------------------
// Data routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offers_are_fetched_from_peers_and_cached() {
    let a = node("node-a");
    let offer = a
        .contract()
        .create_offer(
            "alice",
            OfferedItem::new("i1", "book"),
            WantedItem {
                description: "phone".into(),
            },
            None,
        )
        .unwrap();

    // Linked after creation, so B never saw CONTRACT_OFFER.
    let b = node("node-b");
    link(&a, &b);
    eventually("link", || b.network().connection_count() == 1).await;

    let fetched = b.data_router().request_offer(&offer.id).await.unwrap();
    assert_eq!(fetched, offer);
    assert_eq!(b.data_router().cached_entries(), 1);
    // Remote data never becomes locally authoritative.
    assert!(b
        .data_router()
        .get_local(&barter_protocol::routing::offer_key(&offer.id))
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_key_exhausts_retries() {
    let mut config = NodeConfig::default();
    config.router.request_timeout = Duration::from_secs(5);
    config.router.retries = 3;
    config.router.retry_delay = Duration::from_secs(1);
    let lonely = BarterNode::with_id("lonely", config, Arc::new(MemoryStore::new()));

    let started = tokio::time::Instant::now();
    let err = lonely.data_router().request("offer:nope").await.unwrap_err();
    assert!(matches!(err, RouterError::NotFound(ref key) if key == "offer:nope"));
    assert!(started.elapsed() >= Duration::from_secs(3 * 5));
}

// ---------------------------------------------------------------------------
// Sharding
// ---------------------------------------------------------------------------

/// A user whose shard belongs to `owner` and not to `other`.
fn user_owned_by(owner: &BarterNode, other: &BarterNode) -> String {
    (0..100_000)
        .map(|i| format!("user-{i}"))
        .find(|u| {
            let shard = shard_of(u);
            owner.shard_router().is_local(shard) && !other.shard_router().is_local(shard)
        })
        .expect("some user lands in the owner's shards")
}

#[tokio::test]
async fn remote_items_reach_their_shard_owner() {
    let a = node("node-a");
    let b = node("node-b");
    link(&a, &b);
    eventually("link", || {
        a.network().connection_count() == 1 && b.network().connection_count() == 1
    })
    .await;

    let user = user_owned_by(&b, &a);
    let shard = shard_of(&user);
    let item = a
        .shard_router()
        .add_item(&user, NewItem::new("lamp", "brass"))
        .unwrap();

    let mut seen = false;
    for _ in 0..300 {
        let owned = b.shard_router().get_user_items(&user).await.unwrap();
        if owned.iter().any(|i| i.id == item.id) {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "B's view never received the item");

    let remote = a.shard_router().request_shard_data(shard).await.unwrap();
    assert!(remote.iter().any(|i| i.id == item.id));

    let market = a.shard_router().get_all_available_items().await;
    assert_eq!(market.iter().filter(|i| i.id == item.id).count(), 1);
}

#[tokio::test]
async fn market_scan_without_peers_is_local_only() {
    let a = node("node-a");
    let user = (0..100_000)
        .map(|i| format!("u{i}"))
        .find(|u| a.shard_router().is_local(shard_of(u)))
        .unwrap();
    a.shard_router()
        .add_item(&user, NewItem::new("kettle", ""))
        .unwrap();

    let items = a.shard_router().get_all_available_items().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].user_id, user);
}
