#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{make_contact, NetworkRegistry, TestNode};
use kadmesh::{DhtConfig, DhtError, NodeId};
use tokio::time::{sleep, timeout, Duration, Instant};

/// Node ids 0x8000_0000.. all land in bucket 63 of a node with the zero id.
const FAR: u32 = 0x8000_0000;

async fn full_bucket(registry: &Arc<NetworkRegistry>) -> (TestNode, TestNode, TestNode) {
    let main = TestNode::new(registry.clone(), 0, 2, 3).await;
    let first = TestNode::new(registry.clone(), FAR, 2, 3).await;
    let second = TestNode::new(registry.clone(), FAR + 1, 2, 3).await;

    main.node
        .observe_contact(first.contact())
        .await
        .expect("bucket has room");
    main.node
        .observe_contact(second.contact())
        .await
        .expect("bucket has room");
    (main, first, second)
}

async fn bucket_ids(node: &TestNode) -> HashSet<NodeId> {
    node.node.contacts().await.into_iter().map(|c| c.id).collect()
}

#[tokio::test]
async fn full_bucket_with_live_contacts_rejects_newcomer() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;
    let newcomer = TestNode::new(registry.clone(), FAR + 2, 2, 3).await;

    let err = main
        .node
        .observe_contact(newcomer.contact())
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::BucketFull { index: 63 }));

    let ids = bucket_ids(&main).await;
    assert_eq!(ids, HashSet::from([first.id(), second.id()]));
    assert_eq!(main.network.ping_calls().await, vec![first.id()]);
}

#[tokio::test]
async fn unreachable_oldest_contact_is_replaced() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;
    let newcomer = TestNode::new(registry.clone(), FAR + 2, 2, 3).await;

    main.network.set_failure(first.id(), true).await;
    main.node
        .observe_contact(newcomer.contact())
        .await
        .expect("dead contact is evicted");

    let ids = bucket_ids(&main).await;
    assert_eq!(ids, HashSet::from([second.id(), newcomer.id()]));
}

#[tokio::test]
async fn refreshed_contact_is_not_the_eviction_candidate() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;

    // `first` is re-sighted, so `second` becomes the least recently seen.
    main.node
        .observe_contact(first.contact())
        .await
        .expect("refresh");
    main.network.set_failure(second.id(), true).await;

    let newcomer = make_contact(FAR + 5);
    main.node
        .observe_contact(newcomer.clone())
        .await
        .expect("second is evicted");

    assert_eq!(main.network.ping_calls().await, vec![second.id()]);
    let ids = bucket_ids(&main).await;
    assert_eq!(ids, HashSet::from([first.id(), newcomer.id]));
}

#[tokio::test(start_paused = true)]
async fn probe_slower_than_timeout_counts_as_unreachable() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;
    let newcomer = make_contact(FAR + 2);

    main.network
        .set_latency(first.id(), Duration::from_secs(10))
        .await;
    let start = Instant::now();
    main.node
        .observe_contact(newcomer.clone())
        .await
        .expect("timed out probe evicts");

    assert!(start.elapsed() < Duration::from_secs(1));
    let ids = bucket_ids(&main).await;
    assert_eq!(ids, HashSet::from([second.id(), newcomer.id]));
}

#[tokio::test(start_paused = true)]
async fn slow_probe_does_not_block_other_insertions() {
    let registry = Arc::new(NetworkRegistry::default());
    let config = DhtConfig {
        id_bits: 64,
        k: 2,
        probe_timeout_ms: 20_000,
        ..DhtConfig::default()
    };
    let main = TestNode::with_config(registry.clone(), make_contact(0), config).await;
    let first = TestNode::new(registry.clone(), FAR, 2, 3).await;
    let second = TestNode::new(registry.clone(), FAR + 1, 2, 3).await;
    for peer in [&first, &second] {
        main.node
            .observe_contact(peer.contact())
            .await
            .expect("bucket has room");
    }
    main.network
        .set_latency(first.id(), Duration::from_secs(10))
        .await;

    let start = Instant::now();
    let node = main.node.clone();
    let newcomer = make_contact(FAR + 2);
    let pending = tokio::spawn(async move { node.observe_contact(newcomer).await });
    tokio::task::yield_now().await;

    let elsewhere = make_contact(0x0000_0100);
    main.node
        .observe_contact(elsewhere)
        .await
        .expect("other bucket is independent");
    main.node
        .observe_contact(second.contact())
        .await
        .expect("refresh in the probed bucket");
    assert!(start.elapsed() < Duration::from_secs(1));

    let result = pending.await.expect("task completes");
    assert!(matches!(result, Err(DhtError::BucketFull { index: 63 })));
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(main.node.contacts().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn pinged_peer_answers_while_probing_its_own_full_bucket() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;

    // `main` falls into a full bucket of `first` whose eviction candidate
    // answers far slower than the probe timeout.
    let stale = make_contact(0x1);
    first
        .node
        .observe_contact(stale.clone())
        .await
        .expect("bucket has room");
    first
        .node
        .observe_contact(make_contact(0x2))
        .await
        .expect("bucket has room");
    first
        .network
        .set_latency(stale.id, Duration::from_secs(10))
        .await;
    main.network
        .set_latency(first.id(), Duration::from_millis(5))
        .await;

    let err = main
        .node
        .observe_contact(make_contact(FAR + 2))
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::BucketFull { index: 63 }));
    assert_eq!(
        bucket_ids(&main).await,
        HashSet::from([first.id(), second.id()])
    );

    // `first` finishes its own eviction in the background.
    sleep(Duration::from_secs(1)).await;
    let known = bucket_ids(&first).await;
    assert!(known.contains(&main.id()));
    assert!(!known.contains(&stale.id));
}

#[tokio::test(start_paused = true)]
async fn cancelled_eviction_leaves_bucket_intact() {
    let registry = Arc::new(NetworkRegistry::default());
    let (main, first, second) = full_bucket(&registry).await;
    main.network
        .set_latency(first.id(), Duration::from_secs(10))
        .await;

    let attempt = timeout(
        Duration::from_millis(100),
        main.node.observe_contact(make_contact(FAR + 2)),
    )
    .await;
    assert!(attempt.is_err(), "eviction should still be probing");
    assert_eq!(
        bucket_ids(&main).await,
        HashSet::from([first.id(), second.id()])
    );

    main.network.set_failure(first.id(), true).await;
    let newcomer = make_contact(FAR + 3);
    main.node
        .observe_contact(newcomer.clone())
        .await
        .expect("later eviction still works");
    assert_eq!(
        bucket_ids(&main).await,
        HashSet::from([second.id(), newcomer.id])
    );
}

#[tokio::test]
async fn node_rejects_its_own_contact() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 7, 2, 3).await;

    let err = main
        .node
        .observe_contact(main.contact())
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::SelfContact));
    assert!(main.node.contacts().await.is_empty());
}
