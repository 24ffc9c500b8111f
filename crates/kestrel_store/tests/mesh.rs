//! Multi-node convergence scenarios over the in-process transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kestrel_common::config::{FloodRate, KvStoreConfig};
use kestrel_proto::{KeySetParams, PeerSpec, PeerState, Publication, VersionedValue};
use kestrel_store::{InProcessNetwork, KvStorePublication, PeerClientFactory, Store};

const CTRL_PORT: i32 = 6262;

fn endpoint(node: &str) -> String {
    format!("{node}:{CTRL_PORT}")
}

fn spawn_node(
    network: &Arc<InProcessNetwork>,
    name: &str,
    areas: &[&str],
    tweak: impl FnOnce(&mut KvStoreConfig),
) -> Arc<Store> {
    let mut cfg = KvStoreConfig {
        node_name: name.to_string(),
        areas: areas.iter().map(|s| s.to_string()).collect(),
        key_ttl_ms: 30_000,
        ..Default::default()
    };
    tweak(&mut cfg);
    let factory: Arc<dyn PeerClientFactory> = network.factory();
    let store = Store::spawn(cfg, factory).unwrap();
    network.register(endpoint(name), Arc::clone(&store));
    store
}

fn peer_entry(name: &str) -> (String, PeerSpec) {
    (name.to_string(), PeerSpec::new(name, CTRL_PORT))
}

fn set_params(key: &str, value: VersionedValue) -> KeySetParams {
    let mut key_vals = BTreeMap::new();
    key_vals.insert(key.to_string(), value);
    KeySetParams {
        key_vals,
        ..Default::default()
    }
}

async fn await_peer_state(store: &Store, area: &str, peer: &str, want: PeerState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.get_peer_state(area, peer).await.unwrap() == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("peer {peer} never reached {want}"));
}

async fn await_key(store: &Store, area: &str, key: &str) -> VersionedValue {
    await_key_matching(store, area, key, |_| true).await
}

async fn await_key_matching(
    store: &Store,
    area: &str,
    key: &str,
    pred: impl Fn(&VersionedValue) -> bool,
) -> VersionedValue {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let publication = store
                .get_key_vals(area, vec![key.to_string()])
                .await
                .unwrap();
            if let Some(value) = publication.key_vals.get(key) {
                if pred(value) {
                    return value.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("key {key} never converged"))
}

async fn full_mesh(a: &Store, b: &Store, area: &str) {
    a.add_peers(area, [peer_entry(b.node_name())].into_iter().collect())
        .await
        .unwrap();
    b.add_peers(area, [peer_entry(a.node_name())].into_iter().collect())
        .await
        .unwrap();
    await_peer_state(a, area, b.node_name(), PeerState::Initialized).await;
    await_peer_state(b, area, a.node_name(), PeerState::Initialized).await;
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_node_set_get() {
    let network = InProcessNetwork::new();
    let store = spawn_node(&network, "node-a", &["1"], |_| {});

    let mut value = VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000);
    value.ttl_version = 0;
    store.set_key_vals("1", set_params("k", value)).await.unwrap();

    let publication = store.get_key_vals("1", vec!["k".to_string()]).await.unwrap();
    let got = &publication.key_vals["k"];
    assert_eq!(got.version, 1);
    assert_eq!(got.originator_id, "node-a");
    assert_eq!(got.payload, Some(b"v".to_vec()));
    assert!(got.content_hash.is_some());
    assert!(
        got.ttl_ms >= 10_000 - store.config().ttl_decrement_ms && got.ttl_ms < 10_000,
        "ttl={}",
        got.ttl_ms
    );
}

#[tokio::test]
async fn test_version_tiebreak_converges_to_higher_originator() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});

    a.set_key_vals("1", set_params("k", VersionedValue::new(1, "node-a", Some(b"x".to_vec()), 60_000)))
        .await
        .unwrap();
    b.set_key_vals("1", set_params("k", VersionedValue::new(1, "node-b", Some(b"x".to_vec()), 60_000)))
        .await
        .unwrap();

    full_mesh(&a, &b, "1").await;

    for store in [&a, &b] {
        let value = await_key_matching(store, "1", "k", |v| v.originator_id == "node-b").await;
        assert_eq!(value.version, 1);
        assert_eq!(value.payload, Some(b"x".to_vec()));
    }
}

#[tokio::test]
async fn test_three_way_sync_exchanges_missing_keys() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});

    a.set_key_vals("1", set_params("k1", VersionedValue::new(1, "node-a", Some(b"1".to_vec()), 60_000)))
        .await
        .unwrap();
    b.set_key_vals("1", set_params("k2", VersionedValue::new(1, "node-b", Some(b"2".to_vec()), 60_000)))
        .await
        .unwrap();

    // B initiates; the finalize leg carries k2 back to A.
    b.add_peers("1", [peer_entry("node-a")].into_iter().collect())
        .await
        .unwrap();
    await_peer_state(&b, "1", "node-a", PeerState::Initialized).await;

    assert_eq!(await_key(&b, "1", "k1").await.payload, Some(b"1".to_vec()));
    assert_eq!(await_key(&a, "1", "k2").await.payload, Some(b"2".to_vec()));

    let counters = b.counters("1").await.unwrap();
    assert_eq!(counters.full_sync_success, 1);
    assert_eq!(counters.finalize_sync_sent, 1);
}

#[tokio::test]
async fn test_expiry_notifies_subscribers_only() {
    let network = InProcessNetwork::new();
    let store = spawn_node(&network, "node-a", &["1"], |_| {});
    let mut rx = store.subscribe_publications();

    store
        .set_key_vals("1", set_params("k", VersionedValue::new(1, "node-a", Some(b"x".to_vec()), 200)))
        .await
        .unwrap();

    let expired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let KvStorePublication::Publication(p) = rx.recv().await.unwrap() {
                if !p.expired_keys.is_empty() {
                    break p;
                }
            }
        }
    })
    .await
    .expect("no expiry publication");
    assert_eq!(expired.expired_keys, vec!["k".to_string()]);
    assert!(expired.key_vals.is_empty());

    let publication = store.get_key_vals("1", vec!["k".to_string()]).await.unwrap();
    assert!(publication.key_vals.is_empty());
}

#[tokio::test]
async fn test_loop_suppression_counts_and_drops() {
    let network = InProcessNetwork::new();
    let store = spawn_node(&network, "node-a", &["1"], |_| {});

    let mut params = set_params("k", VersionedValue::new(1, "node-b", Some(b"x".to_vec()), 10_000));
    params.node_path = Some(vec!["node-a".to_string(), "node-b".to_string()]);
    store.set_key_vals("1", params).await.unwrap();

    let publication = store.get_key_vals("1", vec!["k".to_string()]).await.unwrap();
    assert!(publication.key_vals.is_empty());
    let counters = store.counters("1").await.unwrap();
    assert_eq!(counters.looped_publications, 1);
    assert_eq!(counters.updated_key_vals, 0);
}

#[tokio::test]
async fn test_peer_deleted_during_sync_is_harmless() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let _b = spawn_node(&network, "node-b", &["1"], |_| {});

    // Delay B so A's full-sync response is still in flight when B vanishes.
    network.set_latency(&endpoint("node-b"), Duration::from_millis(200));
    a.add_peers("1", [peer_entry("node-b")].into_iter().collect())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.del_peers("1", vec!["node-b".to_string()]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(a.get_peer_state("1", "node-b").await.unwrap(), None);
    let counters = a.counters("1").await.unwrap();
    assert!(counters.stale_responses >= 1, "{counters:?}");
}

#[tokio::test]
async fn test_initialization_event_fires_exactly_once() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});
    let mut rx = a.subscribe_publications();
    let mut sync_rx = a.subscribe_sync_events();

    full_mesh(&a, &b, "1").await;
    assert!(a.is_synced());

    // settle, then count initialization events seen on the channel
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, KvStorePublication::InitializationEvent(_)) {
            count += 1;
        }
    }
    assert_eq!(count, 1);

    let sync_event = sync_rx.try_recv().unwrap();
    assert_eq!(sync_event.peer_name, "node-b");
    assert_eq!(sync_event.area, "1");
}

#[tokio::test]
async fn test_unreachable_peer_still_completes_initial_sync() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});

    a.add_peers("1", [peer_entry("node-ghost")].into_iter().collect())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !a.is_synced() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("initial sync never completed despite peer failure");

    assert_eq!(
        a.get_peer_state("1", "node-ghost").await.unwrap(),
        Some(PeerState::Idle)
    );
    let counters = a.counters("1").await.unwrap();
    assert!(counters.full_sync_failure >= 1);
}

#[tokio::test]
async fn test_pending_keys_ride_the_finalize_leg() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});

    // Slow B down so A's full-sync stays in flight while A takes a write.
    network.set_latency(&endpoint("node-b"), Duration::from_millis(150));
    a.add_peers("1", [peer_entry("node-b")].into_iter().collect())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    a.set_key_vals("1", set_params("k", VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 60_000)))
        .await
        .unwrap();

    await_peer_state(&a, "1", "node-b", PeerState::Initialized).await;
    assert_eq!(await_key(&b, "1", "k").await.payload, Some(b"v".to_vec()));
}

#[tokio::test]
async fn test_persist_reasserts_over_competing_update() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});
    full_mesh(&a, &b, "1").await;

    a.persist_key("1", "k", b"mine".to_vec()).await.unwrap();
    await_key_matching(&b, "1", "k", |v| v.originator_id == "node-a").await;

    // a competitor overwrites the key at a higher version
    b.set_key_vals("1", set_params("k", VersionedValue::new(5, "node-b", Some(b"theirs".to_vec()), 60_000)))
        .await
        .unwrap();

    // the originator bumps past it and reconverges the mesh on its payload
    for store in [&a, &b] {
        let value = await_key_matching(store, "1", "k", |v| {
            v.version == 6 && v.originator_id == "node-a"
        })
        .await;
        assert_eq!(value.payload, Some(b"mine".to_vec()));
    }
}

#[tokio::test]
async fn test_ttl_refresh_keeps_key_alive_across_mesh() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |cfg| cfg.key_ttl_ms = 400);
    let b = spawn_node(&network, "node-b", &["1"], |_| {});
    full_mesh(&a, &b, "1").await;

    a.persist_key("1", "k", b"v".to_vec()).await.unwrap();
    await_key(&b, "1", "k").await;

    // Well past the original 400ms lifetime the key must survive on both
    // nodes, kept alive by quarter-ttl refreshes.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let on_a = await_key(&a, "1", "k").await;
    let on_b = await_key(&b, "1", "k").await;
    assert!(on_a.ttl_version >= 1, "ttl_version={}", on_a.ttl_version);
    assert!(on_b.ttl_version >= 1, "ttl_version={}", on_b.ttl_version);
}

#[tokio::test]
async fn test_unset_tombstone_propagates() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});
    let b = spawn_node(&network, "node-b", &["1"], |_| {});
    full_mesh(&a, &b, "1").await;

    a.persist_key("1", "k", b"v".to_vec()).await.unwrap();
    let before = await_key(&b, "1", "k").await;

    a.unset_key("1", "k", b"".to_vec()).await.unwrap();
    let after = await_key_matching(&b, "1", "k", |v| v.version > before.version).await;
    assert_eq!(after.payload, Some(Vec::new()));
    assert!(a.dump_self_originated("1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rate_limited_flood_still_delivers() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |cfg| {
        cfg.flood_rate = Some(FloodRate {
            msgs_per_sec: 5,
            burst: 1,
        })
    });
    let b = spawn_node(&network, "node-b", &["1"], |_| {});
    full_mesh(&a, &b, "1").await;

    for i in 0..5 {
        let key = format!("k{i}");
        a.set_key_vals(
            "1",
            set_params(&key, VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 60_000)),
        )
        .await
        .unwrap();
    }
    for i in 0..5 {
        let key = format!("k{i}");
        await_key(&b, "1", &key).await;
    }
    let counters = a.counters("1").await.unwrap();
    assert!(counters.rate_limit_suppressions >= 1, "{counters:?}");
}

#[tokio::test]
async fn test_dump_difference_served_over_mesh() {
    let network = InProcessNetwork::new();
    let a = spawn_node(&network, "node-a", &["1"], |_| {});

    a.set_key_vals("1", set_params("k", VersionedValue::new(3, "node-a", Some(b"x".to_vec()), 60_000)))
        .await
        .unwrap();

    // a hash-only dump request holding the same record elicits nothing
    let dump = a
        .dump_hashes("1", Default::default())
        .await
        .unwrap();
    let params = kestrel_proto::KeyDumpParams {
        key_val_hashes: Some(dump.key_vals),
        sender_id: Some("probe".to_string()),
        ..Default::default()
    };
    let diff: Publication = a.dump_key_vals("1", params).await.unwrap();
    assert!(diff.key_vals.is_empty());
    assert!(diff.tobe_updated_keys.is_none());
}
