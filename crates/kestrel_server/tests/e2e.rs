//! End-to-end: two daemons over real TCP sockets.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use kestrel_common::config::KvStoreConfig;
use kestrel_proto::{KeyDumpParams, KeySetParams, PeerSpec, PeerState, VersionedValue};
use kestrel_server::client::{NetClient, NetClientFactory};
use kestrel_server::server::KvServer;
use kestrel_store::{PeerClient, Store};

async fn spawn_daemon(name: &str, areas: &[&str]) -> (Arc<Store>, SocketAddr) {
    let cfg = KvStoreConfig {
        node_name: name.to_string(),
        areas: areas.iter().map(|s| s.to_string()).collect(),
        key_ttl_ms: 30_000,
        ..Default::default()
    };
    let factory = Arc::new(NetClientFactory::from_config(&cfg));
    let store = Store::spawn(cfg, factory).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = KvServer::new(Arc::clone(&store));
    tokio::spawn(server.run(listener));
    (store, addr)
}

fn peer_entry(name: &str, addr: SocketAddr) -> (String, PeerSpec) {
    (
        name.to_string(),
        PeerSpec::new(addr.ip().to_string(), addr.port() as i32),
    )
}

fn set_params(key: &str, value: VersionedValue) -> KeySetParams {
    let mut key_vals = BTreeMap::new();
    key_vals.insert(key.to_string(), value);
    KeySetParams {
        key_vals,
        ..Default::default()
    }
}

async fn await_key(store: &Store, area: &str, key: &str) -> VersionedValue {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let publication = store
                .get_key_vals(area, vec![key.to_string()])
                .await
                .unwrap();
            if let Some(value) = publication.key_vals.get(key) {
                return value.clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("key {key} never arrived"))
}

fn operator_client(addr: SocketAddr) -> NetClient {
    NetClient::new(
        "operator",
        addr.to_string(),
        Duration::from_secs(1),
        Duration::from_secs(5),
        None,
    )
}

#[tokio::test]
async fn test_two_daemons_converge_over_tcp() {
    let (a, addr_a) = spawn_daemon("node-a", &["1"]).await;
    let (b, addr_b) = spawn_daemon("node-b", &["1"]).await;

    a.set_key_vals(
        "1",
        set_params("adj:node-a", VersionedValue::new(1, "node-a", Some(b"up".to_vec()), 60_000)),
    )
    .await
    .unwrap();

    a.add_peers("1", [peer_entry("node-b", addr_b)].into_iter().collect())
        .await
        .unwrap();
    b.add_peers("1", [peer_entry("node-a", addr_a)].into_iter().collect())
        .await
        .unwrap();

    let value = await_key(&b, "1", "adj:node-a").await;
    assert_eq!(value.payload, Some(b"up".to_vec()));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if a.get_peer_state("1", "node-b").await.unwrap() == Some(PeerState::Initialized)
                && b.get_peer_state("1", "node-a").await.unwrap() == Some(PeerState::Initialized)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_operator_surface_over_tcp() {
    let (_store, addr) = spawn_daemon("node-a", &["1"]).await;
    let client = operator_client(addr);

    client.get_status().await.unwrap();

    client
        .set_kv(
            "1",
            set_params("k", VersionedValue::new(1, "op", Some(b"v".to_vec()), 10_000)),
        )
        .await
        .unwrap();

    let publication = client.get_kv("1", KeyDumpParams::default()).await.unwrap();
    assert_eq!(publication.key_vals.len(), 1);
    let value = &publication.key_vals["k"];
    assert_eq!(value.payload, Some(b"v".to_vec()));
    assert!(value.content_hash.is_some());
    assert!(value.ttl_ms < 10_000);
}

#[tokio::test]
async fn test_invalid_area_surfaces_as_error() {
    let (_store, addr) = spawn_daemon("node-a", &["1", "2"]).await;
    let client = operator_client(addr);

    let err = client
        .set_kv(
            "9",
            set_params("k", VersionedValue::new(1, "op", Some(b"v".to_vec()), 10_000)),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid area"), "{err}");

    // the connection survives an application-level error
    client.get_status().await.unwrap();
}

#[tokio::test]
async fn test_wildcard_area_over_tcp() {
    let (_store, addr) = spawn_daemon("node-a", &["1"]).await;
    let client = operator_client(addr);

    client
        .set_kv(
            "0",
            set_params("k", VersionedValue::new(1, "op", Some(b"v".to_vec()), 10_000)),
        )
        .await
        .unwrap();
    let publication = client.get_kv("0", KeyDumpParams::default()).await.unwrap();
    assert!(publication.key_vals.contains_key("k"));
}
