//! Peer transport abstraction.
//!
//! The area database talks to peers only through [`PeerClient`], so the
//! same sync and flood machinery runs against the TCP client of the server
//! crate or against [`InProcessNetwork`] in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use kestrel_common::error::{KvStoreError, KvStoreResult};
use kestrel_proto::{KeyDumpParams, KeySetParams, PeerSpec, Publication};

use crate::store::Store;

/// Client handle to one peer's KvStore RPC surface.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Filtered dump; with `key_val_hashes` set this is the request leg of
    /// a full-sync.
    async fn get_kv(&self, area: &str, params: KeyDumpParams) -> KvStoreResult<Publication>;

    /// Inject key-values (flood or finalize-sync leg).
    async fn set_kv(&self, area: &str, params: KeySetParams) -> KvStoreResult<()>;

    /// Cheap keep-alive probe.
    async fn get_status(&self) -> KvStoreResult<()>;
}

/// Creates client handles from peer specs. One client per peer record,
/// destroyed with it.
pub trait PeerClientFactory: Send + Sync {
    fn create(&self, peer_name: &str, spec: &PeerSpec) -> KvStoreResult<Arc<dyn PeerClient>>;
}

// ── In-process transport ─────────────────────────────────────────────────

/// A registry of stores addressable by endpoint, used to wire multi-node
/// meshes inside one process. Supports fault injection: an endpoint can be
/// marked down, and calls can be delayed to widen race windows.
pub struct InProcessNetwork {
    nodes: DashMap<String, Arc<Store>>,
    down: DashMap<String, ()>,
    latency: DashMap<String, Duration>,
}

impl InProcessNetwork {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            down: DashMap::new(),
            latency: DashMap::new(),
        })
    }

    /// Make `store` reachable at `endpoint` (`host:port` of its spec).
    pub fn register(&self, endpoint: impl Into<String>, store: Arc<Store>) {
        self.nodes.insert(endpoint.into(), store);
    }

    pub fn unregister(&self, endpoint: &str) {
        self.nodes.remove(endpoint);
    }

    /// Simulate a dead endpoint; calls fail with a transport error.
    pub fn set_down(&self, endpoint: &str, down: bool) {
        if down {
            self.down.insert(endpoint.to_string(), ());
        } else {
            self.down.remove(endpoint);
        }
    }

    /// Delay every call to `endpoint`, widening in-flight windows.
    pub fn set_latency(&self, endpoint: &str, latency: Duration) {
        self.latency.insert(endpoint.to_string(), latency);
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn PeerClientFactory> {
        Arc::new(InProcessFactory {
            network: Arc::clone(self),
        })
    }

    async fn target(&self, endpoint: &str, peer: &str) -> KvStoreResult<Arc<Store>> {
        let latency = self.latency.get(endpoint).map(|d| *d);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.down.contains_key(endpoint) {
            return Err(KvStoreError::transport(peer, "endpoint down"));
        }
        match self.nodes.get(endpoint) {
            Some(store) => Ok(Arc::clone(&store)),
            None => Err(KvStoreError::transport(peer, "endpoint not registered")),
        }
    }
}

struct InProcessFactory {
    network: Arc<InProcessNetwork>,
}

impl PeerClientFactory for InProcessFactory {
    fn create(&self, peer_name: &str, spec: &PeerSpec) -> KvStoreResult<Arc<dyn PeerClient>> {
        Ok(Arc::new(InProcessClient {
            network: Arc::clone(&self.network),
            endpoint: spec.endpoint(),
            peer_name: peer_name.to_string(),
        }))
    }
}

struct InProcessClient {
    network: Arc<InProcessNetwork>,
    endpoint: String,
    peer_name: String,
}

#[async_trait]
impl PeerClient for InProcessClient {
    async fn get_kv(&self, area: &str, params: KeyDumpParams) -> KvStoreResult<Publication> {
        let store = self.network.target(&self.endpoint, &self.peer_name).await?;
        store
            .dump_key_vals(area, params)
            .await
            .map_err(|e| KvStoreError::transport(&self.peer_name, e.to_string()))
    }

    async fn set_kv(&self, area: &str, params: KeySetParams) -> KvStoreResult<()> {
        let store = self.network.target(&self.endpoint, &self.peer_name).await?;
        store
            .set_key_vals(area, params)
            .await
            .map_err(|e| KvStoreError::transport(&self.peer_name, e.to_string()))
    }

    async fn get_status(&self) -> KvStoreResult<()> {
        self.network.target(&self.endpoint, &self.peer_name).await?;
        Ok(())
    }
}
