//! The multi-area store front.
//!
//! Routes every request to the owning area actor (with the legacy `"0"`
//! wildcard fallback at the RPC boundary), fans peer events out to areas,
//! and owns the process-wide initialization barrier and outbound event
//! channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use kestrel_common::config::KvStoreConfig;
use kestrel_common::error::{KvStoreError, KvStoreResult};
use kestrel_proto::{
    AreaSummary, KeyDumpParams, KeySetParams, PeerSpec, PeerState, Publication, VersionedValue,
};

use crate::area::{spawn_area, AreaCommand, AreaHandle};
use crate::events::{InitializationEvent, KvStorePublication, KvStoreSyncEvent};
use crate::metrics::AreaMetricsSnapshot;
use crate::transport::PeerClientFactory;

/// The legacy wildcard area id. Requests naming it fall back to the sole
/// configured area when the node hosts exactly one.
pub const WILDCARD_AREA: &str = "0";

/// Per-area slice of a neighbor-discovery peer event.
#[derive(Debug, Clone, Default)]
pub struct AreaPeerUpdate {
    pub peers_to_add: BTreeMap<String, PeerSpec>,
    pub peers_to_del: Vec<String>,
}

/// A neighbor-discovery event: peer changes keyed by area. Areas without an
/// entry still get poked so a peerless area can complete its initial sync.
#[derive(Debug, Clone, Default)]
pub struct PeerEvent {
    pub updates: BTreeMap<String, AreaPeerUpdate>,
}

// ── Initialization barrier ───────────────────────────────────────────────

/// Emits `KVSTORE_SYNCED` exactly once, after every configured area reports
/// its initial sync complete. Spurious later reports are ignored.
pub struct InitializationBarrier {
    pending: Mutex<BTreeSet<String>>,
    emitted: AtomicBool,
    publications_tx: broadcast::Sender<KvStorePublication>,
}

impl InitializationBarrier {
    pub fn new(
        areas: BTreeSet<String>,
        publications_tx: broadcast::Sender<KvStorePublication>,
    ) -> Self {
        Self {
            pending: Mutex::new(areas),
            emitted: AtomicBool::new(false),
            publications_tx,
        }
    }

    /// Record one area's completion; fires the event when the last one
    /// lands.
    pub fn area_synced(&self, area: &str) {
        let all_done = {
            let mut pending = self.pending.lock();
            pending.remove(area);
            pending.is_empty()
        };
        if all_done && !self.emitted.swap(true, Ordering::SeqCst) {
            info!("all areas initially synced, publishing KVSTORE_SYNCED");
            let _ = self.publications_tx.send(KvStorePublication::InitializationEvent(
                InitializationEvent::KvStoreSynced,
            ));
        }
    }

    pub fn is_synced(&self) -> bool {
        self.emitted.load(Ordering::SeqCst)
    }
}

// ── Store ────────────────────────────────────────────────────────────────

/// One replicated KvStore instance: one area database per configured area.
pub struct Store {
    cfg: Arc<KvStoreConfig>,
    areas: BTreeMap<String, mpsc::Sender<AreaCommand>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    publications_tx: broadcast::Sender<KvStorePublication>,
    sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
    barrier: Arc<InitializationBarrier>,
}

impl Store {
    /// Validate the configuration and spawn one area actor per area.
    pub fn spawn(
        cfg: KvStoreConfig,
        factory: Arc<dyn PeerClientFactory>,
    ) -> KvStoreResult<Arc<Store>> {
        cfg.validate().map_err(KvStoreError::InvalidPayload)?;
        let cfg = Arc::new(cfg);

        let (publications_tx, _) = broadcast::channel(1024);
        let (sync_events_tx, _) = broadcast::channel(256);
        let barrier = Arc::new(InitializationBarrier::new(
            cfg.areas.iter().cloned().collect(),
            publications_tx.clone(),
        ));

        let mut areas = BTreeMap::new();
        let mut tasks = Vec::new();
        for area in &cfg.areas {
            let AreaHandle { tx, task, .. } = spawn_area(
                area.clone(),
                Arc::clone(&cfg),
                Arc::clone(&factory),
                publications_tx.clone(),
                sync_events_tx.clone(),
                Arc::clone(&barrier),
            );
            areas.insert(area.clone(), tx);
            tasks.push(task);
        }

        info!(node = %cfg.node_name, areas = cfg.areas.len(), "store started");
        Ok(Arc::new(Store {
            cfg,
            areas,
            tasks: Mutex::new(tasks),
            publications_tx,
            sync_events_tx,
            barrier,
        }))
    }

    pub fn config(&self) -> &KvStoreConfig {
        &self.cfg
    }

    pub fn node_name(&self) -> &str {
        &self.cfg.node_name
    }

    /// Subscribe to deltas, expirations, and the initialization event.
    pub fn subscribe_publications(&self) -> broadcast::Receiver<KvStorePublication> {
        self.publications_tx.subscribe()
    }

    /// Subscribe to per-peer SYNCING → INITIALIZED transitions.
    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<KvStoreSyncEvent> {
        self.sync_events_tx.subscribe()
    }

    /// Whether `KVSTORE_SYNCED` has been published.
    pub fn is_synced(&self) -> bool {
        self.barrier.is_synced()
    }

    /// Resolve an area id to its actor, applying the wildcard fallback: a
    /// single-area node answers for `"0"`, and a node whose only area is
    /// `"0"` answers for anything.
    fn area_tx(&self, area: &str) -> KvStoreResult<&mpsc::Sender<AreaCommand>> {
        if area.is_empty() {
            return Err(KvStoreError::InvalidArea(area.to_string()));
        }
        if let Some(tx) = self.areas.get(area) {
            return Ok(tx);
        }
        if self.areas.len() == 1
            && (area == WILDCARD_AREA || self.areas.contains_key(WILDCARD_AREA))
        {
            let (fallback, tx) = self.areas.iter().next().expect("one area checked");
            warn!(requested = %area, fallback = %fallback, "wildcard area fallback");
            return Ok(tx);
        }
        Err(KvStoreError::InvalidArea(area.to_string()))
    }

    async fn request<T>(
        &self,
        area: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> AreaCommand,
    ) -> KvStoreResult<T> {
        let tx = self.area_tx(area)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(make(reply_tx))
            .await
            .map_err(|_| KvStoreError::Internal("area database stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| KvStoreError::Internal("area database dropped request".into()))
    }

    async fn send(&self, area: &str, cmd: AreaCommand) -> KvStoreResult<()> {
        let tx = self.area_tx(area)?;
        tx.send(cmd)
            .await
            .map_err(|_| KvStoreError::Internal("area database stopped".into()))
    }

    // ── RPC surface ──────────────────────────────────────────────────────

    /// Values for the requested keys that exist locally, with the outbound
    /// TTL decrement applied.
    pub async fn get_key_vals(
        &self,
        area: &str,
        keys: Vec<String>,
    ) -> KvStoreResult<Publication> {
        self.request(area, |reply| AreaCommand::GetKeyVals { keys, reply })
            .await
    }

    /// Filtered dump. With `key_val_hashes` set this serves the responder
    /// side of a full-sync.
    pub async fn dump_key_vals(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> KvStoreResult<Publication> {
        self.request(area, |reply| AreaCommand::DumpKeyVals { params, reply })
            .await
    }

    /// Keys and metadata only; payloads omitted.
    pub async fn dump_hashes(
        &self,
        area: &str,
        params: KeyDumpParams,
    ) -> KvStoreResult<Publication> {
        self.request(area, |reply| AreaCommand::DumpHashes { params, reply })
            .await
    }

    /// Inject key-values into the merge engine; may trigger a flood.
    pub async fn set_key_vals(&self, area: &str, params: KeySetParams) -> KvStoreResult<()> {
        if params.key_vals.is_empty() {
            return Err(KvStoreError::InvalidPayload("empty key_vals in set".into()));
        }
        for (key, value) in &params.key_vals {
            if value.payload.is_some() && value.version < 1 {
                return Err(KvStoreError::InvalidPayload(format!(
                    "key {key}: version must be >= 1 for value-bearing updates"
                )));
            }
            if !value.is_infinite_ttl() && value.ttl_ms <= 0 {
                return Err(KvStoreError::InvalidPayload(format!(
                    "key {key}: non-positive ttl {}",
                    value.ttl_ms
                )));
            }
        }
        self.request(area, |reply| AreaCommand::SetKeyVals {
            params,
            reply: Some(reply),
        })
        .await
    }

    pub async fn get_peers(&self, area: &str) -> KvStoreResult<BTreeMap<String, PeerSpec>> {
        self.request(area, |reply| AreaCommand::GetPeers { reply })
            .await
    }

    /// Current sync state of a named peer, `None` if absent.
    pub async fn get_peer_state(
        &self,
        area: &str,
        peer: impl Into<String>,
    ) -> KvStoreResult<Option<PeerState>> {
        let peer = peer.into();
        self.request(area, |reply| AreaCommand::GetPeerState { peer, reply })
            .await
    }

    pub async fn add_peers(
        &self,
        area: &str,
        peers: BTreeMap<String, PeerSpec>,
    ) -> KvStoreResult<()> {
        if peers.is_empty() {
            return Err(KvStoreError::InvalidPayload("empty peer map in add".into()));
        }
        self.request(area, |reply| AreaCommand::AddPeers { peers, reply })
            .await
    }

    pub async fn del_peers(&self, area: &str, peers: Vec<String>) -> KvStoreResult<()> {
        if peers.is_empty() {
            return Err(KvStoreError::InvalidPayload("empty peer list in del".into()));
        }
        self.request(area, |reply| AreaCommand::DelPeers { peers, reply })
            .await
    }

    /// Summaries for the named areas; an empty list means all. Unknown
    /// areas are skipped with a warning, matching the legacy surface.
    pub async fn area_summaries(&self, areas: Vec<String>) -> KvStoreResult<Vec<AreaSummary>> {
        let selected: Vec<String> = if areas.is_empty() {
            self.areas.keys().cloned().collect()
        } else {
            areas
        };
        let mut summaries = Vec::with_capacity(selected.len());
        for area in selected {
            match self
                .request(&area, |reply| AreaCommand::Summary { reply })
                .await
            {
                Ok(summary) => summaries.push(summary),
                Err(e) if e.is_user_error() => {
                    warn!(area = %area, "skipping unknown area in summary");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    pub async fn counters(&self, area: &str) -> KvStoreResult<AreaMetricsSnapshot> {
        self.request(area, |reply| AreaCommand::Counters { reply })
            .await
    }

    // ── Self-originated key surface ──────────────────────────────────────

    /// Idempotent "this key is mine"; the store keeps it alive until unset.
    pub async fn persist_key(
        &self,
        area: &str,
        key: impl Into<String>,
        payload: Vec<u8>,
    ) -> KvStoreResult<()> {
        self.send(
            area,
            AreaCommand::PersistKey {
                key: key.into(),
                payload,
            },
        )
        .await
    }

    /// Forceful set at `version` (0 means current + 1).
    pub async fn set_key(
        &self,
        area: &str,
        key: impl Into<String>,
        payload: Vec<u8>,
        version: i64,
    ) -> KvStoreResult<()> {
        self.send(
            area,
            AreaCommand::SetKey {
                key: key.into(),
                payload,
                version,
            },
        )
        .await
    }

    /// Overwrite with a tombstone payload and stop refreshing the key.
    pub async fn unset_key(
        &self,
        area: &str,
        key: impl Into<String>,
        tombstone_payload: Vec<u8>,
    ) -> KvStoreResult<()> {
        self.send(
            area,
            AreaCommand::UnsetKey {
                key: key.into(),
                payload: tombstone_payload,
            },
        )
        .await
    }

    /// Drop from the self-originated cache without advertising.
    pub async fn erase_key(&self, area: &str, key: impl Into<String>) -> KvStoreResult<()> {
        self.send(area, AreaCommand::EraseKey { key: key.into() })
            .await
    }

    /// The cached self-originated key map for an area.
    pub async fn dump_self_originated(
        &self,
        area: &str,
    ) -> KvStoreResult<BTreeMap<String, VersionedValue>> {
        self.request(area, |reply| AreaCommand::DumpSelfOriginated { reply })
            .await
    }

    // ── Peer events ──────────────────────────────────────────────────────

    /// Apply a neighbor-discovery event. Every configured area is touched:
    /// areas named in the event get their peer changes, the rest get a bare
    /// poke so zero-peer areas can complete initial sync.
    pub async fn process_peer_event(&self, mut event: PeerEvent) -> KvStoreResult<()> {
        for area in self.areas.keys() {
            match event.updates.remove(area) {
                Some(update) => {
                    let has_adds = !update.peers_to_add.is_empty();
                    let has_dels = !update.peers_to_del.is_empty();
                    if has_adds {
                        self.add_peers(area, update.peers_to_add).await?;
                    }
                    if has_dels {
                        self.del_peers(area, update.peers_to_del).await?;
                    }
                    if !has_adds && !has_dels {
                        self.send(area, AreaCommand::PeerEvent).await?;
                    }
                }
                None => {
                    self.send(area, AreaCommand::PeerEvent).await?;
                }
            }
        }
        for area in event.updates.keys() {
            warn!(area = %area, "peer event for unconfigured area ignored");
        }
        Ok(())
    }

    /// Stop all area actors and wait for them to drain.
    pub async fn stop(&self) {
        for tx in self.areas.values() {
            let _ = tx.send(AreaCommand::Stop).await;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}
