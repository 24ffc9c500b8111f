//! The per-area database actor.
//!
//! One `AreaDb` owns an area's key-value map, TTL queue, peer table, and
//! self-originated key cache. All mutation happens on the actor task: RPC
//! handlers and peer-call completions arrive as [`AreaCommand`] messages,
//! timers are deadlines folded into the actor's `select!` loop. Outbound
//! RPCs run on spawned tasks and re-enter the actor as
//! [`AreaCommand::PeerCallDone`]; every completion re-looks the peer up by
//! name, so a peer deleted mid-flight turns the callback into a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_common::config::KvStoreConfig;
use kestrel_common::constants;
use kestrel_common::error::{KvStoreError, KvStoreResult};
use kestrel_proto::{
    AreaSummary, FilterOperator, KeyDumpParams, KeySetParams, PeerSpec, PeerState, Publication,
    VersionedValue,
};

use crate::events::{KvStorePublication, KvStoreSyncEvent};
use crate::filter::KeyFilters;
use crate::merge::{
    dump_all_with_filters, dump_difference, dump_hashes_with_filters, merge_key_values, KeyEntry,
    KeyValueMap,
};
use crate::metrics::{AreaMetrics, AreaMetricsSnapshot};
use crate::peer::{PeerRecord, PeerSyncEvent};
use crate::self_origin::SelfOriginatedEntry;
use crate::store::InitializationBarrier;
use crate::token_bucket::FloodLimiter;
use crate::transport::PeerClientFactory;
use crate::ttl::{decrement_publication_ttl, TtlQueue};

// ── Commands ─────────────────────────────────────────────────────────────

/// Messages processed on the area actor.
pub(crate) enum AreaCommand {
    GetKeyVals {
        keys: Vec<String>,
        reply: oneshot::Sender<Publication>,
    },
    DumpKeyVals {
        params: KeyDumpParams,
        reply: oneshot::Sender<Publication>,
    },
    DumpHashes {
        params: KeyDumpParams,
        reply: oneshot::Sender<Publication>,
    },
    SetKeyVals {
        params: KeySetParams,
        reply: Option<oneshot::Sender<()>>,
    },
    GetPeers {
        reply: oneshot::Sender<BTreeMap<String, PeerSpec>>,
    },
    GetPeerState {
        peer: String,
        reply: oneshot::Sender<Option<PeerState>>,
    },
    AddPeers {
        peers: BTreeMap<String, PeerSpec>,
        reply: oneshot::Sender<()>,
    },
    DelPeers {
        peers: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Summary {
        reply: oneshot::Sender<AreaSummary>,
    },
    Counters {
        reply: oneshot::Sender<AreaMetricsSnapshot>,
    },
    PersistKey {
        key: String,
        payload: Vec<u8>,
    },
    SetKey {
        key: String,
        payload: Vec<u8>,
        version: i64,
    },
    UnsetKey {
        key: String,
        payload: Vec<u8>,
    },
    EraseKey {
        key: String,
    },
    DumpSelfOriginated {
        reply: oneshot::Sender<BTreeMap<String, VersionedValue>>,
    },
    /// Peer-event poke with no add/del content; lets a zero-peer area count
    /// as initially synced.
    PeerEvent,
    PeerCallDone {
        peer: String,
        call: PeerCallOutcome,
        elapsed: Duration,
    },
    Stop,
}

/// Completion of one outbound peer RPC.
pub(crate) enum PeerCallOutcome {
    FullSync(KvStoreResult<Publication>),
    Flood(KvStoreResult<()>),
    FinalizeSync(KvStoreResult<()>),
    Probe(KvStoreResult<()>),
}

/// Handle to a spawned area actor.
pub(crate) struct AreaHandle {
    pub tx: mpsc::Sender<AreaCommand>,
    pub metrics: Arc<AreaMetrics>,
    pub task: JoinHandle<()>,
}

pub(crate) fn spawn_area(
    area: String,
    cfg: Arc<KvStoreConfig>,
    factory: Arc<dyn PeerClientFactory>,
    publications_tx: broadcast::Sender<KvStorePublication>,
    sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
    barrier: Arc<InitializationBarrier>,
) -> AreaHandle {
    let (tx, rx) = mpsc::channel(1024);
    let metrics = Arc::new(AreaMetrics::default());
    let db = AreaDb::new(
        area,
        cfg,
        factory,
        publications_tx,
        sync_events_tx,
        barrier,
        Arc::clone(&metrics),
        tx.clone(),
    );
    let task = tokio::spawn(db.run(rx));
    AreaHandle { tx, metrics, task }
}

// ── The actor ────────────────────────────────────────────────────────────

pub(crate) struct AreaDb {
    area: String,
    node_name: String,
    cfg: Arc<KvStoreConfig>,
    request_timeout: Duration,

    map: KeyValueMap,
    ttl_queue: TtlQueue,
    peers: BTreeMap<String, PeerRecord>,
    /// Ingress filter; present only in leaf-node mode.
    ingress_filters: Option<KeyFilters>,

    self_originated: BTreeMap<String, SelfOriginatedEntry>,
    keys_to_advertise: BTreeSet<String>,
    keys_to_unset: BTreeMap<String, VersionedValue>,

    flood_limiter: Option<FloodLimiter>,
    flood_buffer: BTreeSet<String>,

    parallel_sync_limit: u32,
    initial_sync_completed: bool,

    metrics: Arc<AreaMetrics>,
    factory: Arc<dyn PeerClientFactory>,
    publications_tx: broadcast::Sender<KvStorePublication>,
    sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
    barrier: Arc<InitializationBarrier>,
    self_tx: mpsc::Sender<AreaCommand>,

    sync_retry_at: Option<Instant>,
    advertise_at: Option<Instant>,
    ttl_refresh_at: Option<Instant>,
    unset_drain_at: Option<Instant>,
    flood_drain_at: Option<Instant>,
}

fn unix_ts_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

impl AreaDb {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        area: String,
        cfg: Arc<KvStoreConfig>,
        factory: Arc<dyn PeerClientFactory>,
        publications_tx: broadcast::Sender<KvStorePublication>,
        sync_events_tx: broadcast::Sender<KvStoreSyncEvent>,
        barrier: Arc<InitializationBarrier>,
        metrics: Arc<AreaMetrics>,
        self_tx: mpsc::Sender<AreaCommand>,
    ) -> Self {
        let ingress_filters = if cfg.filters.set_leaf_node {
            Some(KeyFilters::new(
                cfg.filters.key_prefix_filters.clone(),
                cfg.filters.key_originator_id_filters.iter().cloned().collect(),
                FilterOperator::Or,
            ))
        } else {
            None
        };
        let flood_limiter = cfg.flood_rate.map(FloodLimiter::new);
        Self {
            node_name: cfg.node_name.clone(),
            request_timeout: Duration::from_millis(cfg.sync.request_timeout_ms),
            area,
            cfg,
            map: KeyValueMap::new(),
            ttl_queue: TtlQueue::new(),
            peers: BTreeMap::new(),
            ingress_filters,
            self_originated: BTreeMap::new(),
            keys_to_advertise: BTreeSet::new(),
            keys_to_unset: BTreeMap::new(),
            flood_limiter,
            flood_buffer: BTreeSet::new(),
            parallel_sync_limit: constants::PARALLEL_SYNC_LIMIT_INITIAL,
            initial_sync_completed: false,
            metrics,
            factory,
            publications_tx,
            sync_events_tx,
            barrier,
            self_tx,
            sync_retry_at: None,
            advertise_at: None,
            ttl_refresh_at: None,
            unset_drain_at: None,
            flood_drain_at: None,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<AreaCommand>) {
        info!(area = %self.area, node = %self.node_name, "area database started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    match maybe_cmd {
                        Some(AreaCommand::Stop) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.on_timer(Instant::now());
                }
            }
        }
        info!(area = %self.area, "area database stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = self.ttl_queue.next_expiry();
        deadline = min_deadline(deadline, self.sync_retry_at);
        deadline = min_deadline(deadline, self.advertise_at);
        deadline = min_deadline(deadline, self.ttl_refresh_at);
        deadline = min_deadline(deadline, self.unset_drain_at);
        deadline = min_deadline(deadline, self.flood_drain_at);
        for rec in self.peers.values() {
            if rec.client.is_some() {
                deadline = min_deadline(deadline, Some(rec.keep_alive_at));
            }
        }
        deadline
    }

    fn on_timer(&mut self, now: Instant) {
        if self.ttl_queue.next_expiry().is_some_and(|at| at <= now) {
            self.evict_expired_keys(now);
        }
        if self.sync_retry_at.is_some_and(|at| at <= now) {
            self.sync_retry_at = None;
            self.run_sync_scan(now);
        }
        if self.advertise_at.is_some_and(|at| at <= now) {
            self.advertise_at = None;
            self.advertise_pending_keys(now);
        }
        if self.ttl_refresh_at.is_some_and(|at| at <= now) {
            self.ttl_refresh_at = None;
            self.advertise_ttl_refreshes(now);
        }
        if self.unset_drain_at.is_some_and(|at| at <= now) {
            self.unset_drain_at = None;
            self.drain_unset_keys();
        }
        if self.flood_drain_at.is_some_and(|at| at <= now) {
            self.flood_drain_at = None;
            self.drain_flood_buffer(now);
        }
        self.run_keep_alive_probes(now);
    }

    fn handle_command(&mut self, cmd: AreaCommand) {
        match cmd {
            AreaCommand::GetKeyVals { keys, reply } => {
                let _ = reply.send(self.get_key_vals(&keys));
            }
            AreaCommand::DumpKeyVals { params, reply } => {
                let _ = reply.send(self.dump_key_vals(params));
            }
            AreaCommand::DumpHashes { params, reply } => {
                let _ = reply.send(self.dump_hashes(params));
            }
            AreaCommand::SetKeyVals { params, reply } => {
                self.ingest_set(params);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            AreaCommand::GetPeers { reply } => {
                let peers = self
                    .peers
                    .iter()
                    .map(|(name, rec)| (name.clone(), rec.spec.clone()))
                    .collect();
                let _ = reply.send(peers);
            }
            AreaCommand::GetPeerState { peer, reply } => {
                let _ = reply.send(self.peers.get(&peer).map(|r| r.spec.state));
            }
            AreaCommand::AddPeers { peers, reply } => {
                self.add_peers(peers);
                let _ = reply.send(());
            }
            AreaCommand::DelPeers { peers, reply } => {
                self.del_peers(&peers);
                let _ = reply.send(());
            }
            AreaCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            AreaCommand::Counters { reply } => {
                let _ = reply.send(self.metrics.snapshot());
            }
            AreaCommand::PersistKey { key, payload } => self.persist_key(key, payload),
            AreaCommand::SetKey {
                key,
                payload,
                version,
            } => self.set_self_originated_key(key, payload, version),
            AreaCommand::UnsetKey { key, payload } => self.unset_key(key, payload),
            AreaCommand::EraseKey { key } => self.erase_key(&key),
            AreaCommand::DumpSelfOriginated { reply } => {
                let dump = self
                    .self_originated
                    .iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect();
                let _ = reply.send(dump);
            }
            AreaCommand::PeerEvent => {
                self.check_initialization();
            }
            AreaCommand::PeerCallDone {
                peer,
                call,
                elapsed,
            } => self.on_peer_call_done(peer, call, elapsed),
            AreaCommand::Stop => unreachable!("Stop is handled by the run loop"),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────

    fn get_key_vals(&self, keys: &[String]) -> Publication {
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(entry) = self.map.get(key) {
                publication
                    .key_vals
                    .insert(key.clone(), entry.value.clone());
            }
        }
        self.apply_outbound_ttl(&mut publication);
        publication
    }

    fn dump_key_vals(&self, params: KeyDumpParams) -> Publication {
        let filters = KeyFilters::from_dump_params(&params);
        let mut publication =
            dump_all_with_filters(&self.area, &self.map, &filters, params.do_not_publish_value);
        if let Some(peer_hashes) = &params.key_val_hashes {
            publication = dump_difference(&self.area, publication.key_vals, peer_hashes);
            if filters.prefixes().is_empty() {
                // Unfiltered hash exchange: this is a neighbor's full-sync.
                info!(
                    area = %self.area,
                    sender = params.sender_id.as_deref().unwrap_or(""),
                    peer_hashes = peer_hashes.len(),
                    key_vals = publication.key_vals.len(),
                    missing_keys = publication
                        .tobe_updated_keys
                        .as_ref()
                        .map_or(0, |k| k.len()),
                    "served full-sync request"
                );
            }
        }
        self.apply_outbound_ttl(&mut publication);
        publication
    }

    fn dump_hashes(&self, params: KeyDumpParams) -> Publication {
        let filters = KeyFilters::from_dump_params(&params);
        let mut publication = dump_hashes_with_filters(&self.area, &self.map, &filters);
        self.apply_outbound_ttl(&mut publication);
        publication
    }

    fn summary(&self) -> AreaSummary {
        let peers = self
            .peers
            .iter()
            .map(|(name, rec)| (name.clone(), rec.spec.clone()))
            .collect();
        let total_bytes = self
            .map
            .iter()
            .map(|(key, entry)| {
                key.len()
                    + entry.value.originator_id.len()
                    + entry.value.payload.as_ref().map_or(0, Vec::len)
            })
            .sum::<usize>() as i64;
        AreaSummary {
            area: self.area.clone(),
            peers,
            key_count: self.map.len() as i64,
            total_bytes,
        }
    }

    fn apply_outbound_ttl(&self, publication: &mut Publication) {
        decrement_publication_ttl(
            publication,
            &self.map,
            Instant::now(),
            self.cfg.ttl_decrement_ms,
        );
    }

    // ── Ingress ──────────────────────────────────────────────────────────

    /// Entry point for every write: external `set` RPCs, floods from peers,
    /// finalize-sync legs, and local self-originated advertisements.
    fn ingest_set(&mut self, mut params: KeySetParams) {
        if let Some(ts) = params.timestamp_ms {
            let lag = unix_ts_ms() - ts;
            if lag > 0 {
                debug!(area = %self.area, flood_ms = lag, "publication flood lag");
            }
        }
        for value in params.key_vals.values_mut() {
            if value.payload.is_some() {
                value.content_hash = Some(value.compute_hash());
            }
        }

        let mut publication = Publication::new(&self.area);
        publication.key_vals = params.key_vals;
        publication.node_path = params.node_path;
        self.merge_publication(publication, None);
    }

    /// Merge a received publication into the map, flood the resulting
    /// delta, and (for full-sync responses) fire the finalize leg back to
    /// `sync_peer`. Returns the number of accepted updates.
    fn merge_publication(&mut self, rcvd: Publication, sync_peer: Option<&str>) -> usize {
        AreaMetrics::incr(&self.metrics.received_publications);
        AreaMetrics::add(&self.metrics.received_key_vals, rcvd.key_vals.len() as u64);

        let mut keys_tobe_updated: BTreeSet<String> = rcvd
            .tobe_updated_keys
            .iter()
            .flatten()
            .cloned()
            .collect();
        if let Some(peer_name) = sync_peer {
            if let Some(rec) = self.peers.get_mut(peer_name) {
                keys_tobe_updated.append(&mut rec.pending_keys);
            }
        }
        let need_finalize = sync_peer.is_some() && !keys_tobe_updated.is_empty();

        if rcvd.key_vals.is_empty() && !need_finalize {
            return 0;
        }

        if rcvd
            .node_path
            .as_ref()
            .is_some_and(|path| path.iter().any(|n| n == &self.node_name))
        {
            AreaMetrics::incr(&self.metrics.looped_publications);
            debug!(area = %self.area, "dropped looped publication");
            return 0;
        }

        let result = merge_key_values(&self.map, &rcvd.key_vals, self.ingress_filters.as_ref());
        AreaMetrics::add(&self.metrics.filtered_keys, result.filtered);
        AreaMetrics::add(&self.metrics.updated_key_vals, result.delta.len() as u64);
        let update_count = result.delta.len();

        let now = Instant::now();
        for (key, value) in &result.delta {
            let expires_at = if value.is_infinite_ttl() {
                None
            } else {
                // checked_add guards against absurd ttls overflowing Instant
                now.checked_add(Duration::from_millis(value.ttl_ms.max(0) as u64))
            };
            if let Some(at) = expires_at {
                self.ttl_queue.schedule(key, value, at);
            }
            self.map.insert(
                key.clone(),
                KeyEntry {
                    value: value.clone(),
                    expires_at,
                },
            );
        }

        if update_count > 0 {
            let mut delta = Publication::new(&self.area);
            delta.key_vals = result.delta;
            delta.node_path = rcvd.node_path.clone();
            self.flood_publication(delta, true);
        } else {
            AreaMetrics::incr(&self.metrics.redundant_publications);
        }

        if need_finalize {
            if let Some(peer_name) = sync_peer {
                self.finalize_full_sync(keys_tobe_updated, peer_name);
            }
        }

        update_count
    }

    // ── TTL eviction ─────────────────────────────────────────────────────

    fn evict_expired_keys(&mut self, now: Instant) {
        let expired = self.ttl_queue.evict_expired(now, &mut self.map);
        if expired.is_empty() {
            return;
        }
        AreaMetrics::add(&self.metrics.expired_key_vals, expired.len() as u64);
        warn!(area = %self.area, count = expired.len(), keys = ?expired, "expired keys evicted");

        // Expired keys go to in-process subscribers only; every peer runs
        // its own TTL clock.
        let mut publication = Publication::new(&self.area);
        publication.expired_keys = expired;
        self.flood_publication(publication, true);
    }

    // ── Flooding ─────────────────────────────────────────────────────────

    fn flood_publication(&mut self, mut publication: Publication, rate_limit: bool) {
        if rate_limit {
            if let Some(limiter) = self.flood_limiter.as_mut() {
                if !limiter.try_consume(1) {
                    AreaMetrics::incr(&self.metrics.rate_limit_suppressions);
                    self.buffer_publication(&publication);
                    self.flood_drain_at = min_deadline(
                        self.flood_drain_at,
                        Some(Instant::now() + constants::FLOOD_BUFFER_DRAIN_DELAY),
                    );
                    return;
                }
            }
            if !self.flood_buffer.is_empty() {
                // Later updates must not overtake buffered ones; coalesce
                // and ship the whole buffer now that a token is available.
                self.buffer_publication(&publication);
                self.drain_flood_buffer(Instant::now());
                return;
            }
        }

        self.apply_outbound_ttl(&mut publication);
        if publication.is_empty() {
            return;
        }

        let sender_id = publication
            .node_path
            .as_ref()
            .and_then(|path| path.last().cloned());
        publication
            .node_path
            .get_or_insert_with(Vec::new)
            .push(self.node_name.clone());
        publication.timestamp_ms = Some(unix_ts_ms());

        // In-process subscribers get the full publication, expirations
        // included.
        let _ = self
            .publications_tx
            .send(KvStorePublication::Publication(publication.clone()));

        self.reconcile_self_originated(&publication);

        if publication.key_vals.is_empty() {
            return;
        }

        let params = KeySetParams {
            key_vals: publication.key_vals.clone(),
            node_path: publication.node_path.clone(),
            timestamp_ms: publication.timestamp_ms,
            sender_id: Some(self.node_name.clone()),
        };
        let flood_keys: Vec<String> = params.key_vals.keys().cloned().collect();
        debug!(
            area = %self.area,
            keys = flood_keys.len(),
            sender = sender_id.as_deref().unwrap_or(""),
            "flooding publication"
        );

        let peer_names: Vec<String> = self.peers.keys().cloned().collect();
        for peer_name in peer_names {
            if sender_id.as_deref() == Some(peer_name.as_str()) {
                continue;
            }
            let rec = self.peers.get_mut(&peer_name).expect("peer listed above");
            if rec.spec.state != PeerState::Initialized || rec.client.is_none() {
                // Queue for the finalize leg of this peer's full-sync.
                rec.pending_keys.extend(flood_keys.iter().cloned());
                continue;
            }
            let client = rec.client.clone().expect("checked above");
            AreaMetrics::incr(&self.metrics.flood_publications);
            let tx = self.self_tx.clone();
            let area = self.area.clone();
            let timeout = self.request_timeout;
            let call_params = params.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(
                    timeout,
                    client.set_kv(&area, call_params),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(KvStoreError::transport(&peer_name, "flood timeout")),
                };
                let _ = tx
                    .send(AreaCommand::PeerCallDone {
                        peer: peer_name,
                        call: PeerCallOutcome::Flood(result),
                        elapsed: start.elapsed(),
                    })
                    .await;
            });
        }
    }

    fn buffer_publication(&mut self, publication: &Publication) {
        for key in publication.key_vals.keys() {
            self.flood_buffer.insert(key.clone());
        }
        for key in &publication.expired_keys {
            self.flood_buffer.insert(key.clone());
        }
    }

    /// Drain the coalesced flood buffer: each buffered key ships its current
    /// map record, or rides as expired if it is gone.
    fn drain_flood_buffer(&mut self, _now: Instant) {
        if self.flood_buffer.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.flood_buffer);
        let mut publication = Publication::new(&self.area);
        for key in keys {
            match self.map.get(&key) {
                Some(entry) => {
                    publication.key_vals.insert(key, entry.value.clone());
                }
                None => publication.expired_keys.push(key),
            }
        }
        self.flood_drain_at = None;
        // Forwarding coalesced updates: no further rate limiting.
        self.flood_publication(publication, false);
    }

    // ── Full-sync ────────────────────────────────────────────────────────

    /// Scan IDLE peers and promote up to the parallel-sync cap into
    /// SYNCING, dispatching a hash-exchange dump request to each.
    fn run_sync_scan(&mut self, now: Instant) {
        let mut timeout = constants::MAX_BACKOFF;
        let mut num_syncing = self.count_peers(PeerState::Syncing);

        let idle_peers: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, rec)| rec.spec.state == PeerState::Idle)
            .map(|(name, _)| name.clone())
            .collect();

        for peer_name in idle_peers {
            let rec = self.peers.get_mut(&peer_name).expect("listed above");
            if !rec.backoff.can_try_now() {
                timeout = timeout.min(rec.backoff.time_remaining_until_retry());
                continue;
            }
            if rec.client.is_none() {
                match self.factory.create(&peer_name, &rec.spec) {
                    Ok(client) => rec.client = Some(client),
                    Err(e) => {
                        warn!(area = %self.area, peer = %peer_name, error = %e,
                              "peer client creation failed");
                        rec.backoff.report_error();
                        timeout = timeout.min(rec.backoff.time_remaining_until_retry());
                        continue;
                    }
                }
            }

            let (old, new) = rec.transition(PeerSyncEvent::PeerAdd);
            info!(area = %self.area, peer = %peer_name, %old, %new, "peer state change");
            num_syncing += 1;

            let client = rec.client.clone().expect("created above");
            let params = self.full_sync_params();
            AreaMetrics::incr(&self.metrics.full_sync_started);
            info!(area = %self.area, peer = %peer_name, "initiating full-sync");

            let tx = self.self_tx.clone();
            let area = self.area.clone();
            let request_timeout = self.request_timeout;
            tokio::spawn(async move {
                let start = Instant::now();
                let result =
                    match tokio::time::timeout(request_timeout, client.get_kv(&area, params)).await
                    {
                        Ok(res) => res,
                        Err(_) => Err(KvStoreError::transport(&peer_name, "full-sync timeout")),
                    };
                let _ = tx
                    .send(AreaCommand::PeerCallDone {
                        peer: peer_name,
                        call: PeerCallOutcome::FullSync(result),
                        elapsed: start.elapsed(),
                    })
                    .await;
            });

            if num_syncing > self.parallel_sync_limit {
                info!(
                    area = %self.area,
                    syncing = num_syncing,
                    limit = self.parallel_sync_limit,
                    "parallel-sync cap reached, deferring remaining peers"
                );
                timeout = constants::MAX_BACKOFF;
                break;
            }
        }

        let num_idle = self.count_peers(PeerState::Idle);
        if num_idle > 0 || num_syncing > self.parallel_sync_limit {
            self.sync_retry_at = min_deadline(self.sync_retry_at, Some(now + timeout));
        }
    }

    /// Dump params for the request leg of a full-sync: the full hash set,
    /// plus this node's filter prefixes when running as a leaf.
    fn full_sync_params(&self) -> KeyDumpParams {
        let mut params = KeyDumpParams {
            sender_id: Some(self.node_name.clone()),
            ..Default::default()
        };
        if self.cfg.filters.set_leaf_node {
            let prefixes = &self.cfg.filters.key_prefix_filters;
            params.prefix = prefixes.join(",");
            if !prefixes.is_empty() {
                params.keys = Some(prefixes.clone());
            }
            params.originator_ids = self
                .cfg
                .filters
                .key_originator_id_filters
                .iter()
                .cloned()
                .collect();
        }
        let hash_dump = dump_hashes_with_filters(&self.area, &self.map, &KeyFilters::match_all());
        params.key_val_hashes = Some(hash_dump.key_vals);
        params
    }

    fn count_peers(&self, state: PeerState) -> u32 {
        self.peers
            .values()
            .filter(|rec| rec.spec.state == state)
            .count() as u32
    }

    /// Full-sync response arrived: merge it, advance the peer to
    /// INITIALIZED, and widen the parallel-sync cap.
    fn on_full_sync_response(&mut self, peer_name: &str, publication: Publication, elapsed: Duration) {
        let Some(rec) = self.peers.get(peer_name) else {
            AreaMetrics::incr(&self.metrics.stale_responses);
            warn!(area = %self.area, peer = %peer_name,
                  "full-sync response for unknown peer, dropping");
            return;
        };
        // A parallel re-add can reset the peer to IDLE while the old
        // response is in flight; the newer sync will promote it.
        if rec.spec.state == PeerState::Idle {
            AreaMetrics::incr(&self.metrics.stale_responses);
            warn!(area = %self.area, peer = %peer_name,
                  "full-sync response for IDLE peer, dropping");
            return;
        }

        let key_vals = publication.key_vals.len();
        let missing = publication.tobe_updated_keys.as_ref().map_or(0, Vec::len);
        let updates = self.merge_publication(publication, Some(peer_name));
        AreaMetrics::incr(&self.metrics.full_sync_success);
        info!(
            area = %self.area,
            peer = %peer_name,
            key_vals,
            missing_keys = missing,
            updates,
            duration_ms = elapsed.as_millis() as u64,
            "full-sync response merged"
        );

        let rec = self.peers.get_mut(peer_name).expect("checked above");
        let (old, new) = rec.transition(PeerSyncEvent::SyncResponseReceived);
        info!(area = %self.area, peer = %peer_name, %old, %new, "peer state change");
        if old == PeerState::Syncing && new == PeerState::Initialized {
            let _ = self.sync_events_tx.send(KvStoreSyncEvent {
                peer_name: peer_name.to_string(),
                area: self.area.clone(),
            });
        }

        // Successful sync doubles the cap: remaining peers sync faster and
        // follow-up diffs are small.
        self.parallel_sync_limit =
            (self.parallel_sync_limit * 2).min(constants::PARALLEL_SYNC_LIMIT_MAX);

        if self.count_peers(PeerState::Idle) > 0 {
            self.sync_retry_at = Some(Instant::now());
        }
        self.check_initialization();
    }

    /// Close the 3-way handshake: ship our copies of the keys the responder
    /// asked to learn back.
    fn finalize_full_sync(&mut self, keys: BTreeSet<String>, peer_name: &str) {
        let mut updates = Publication::new(&self.area);
        for key in &keys {
            if let Some(entry) = self.map.get(key) {
                updates.key_vals.insert(key.clone(), entry.value.clone());
            }
        }
        self.apply_outbound_ttl(&mut updates);
        if updates.key_vals.is_empty() {
            return;
        }

        let Some(rec) = self.peers.get(peer_name) else {
            warn!(area = %self.area, peer = %peer_name, "finalize-sync target vanished");
            return;
        };
        if rec.spec.state == PeerState::Idle || rec.client.is_none() {
            return;
        }
        let client = rec.client.clone().expect("checked above");

        AreaMetrics::incr(&self.metrics.finalize_sync_sent);
        info!(
            area = %self.area,
            peer = %peer_name,
            keys = updates.key_vals.len(),
            "sending finalize-sync"
        );

        let params = KeySetParams {
            key_vals: updates.key_vals,
            node_path: Some(vec![self.node_name.clone()]),
            timestamp_ms: Some(unix_ts_ms()),
            sender_id: Some(self.node_name.clone()),
        };
        let tx = self.self_tx.clone();
        let area = self.area.clone();
        let timeout = self.request_timeout;
        let peer = peer_name.to_string();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, client.set_kv(&area, params)).await {
                Ok(res) => res,
                Err(_) => Err(KvStoreError::transport(&peer, "finalize-sync timeout")),
            };
            let _ = tx
                .send(AreaCommand::PeerCallDone {
                    peer,
                    call: PeerCallOutcome::FinalizeSync(result),
                    elapsed: start.elapsed(),
                })
                .await;
        });
    }

    fn on_peer_call_done(&mut self, peer: String, call: PeerCallOutcome, elapsed: Duration) {
        match call {
            PeerCallOutcome::FullSync(Ok(publication)) => {
                self.on_full_sync_response(&peer, publication, elapsed);
            }
            PeerCallOutcome::FullSync(Err(e)) => {
                AreaMetrics::incr(&self.metrics.full_sync_failure);
                self.on_transport_failure(&peer, "full-sync", e, elapsed);
            }
            PeerCallOutcome::Flood(Ok(())) => {
                debug!(area = %self.area, peer = %peer, "flood ack received");
            }
            PeerCallOutcome::Flood(Err(e)) => {
                AreaMetrics::incr(&self.metrics.flood_failures);
                self.on_transport_failure(&peer, "flood", e, elapsed);
            }
            PeerCallOutcome::FinalizeSync(Ok(())) => {
                debug!(area = %self.area, peer = %peer, "finalize-sync ack received");
            }
            PeerCallOutcome::FinalizeSync(Err(e)) => {
                self.on_transport_failure(&peer, "finalize-sync", e, elapsed);
            }
            PeerCallOutcome::Probe(Ok(())) => {}
            PeerCallOutcome::Probe(Err(e)) => {
                self.on_transport_failure(&peer, "keep-alive", e, elapsed);
            }
        }
    }

    /// Shared failure path for every outbound RPC: reset the client, advance
    /// the backoff, drive the state machine to IDLE, and reschedule the
    /// sync scanner.
    fn on_transport_failure(
        &mut self,
        peer_name: &str,
        context: &'static str,
        error: KvStoreError,
        elapsed: Duration,
    ) {
        let Some(rec) = self.peers.get_mut(peer_name) else {
            AreaMetrics::incr(&self.metrics.stale_responses);
            return;
        };
        info!(
            area = %self.area,
            peer = %peer_name,
            context,
            error = %error,
            duration_ms = elapsed.as_millis() as u64,
            "peer transport failure"
        );

        rec.backoff.report_error();
        rec.client = None;
        rec.api_error_count += 1;
        let (old, new) = rec.transition(PeerSyncEvent::TransportError);
        if old != new {
            info!(area = %self.area, peer = %peer_name, %old, %new, "peer state change");
        }

        // A transport error counts as "done trying" for the initial-sync
        // barrier.
        self.check_initialization();

        self.sync_retry_at = min_deadline(self.sync_retry_at, Some(Instant::now()));
    }

    // ── Peer table ───────────────────────────────────────────────────────

    fn add_peers(&mut self, peers: BTreeMap<String, PeerSpec>) {
        let now = Instant::now();
        for (peer_name, new_spec) in peers {
            match self.peers.entry(peer_name.clone()) {
                std::collections::btree_map::Entry::Occupied(mut occupied) => {
                    let rec = occupied.get_mut();
                    let addr_changed = rec.spec.peer_addr != new_spec.peer_addr
                        || rec.spec.ctrl_port != new_spec.ctrl_port;
                    let client_dead = rec.client.is_none();
                    if addr_changed || client_dead {
                        info!(
                            area = %self.area,
                            peer = %peer_name,
                            old_addr = %rec.spec.endpoint(),
                            new_addr = %new_spec.endpoint(),
                            old_state = %rec.spec.state,
                            "peer re-added, resetting to IDLE"
                        );
                        rec.spec = new_spec;
                        rec.spec.state = PeerState::Idle;
                        rec.client = None;
                    } else {
                        debug!(area = %self.area, peer = %peer_name,
                               "peer re-added with live client, state unchanged");
                    }
                }
                std::collections::btree_map::Entry::Vacant(vacant) => {
                    info!(area = %self.area, peer = %peer_name,
                          addr = %new_spec.endpoint(), "peer added");
                    vacant.insert(PeerRecord::new(new_spec, now));
                }
            }
            let rec = self.peers.get_mut(&peer_name).expect("inserted above");
            if rec.client.is_none() {
                if let Ok(client) = self.factory.create(&peer_name, &rec.spec) {
                    rec.client = Some(client);
                    rec.schedule_keep_alive(now);
                }
            }
        }
        self.sync_retry_at = min_deadline(self.sync_retry_at, Some(now));
        self.check_initialization();
    }

    fn del_peers(&mut self, peers: &[String]) {
        for peer_name in peers {
            // Dropping the record drops the client; any response still in
            // flight resolves against an absent peer and is discarded.
            if self.peers.remove(peer_name).is_some() {
                info!(area = %self.area, peer = %peer_name, "peer deleted");
            } else {
                warn!(area = %self.area, peer = %peer_name, "delete for unknown peer");
            }
        }
        self.check_initialization();
    }

    fn run_keep_alive_probes(&mut self, now: Instant) {
        let due: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, rec)| rec.client.is_some() && rec.keep_alive_at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for peer_name in due {
            let rec = self.peers.get_mut(&peer_name).expect("listed above");
            rec.schedule_keep_alive(now);
            let client = rec.client.clone().expect("filtered above");
            let tx = self.self_tx.clone();
            let timeout = self.request_timeout;
            tokio::spawn(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(timeout, client.get_status()).await {
                    Ok(res) => res,
                    Err(_) => Err(KvStoreError::transport(&peer_name, "keep-alive timeout")),
                };
                let _ = tx
                    .send(AreaCommand::PeerCallDone {
                        peer: peer_name,
                        call: PeerCallOutcome::Probe(result),
                        elapsed: start.elapsed(),
                    })
                    .await;
            });
        }
    }

    // ── Initialization barrier ───────────────────────────────────────────

    /// The area has finished its initial sync once every peer has either
    /// reached INITIALIZED or recorded a transport error. Zero peers is
    /// vacuously complete.
    fn check_initialization(&mut self) {
        if self.initial_sync_completed {
            return;
        }
        let mut synced = 0usize;
        let mut failed = 0usize;
        for rec in self.peers.values() {
            if rec.spec.state == PeerState::Initialized {
                synced += 1;
            } else if rec.api_error_count > 0 {
                failed += 1;
            } else {
                return;
            }
        }
        self.initial_sync_completed = true;
        info!(
            area = %self.area,
            synced,
            failed,
            "initial sync completed"
        );
        self.barrier.area_synced(&self.area);
    }

    // ── Self-originated keys ─────────────────────────────────────────────

    /// Idempotent "this key is mine": adopt or create the record, bump past
    /// any foreign incarnation, and schedule a batched advertisement.
    fn persist_key(&mut self, key: String, payload: Vec<u8>) {
        let now = Instant::now();
        let mut should_advertise = false;

        let mut value = match self.self_originated.get(&key) {
            Some(entry) => {
                if entry.value.payload.as_deref() == Some(payload.as_slice()) {
                    // Unchanged re-persist: no state change, no
                    // advertisement.
                    return;
                }
                entry.value.clone()
            }
            None => match self.map.get(&key) {
                // Learned from a previous incarnation of this node (or a
                // competing one): adopt it as the base.
                Some(entry) => entry.value.clone(),
                None => {
                    should_advertise = true;
                    VersionedValue::new(
                        1,
                        self.node_name.clone(),
                        Some(payload.clone()),
                        self.cfg.key_ttl_ms,
                    )
                }
            },
        };

        if value.originator_id != self.node_name
            || value.payload.as_deref() != Some(payload.as_slice())
        {
            value.version += 1;
            value.ttl_version = 0;
            value.payload = Some(payload);
            value.originator_id = self.node_name.clone();
            value.content_hash = None;
            should_advertise = true;
        }

        let ttl_changed = value.ttl_ms != self.cfg.key_ttl_ms;
        value.ttl_ms = self.cfg.key_ttl_ms;

        match self.self_originated.entry(key.clone()) {
            std::collections::btree_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value = value;
                entry.reset_key_backoff();
            }
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(SelfOriginatedEntry::new(value, self.cfg.key_ttl_ms));
            }
        }

        if should_advertise {
            self.keys_to_advertise.insert(key.clone());
        }
        self.advertise_at = min_deadline(
            self.advertise_at,
            Some(now + constants::SELF_ADVERTISE_THROTTLE),
        );
        self.schedule_ttl_updates(&key, ttl_changed, now);
    }

    /// Forceful set: advertise at the given version (or current + 1).
    fn set_self_originated_key(&mut self, key: String, payload: Vec<u8>, version: i64) {
        let version = if version != 0 {
            version
        } else {
            self.map.get(&key).map_or(1, |e| e.value.version + 1)
        };
        let value = VersionedValue::new(
            version,
            self.node_name.clone(),
            Some(payload),
            self.cfg.key_ttl_ms,
        );

        self.self_originated.insert(
            key.clone(),
            SelfOriginatedEntry::new(value.clone(), self.cfg.key_ttl_ms),
        );

        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.clone(), value);
        self.ingest_set(KeySetParams {
            key_vals,
            ..Default::default()
        });
        self.schedule_ttl_updates(&key, false, Instant::now());
    }

    /// Authoritatively overwrite with a tombstone payload and stop
    /// refreshing the key. Batched through the unset throttle; a persist
    /// landing inside the window wins over the tombstone.
    fn unset_key(&mut self, key: String, payload: Vec<u8>) {
        self.erase_key(&key);

        let Some(entry) = self.map.get(&key) else {
            return;
        };
        let mut value = entry.value.clone();
        value.originator_id = self.node_name.clone();
        value.version += 1;
        value.ttl_version = 0;
        value.payload = Some(payload);
        value.content_hash = None;

        self.keys_to_unset.insert(key, value);
        self.unset_drain_at = min_deadline(
            self.unset_drain_at,
            Some(Instant::now() + constants::UNSET_THROTTLE),
        );
    }

    /// Drop a key from the cache without advertising anything.
    fn erase_key(&mut self, key: &str) {
        self.self_originated.remove(key);
        self.keys_to_advertise.remove(key);
    }

    fn drain_unset_keys(&mut self) {
        if self.keys_to_unset.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.keys_to_unset);
        let mut key_vals = BTreeMap::new();
        for (key, value) in pending {
            // Re-persisted inside the throttle window: the persist wins and
            // the tombstone is dropped.
            if self.self_originated.contains_key(&key) {
                continue;
            }
            debug!(area = %self.area, key = %key, "unsetting key");
            key_vals.insert(key, value);
        }
        if !key_vals.is_empty() {
            self.ingest_set(KeySetParams {
                key_vals,
                ..Default::default()
            });
        }
    }

    fn schedule_ttl_updates(&mut self, key: &str, advertise_immediately: bool, now: Instant) {
        if let Some(entry) = self.self_originated.get_mut(key) {
            entry.reschedule_ttl_refresh(self.cfg.key_ttl_ms, !advertise_immediately);
        }
        self.ttl_refresh_at = min_deadline(self.ttl_refresh_at, Some(now));
    }

    /// Drain the pending-advertisement set, respecting each key's backoff.
    fn advertise_pending_keys(&mut self, now: Instant) {
        if self.keys_to_advertise.is_empty() {
            return;
        }
        let mut timeout = constants::MAX_BACKOFF;
        let mut key_vals = BTreeMap::new();
        let mut advertised = Vec::new();

        for key in self.keys_to_advertise.iter() {
            let Some(entry) = self.self_originated.get_mut(key) else {
                advertised.push(key.clone());
                continue;
            };
            if !entry.key_backoff.can_try_now() {
                timeout = timeout.min(entry.key_backoff.time_remaining_until_retry());
                continue;
            }
            entry.key_backoff.report_error();
            timeout = timeout.min(entry.key_backoff.time_remaining_until_retry());
            debug!(area = %self.area, key = %key, version = entry.value.version,
                   "advertising self-originated key");
            key_vals.insert(key.clone(), entry.value.clone());
            advertised.push(key.clone());
        }

        for key in &advertised {
            self.keys_to_advertise.remove(key);
        }
        if !key_vals.is_empty() {
            self.ingest_set(KeySetParams {
                key_vals,
                ..Default::default()
            });
        }
        if !self.keys_to_advertise.is_empty() {
            self.advertise_at = Some(now + timeout);
        }
    }

    /// Advertise value-less TTL refreshes for cached keys whose quarter-ttl
    /// backoff is ready.
    fn advertise_ttl_refreshes(&mut self, now: Instant) {
        let mut timeout = constants::MAX_TTL_UPDATE_INTERVAL;
        let mut key_vals = BTreeMap::new();

        for (key, entry) in self.self_originated.iter_mut() {
            if !entry.ttl_backoff.can_try_now() {
                timeout = timeout.min(entry.ttl_backoff.time_remaining_until_retry());
                continue;
            }
            entry.ttl_backoff.report_error();
            timeout = timeout.min(entry.ttl_backoff.time_remaining_until_retry());

            entry.value.ttl_version += 1;
            let mut refresh = VersionedValue::new(
                entry.value.version,
                self.node_name.clone(),
                None,
                entry.value.ttl_ms,
            );
            refresh.ttl_version = entry.value.ttl_version;
            key_vals.insert(key.clone(), refresh);
        }

        if !key_vals.is_empty() {
            debug!(area = %self.area, keys = key_vals.len(), "advertising ttl refreshes");
            self.ingest_set(KeySetParams {
                key_vals,
                ..Default::default()
            });
        }
        if !self.self_originated.is_empty() {
            self.ttl_refresh_at = Some(now + timeout);
        }
    }

    /// A publication touched keys we originate: reassert authority by
    /// bumping past any competing version, or absorb the higher
    /// ttl_version.
    fn reconcile_self_originated(&mut self, publication: &Publication) {
        if self.self_originated.is_empty() {
            return;
        }
        let mut needs_advertise = false;
        for (key, rcvd) in &publication.key_vals {
            if rcvd.payload.is_none() {
                continue;
            }
            let Some(entry) = self.self_originated.get_mut(key) else {
                continue;
            };

            let should_override = if entry.value.version > rcvd.version {
                false
            } else if entry.value.version < rcvd.version {
                true
            } else {
                rcvd.originator_id != self.node_name || entry.value.payload != rcvd.payload
            };

            if should_override {
                entry.value.version = rcvd.version + 1;
                entry.value.ttl_version = 0;
                entry.value.content_hash = None;
                self.keys_to_advertise.insert(key.clone());
                needs_advertise = true;
                info!(
                    area = %self.area,
                    key = %key,
                    rcvd_version = rcvd.version,
                    rcvd_originator = %rcvd.originator_id,
                    "reasserting self-originated key"
                );
            } else if entry.value.ttl_version < rcvd.ttl_version {
                entry.value.ttl_version = rcvd.ttl_version;
            }
        }
        if needs_advertise {
            self.advertise_at = min_deadline(
                self.advertise_at,
                Some(Instant::now() + constants::SELF_ADVERTISE_THROTTLE),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InitializationBarrier;
    use crate::transport::{PeerClient, PeerClientFactory};
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl PeerClient for NullClient {
        async fn get_kv(&self, _area: &str, _params: KeyDumpParams) -> KvStoreResult<Publication> {
            Err(KvStoreError::transport("null", "unreachable"))
        }
        async fn set_kv(&self, _area: &str, _params: KeySetParams) -> KvStoreResult<()> {
            Ok(())
        }
        async fn get_status(&self) -> KvStoreResult<()> {
            Ok(())
        }
    }

    struct NullFactory;

    impl PeerClientFactory for NullFactory {
        fn create(
            &self,
            _peer_name: &str,
            _spec: &PeerSpec,
        ) -> KvStoreResult<Arc<dyn PeerClient>> {
            Ok(Arc::new(NullClient))
        }
    }

    fn test_db() -> (AreaDb, broadcast::Receiver<KvStorePublication>) {
        let cfg = Arc::new(KvStoreConfig {
            node_name: "node-a".into(),
            areas: vec!["1".into()],
            key_ttl_ms: 40_000,
            ..Default::default()
        });
        let (pub_tx, pub_rx) = broadcast::channel(64);
        let (sync_tx, _) = broadcast::channel(64);
        let barrier = Arc::new(InitializationBarrier::new(
            ["1".to_string()].into_iter().collect(),
            pub_tx.clone(),
        ));
        let (tx, _rx) = mpsc::channel(64);
        let db = AreaDb::new(
            "1".into(),
            cfg,
            Arc::new(NullFactory),
            pub_tx,
            sync_tx,
            barrier,
            Arc::new(AreaMetrics::default()),
            tx,
        );
        (db, pub_rx)
    }

    fn set_params(key: &str, value: VersionedValue) -> KeySetParams {
        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.to_string(), value);
        KeySetParams {
            key_vals,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ingest_fills_hash_and_stores() {
        let (mut db, _rx) = test_db();
        db.ingest_set(set_params(
            "k",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000),
        ));
        let entry = db.map.get("k").unwrap();
        assert!(entry.value.content_hash.is_some());
        assert!(entry.expires_at.is_some());
        assert_eq!(db.ttl_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_get_applies_outbound_decrement() {
        let (mut db, _rx) = test_db();
        db.ingest_set(set_params(
            "k",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000),
        ));
        let publication = db.get_key_vals(&["k".to_string()]);
        let ttl = publication.key_vals["k"].ttl_ms;
        assert!((9_999..10_000).contains(&ttl), "ttl={ttl}");
    }

    #[tokio::test]
    async fn test_looped_publication_dropped() {
        let (mut db, _rx) = test_db();
        let mut publication = Publication::new("1");
        publication.key_vals.insert(
            "k".into(),
            VersionedValue::new(1, "node-b", Some(b"v".to_vec()), 10_000),
        );
        publication.node_path = Some(vec!["node-a".into(), "node-b".into()]);
        let updates = db.merge_publication(publication, None);
        assert_eq!(updates, 0);
        assert!(db.map.is_empty());
        assert_eq!(db.metrics.snapshot().looped_publications, 1);
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let (mut db, _rx) = test_db();
        db.persist_key("k".into(), b"v".to_vec());
        assert_eq!(db.keys_to_advertise.len(), 1);
        let version = db.self_originated["k"].value.version;

        // advertise and re-persist the same payload
        db.advertise_pending_keys(Instant::now());
        assert!(db.keys_to_advertise.is_empty());
        db.persist_key("k".into(), b"v".to_vec());
        assert!(db.keys_to_advertise.is_empty());
        assert_eq!(db.self_originated["k"].value.version, version);
    }

    #[tokio::test]
    async fn test_persist_adopts_foreign_record() {
        let (mut db, _rx) = test_db();
        // a previous incarnation's record is in the map
        db.ingest_set(set_params(
            "k",
            VersionedValue::new(3, "node-old", Some(b"stale".to_vec()), 10_000),
        ));
        db.persist_key("k".into(), b"fresh".to_vec());
        let cached = &db.self_originated["k"].value;
        assert_eq!(cached.version, 4);
        assert_eq!(cached.originator_id, "node-a");
        assert_eq!(cached.ttl_version, 0);
        assert!(db.keys_to_advertise.contains("k"));
    }

    #[tokio::test]
    async fn test_unset_after_persist_in_window_keeps_persist() {
        let (mut db, _rx) = test_db();
        db.persist_key("k".into(), b"v".to_vec());
        db.advertise_pending_keys(Instant::now());
        assert!(db.map.contains_key("k"));

        db.unset_key("k".into(), b"tombstone".to_vec());
        // persist again inside the throttle window
        db.persist_key("k".into(), b"v2".to_vec());
        db.drain_unset_keys();

        // the tombstone was skipped: cache still owns the key
        assert!(db.self_originated.contains_key("k"));
        assert_eq!(
            db.self_originated["k"].value.payload,
            Some(b"v2".to_vec())
        );
    }

    #[tokio::test]
    async fn test_unset_without_repersist_advertises_tombstone() {
        let (mut db, _rx) = test_db();
        db.persist_key("k".into(), b"v".to_vec());
        db.advertise_pending_keys(Instant::now());
        let old_version = db.map["k"].value.version;

        db.unset_key("k".into(), b"gone".to_vec());
        db.drain_unset_keys();

        assert!(!db.self_originated.contains_key("k"));
        let entry = &db.map["k"];
        assert_eq!(entry.value.payload, Some(b"gone".to_vec()));
        assert_eq!(entry.value.version, old_version + 1);
    }

    #[tokio::test]
    async fn test_reconcile_bumps_past_competing_update() {
        let (mut db, _rx) = test_db();
        db.persist_key("k".into(), b"mine".to_vec());
        db.advertise_pending_keys(Instant::now());
        assert_eq!(db.self_originated["k"].value.version, 1);

        // a competitor floods version 5 for our key
        let mut publication = Publication::new("1");
        publication.key_vals.insert(
            "k".into(),
            VersionedValue::new(5, "node-b", Some(b"theirs".to_vec()), 10_000),
        );
        db.reconcile_self_originated(&publication);

        let cached = &db.self_originated["k"].value;
        assert_eq!(cached.version, 6);
        assert_eq!(cached.ttl_version, 0);
        assert_eq!(cached.payload, Some(b"mine".to_vec()));
        assert!(db.keys_to_advertise.contains("k"));
    }

    #[tokio::test]
    async fn test_reconcile_tracks_higher_ttl_version() {
        let (mut db, _rx) = test_db();
        db.persist_key("k".into(), b"mine".to_vec());
        db.advertise_pending_keys(Instant::now());

        let mut echoed = db.self_originated["k"].value.clone();
        echoed.ttl_version = 9;
        let mut publication = Publication::new("1");
        publication.key_vals.insert("k".into(), echoed);
        db.reconcile_self_originated(&publication);

        assert_eq!(db.self_originated["k"].value.ttl_version, 9);
        assert!(!db.keys_to_advertise.contains("k"));
    }

    #[tokio::test]
    async fn test_flood_queues_pending_for_uninitialized_peer() {
        let (mut db, _rx) = test_db();
        db.add_peers(
            [("node-b".to_string(), PeerSpec::new("10.0.0.2", 6262))]
                .into_iter()
                .collect(),
        );
        // peer exists but is IDLE; a local write must queue its key
        db.ingest_set(set_params(
            "k",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000),
        ));
        assert!(db.peers["node-b"].pending_keys.contains("k"));
    }

    #[tokio::test]
    async fn test_expiry_publishes_internally_only() {
        let (mut db, mut rx) = test_db();
        db.ingest_set(set_params(
            "k",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 5),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        db.evict_expired_keys(Instant::now());
        assert!(db.map.is_empty());

        // skip the initial delta publication, then expect the expiry
        let mut saw_expiry = false;
        while let Ok(event) = rx.try_recv() {
            if let KvStorePublication::Publication(p) = event {
                if p.expired_keys == vec!["k".to_string()] && p.key_vals.is_empty() {
                    saw_expiry = true;
                }
            }
        }
        assert!(saw_expiry);
    }

    #[tokio::test]
    async fn test_rate_limited_flood_buffers() {
        let (mut db, _rx) = test_db();
        db.flood_limiter = Some(FloodLimiter::new(kestrel_common::config::FloodRate {
            msgs_per_sec: 1,
            burst: 1,
        }));
        db.ingest_set(set_params(
            "k1",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000),
        ));
        // token spent; the next publication must buffer
        db.ingest_set(set_params(
            "k2",
            VersionedValue::new(1, "node-a", Some(b"v".to_vec()), 10_000),
        ));
        assert!(db.flood_buffer.contains("k2"));
        assert!(db.flood_drain_at.is_some());

        // the drain ships the buffered key from the live map
        db.drain_flood_buffer(Instant::now());
        assert!(db.flood_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_zero_peer_initialization() {
        let (mut db, mut rx) = test_db();
        assert!(!db.initial_sync_completed);
        db.check_initialization();
        assert!(db.initial_sync_completed);
        match rx.try_recv() {
            Ok(KvStorePublication::InitializationEvent(e)) => {
                assert_eq!(e, crate::events::InitializationEvent::KvStoreSynced);
            }
            other => panic!("expected initialization event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_sync_response_ignored() {
        let (mut db, _rx) = test_db();
        // response for a peer that was deleted mid-flight
        db.on_full_sync_response("ghost", Publication::new("1"), Duration::ZERO);
        assert_eq!(db.metrics.snapshot().stale_responses, 1);
        assert!(db.peers.is_empty());
    }
}
